//! Audit logging for campaign delivery events
//!
//! Every attempt, its outcome, and each run state change is emitted as a
//! structured `tracing` event under the `herald::audit` target so operators
//! can route it separately from engine chatter.
//!
//! ## Audit Events
//!
//! - `DeliveryAttempt`: A send is about to be handed to the transport
//! - `DeliverySuccess`: The transport accepted the message
//! - `DeliveryFailure`: The transport refused the message (terminal or not)
//! - `RunTransition`: A run moved between lifecycle states
//!
//! Recipient addresses can be redacted through [`AuditConfig`].

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Emit audit events at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replace the local part of recipient addresses with `[REDACTED]`
    #[serde(default)]
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_recipients: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

static AUDIT_CONFIG: OnceLock<Arc<AuditConfig>> = OnceLock::new();

/// Install the process-wide audit configuration. Only the first call wins.
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

/// Redact the local part of an address, keeping the domain for triage
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if !redact {
        return email.to_string();
    }

    email
        .split_once('@')
        .map_or_else(|| "[REDACTED]".to_string(), |(_, domain)| format!("[REDACTED]@{domain}"))
}

pub fn log_delivery_attempt(run_id: &str, recipient: &str, domain: &str, try_number: u32) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        target: "herald::audit",
        tracing::Level::INFO,
        event = "DeliveryAttempt",
        run_id = %run_id,
        recipient = %redact_email(recipient, config.redact_recipients),
        domain = %domain,
        try_number = try_number,
        "Audit: Delivery attempt"
    );
}

pub fn log_delivery_success(
    run_id: &str,
    recipient: &str,
    provider_id: Option<&str>,
    try_number: u32,
    duration_ms: u64,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        target: "herald::audit",
        tracing::Level::INFO,
        event = "DeliverySuccess",
        run_id = %run_id,
        recipient = %redact_email(recipient, config.redact_recipients),
        provider_id = provider_id.unwrap_or("-"),
        try_number = try_number,
        duration_ms = duration_ms,
        "Audit: Delivery accepted"
    );
}

/// `terminal` marks failures that will not be retried in this run
pub fn log_delivery_failure(
    run_id: &str,
    recipient: &str,
    error: &str,
    try_number: u32,
    terminal: bool,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_email(recipient, config.redact_recipients);

    if terminal {
        tracing::event!(
            target: "herald::audit",
            tracing::Level::WARN,
            event = "DeliveryFailure",
            run_id = %run_id,
            recipient = %recipient,
            error = %error,
            try_number = try_number,
            terminal = true,
            "Audit: Delivery failed permanently"
        );
    } else {
        tracing::event!(
            target: "herald::audit",
            tracing::Level::INFO,
            event = "DeliveryFailure",
            run_id = %run_id,
            recipient = %recipient,
            error = %error,
            try_number = try_number,
            terminal = false,
            "Audit: Delivery failed, will retry"
        );
    }
}

pub fn log_run_transition(run_id: &str, campaign_id: &str, from: &str, to: &str) {
    if !config().enabled {
        return;
    }

    tracing::event!(
        target: "herald::audit",
        tracing::Level::INFO,
        event = "RunTransition",
        run_id = %run_id,
        campaign_id = %campaign_id,
        from = %from,
        to = %to,
        "Audit: Run state changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_email() {
        assert_eq!(redact_email("user@example.com", false), "user@example.com");
        assert_eq!(redact_email("user@example.com", true), "[REDACTED]@example.com");
        assert_eq!(redact_email("not-an-address", true), "[REDACTED]");
    }

    #[test]
    fn test_default_config() {
        let config = AuditConfig::default();
        assert!(config.enabled);
        assert!(!config.redact_recipients);
    }

    #[test]
    fn test_logging_does_not_panic_when_disabled() {
        init(AuditConfig {
            enabled: false,
            redact_recipients: true,
        });
        log_delivery_attempt("run", "user@example.com", "example.com", 1);
        log_delivery_failure("run", "user@example.com", "boom", 1, true);
        log_run_transition("run", "campaign", "Running", "Stopped");
    }
}
