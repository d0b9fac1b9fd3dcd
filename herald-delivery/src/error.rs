//! Typed errors for the send engine.
//!
//! Transport failures are classified so the worker can pick a path without
//! inspecting strings:
//! - Transient failures (rate limiting, timeouts, provider 5xx) are retried
//! - Permanent failures (bad address, rejected content) are recorded once
//! - Fatal failures (revoked credentials, misconfiguration) halt the run

use thiserror::Error;

use crate::{campaign::CampaignId, run::RunId};

/// Failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transient failure: {0}")]
    Transient(#[from] TransientError),

    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Not specific to the recipient; the whole run is affected.
    #[error("Fatal transport failure: {0}")]
    Fatal(#[from] FatalError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransientError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Provider error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermanentError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Content rejected: {0}")]
    ContentRejected(String),

    #[error("Rejected {status}: {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Transport misconfigured: {0}")]
    Misconfigured(String),
}

impl TransportError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Classify an HTTP-style status code returned by a provider API.
    ///
    /// - `429`, `408` and any `5xx` are transient
    /// - `401` and `403` are fatal: every following send would fail the same way
    /// - any other `4xx` is a permanent rejection of this message
    /// - anything else is treated as a transient provider fault
    #[must_use]
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            429 => TransientError::RateLimited(message).into(),
            408 => TransientError::Timeout(message).into(),
            401 | 403 => FatalError::Unauthorized(message).into(),
            400..=499 => PermanentError::Rejected { status, message }.into(),
            _ => TransientError::ServerError { status, message }.into(),
        }
    }
}

/// Problems with a campaign or engine setup, reported before a run exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Concurrency must be between 1 and {max}, got {value}")]
    Concurrency { value: usize, max: usize },

    #[error("max_concurrency must be between 1 and {limit}, got {value}")]
    MaxConcurrency { value: usize, limit: usize },

    #[error("Campaign {0} must not be empty")]
    EmptyField(&'static str),

    #[error("Demo mode requires at least one test address")]
    NoDemoAddresses,

    #[error("Invalid demo address '{0}'")]
    InvalidDemoAddress(String),

    #[error("Invalid retry policy: {0}")]
    RetryPolicy(String),

    #[error("Batch size must be at least 1")]
    BatchSize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Campaign {0} not found")]
    CampaignNotFound(CampaignId),

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Attempt log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Attempt log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the [`Engine`](crate::Engine) control operations.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Campaign {campaign} already has an active run ({run})")]
    AlreadyActive { campaign: CampaignId, run: RunId },

    #[error("Run {0} not found")]
    NotFound(RunId),

    #[error("Run {0} is not running")]
    NotRunning(RunId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Address(#[from] herald_common::AddressError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        assert!(TransportError::from_status(429, "slow down").is_transient());
        assert!(TransportError::from_status(408, "timeout").is_transient());
        assert!(TransportError::from_status(502, "bad gateway").is_transient());
        assert!(TransportError::from_status(401, "bad key").is_fatal());
        assert!(TransportError::from_status(403, "forbidden").is_fatal());
        assert!(TransportError::from_status(400, "bad request").is_permanent());
        assert!(TransportError::from_status(422, "invalid to").is_permanent());
    }

    #[test]
    fn test_status_is_preserved() {
        let error = TransportError::from_status(503, "maintenance");
        assert_eq!(
            error,
            TransportError::Transient(TransientError::ServerError {
                status: 503,
                message: "maintenance".to_string()
            })
        );
        assert_eq!(
            error.to_string(),
            "Transient failure: Provider error 503: maintenance"
        );
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Concurrency { value: 50, max: 20 };
        assert_eq!(error.to_string(), "Concurrency must be between 1 and 20, got 50");
    }
}
