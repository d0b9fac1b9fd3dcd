use herald_common::audit::AuditConfig;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    policy::{DomainThrottleRegistry, RetryPolicy},
    transport::SenderIdentity,
};

/// Hard limit on workers per run, whatever the configuration says
pub const WORKER_LIMIT: usize = 20;

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for a campaign's worker count, at most [`WORKER_LIMIT`]
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-subscriber event buffer; older events are dropped past this
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Used by campaigns that do not carry their own policy
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "DomainThrottleRegistry::webmail")]
    pub domains: DomainThrottleRegistry,

    #[serde(default)]
    pub sender: SenderIdentity,

    /// `List-Unsubscribe` target; `{{email}}` is replaced per recipient
    #[serde(default)]
    pub unsubscribe_url: Option<String>,

    #[serde(default)]
    pub audit: AuditConfig,
}

const fn default_max_concurrency() -> usize {
    20
}

const fn default_event_buffer() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            event_buffer: default_event_buffer(),
            retry: RetryPolicy::default(),
            domains: DomainThrottleRegistry::webmail(),
            sender: SenderIdentity::default(),
            unsubscribe_url: None,
            audit: AuditConfig::default(),
        }
    }
}

impl EngineConfig {
    /// # Errors
    ///
    /// [`ConfigError::MaxConcurrency`] when `max_concurrency` is outside
    /// `1..=WORKER_LIMIT`, or the fallback retry policy's error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=WORKER_LIMIT).contains(&self.max_concurrency) {
            return Err(ConfigError::MaxConcurrency {
                value: self.max_concurrency,
                limit: WORKER_LIMIT,
            });
        }

        self.retry.validate()
    }
}
