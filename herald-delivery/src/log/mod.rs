//! Durable, append-only record of every delivery attempt.
//!
//! The log is also the campaign checkpoint: addresses with a successful
//! attempt are skipped when the campaign is run again.

mod file;
mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::{file::FileAttemptLog, memory::MemoryAttemptLog};
use crate::{campaign::CampaignId, error::LogError, run::RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// One try for one recipient. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub run_id: RunId,
    pub campaign_id: CampaignId,
    pub recipient: String,
    /// 1-based
    pub try_number: u32,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Backoff scheduled after a transient failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_ms: Option<u64>,
}

impl AttemptRecord {
    /// Whether this attempt ends the recipient's retry chain
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.outcome,
            AttemptOutcome::Success | AttemptOutcome::PermanentFailure
        )
    }
}

#[async_trait]
pub trait AttemptLog: Send + Sync {
    /// Append one record. Safe to call from many workers at once.
    ///
    /// # Errors
    ///
    /// Returns a [`LogError`] if the record could not be persisted.
    async fn append(&self, record: &AttemptRecord) -> Result<(), LogError>;

    /// Every record of a run, in append order
    ///
    /// # Errors
    ///
    /// Returns a [`LogError`] if the backing storage could not be read.
    async fn run_records(&self, run_id: RunId) -> Result<Vec<AttemptRecord>, LogError>;

    /// Addresses with a successful attempt in any run of the campaign
    ///
    /// # Errors
    ///
    /// Returns a [`LogError`] if the backing storage could not be read.
    async fn delivered(&self, campaign_id: CampaignId) -> Result<HashSet<String>, LogError>;
}
