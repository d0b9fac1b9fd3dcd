use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{AttemptLog, AttemptOutcome, AttemptRecord};
use crate::{campaign::CampaignId, error::LogError, run::RunId};

/// In-process attempt log, lost on exit
#[derive(Debug, Default)]
pub struct MemoryAttemptLog {
    records: RwLock<Vec<AttemptRecord>>,
}

impl MemoryAttemptLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far
    #[must_use]
    pub fn all(&self) -> Vec<AttemptRecord> {
        self.records.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl AttemptLog for MemoryAttemptLog {
    async fn append(&self, record: &AttemptRecord) -> Result<(), LogError> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn run_records(&self, run_id: RunId) -> Result<Vec<AttemptRecord>, LogError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|record| record.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn delivered(&self, campaign_id: CampaignId) -> Result<HashSet<String>, LogError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.campaign_id == campaign_id && r.outcome == AttemptOutcome::Success)
            .map(|r| r.recipient.clone())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn record(
        run_id: RunId,
        campaign_id: CampaignId,
        to: &str,
        outcome: AttemptOutcome,
    ) -> AttemptRecord {
        AttemptRecord {
            run_id,
            campaign_id,
            recipient: to.to_string(),
            try_number: 1,
            outcome,
            timestamp: Utc::now(),
            error: None,
            provider_id: None,
            next_retry_ms: None,
        }
    }

    #[tokio::test]
    async fn test_memory_log_filters_by_run_and_campaign() {
        let log = MemoryAttemptLog::new();
        let campaign = CampaignId::generate();
        let first = RunId::generate();
        let second = RunId::generate();

        log.append(&record(first, campaign, "a@example.com", AttemptOutcome::Success))
            .await
            .unwrap();
        log.append(&record(first, campaign, "b@example.com", AttemptOutcome::PermanentFailure))
            .await
            .unwrap();
        log.append(&record(second, campaign, "c@example.com", AttemptOutcome::Success))
            .await
            .unwrap();
        log.append(&record(second, CampaignId::generate(), "d@example.com", AttemptOutcome::Success))
            .await
            .unwrap();

        assert_eq!(log.len(), 4);
        assert_eq!(log.run_records(first).await.unwrap().len(), 2);

        let delivered = log.delivered(campaign).await.unwrap();
        assert_eq!(
            delivered,
            HashSet::from(["a@example.com".to_string(), "c@example.com".to_string()])
        );
    }
}
