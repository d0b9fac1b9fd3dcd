//! Campaign persistence as seen by the engine.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    campaign::{Campaign, CampaignId, RecipientRow},
    error::StoreError,
    run::{RunId, RunSnapshot},
};

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// # Errors
    ///
    /// [`StoreError::CampaignNotFound`] for unknown ids, or a backend error.
    async fn campaign(&self, id: CampaignId) -> Result<Campaign, StoreError>;

    /// Uploaded rows, in upload order
    ///
    /// # Errors
    ///
    /// [`StoreError::CampaignNotFound`] for unknown ids, or a backend error.
    async fn recipients(&self, id: CampaignId) -> Result<Vec<RecipientRow>, StoreError>;

    /// Persist the final state of a run
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend rejects the write.
    async fn record_run(&self, snapshot: &RunSnapshot) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryCampaignStore {
    campaigns: RwLock<HashMap<CampaignId, (Campaign, Vec<RecipientRow>)>>,
    runs: RwLock<HashMap<RunId, RunSnapshot>>,
}

impl MemoryCampaignStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a campaign with its rows; returns its id
    pub fn insert(&self, campaign: Campaign, rows: Vec<RecipientRow>) -> CampaignId {
        let id = campaign.id;
        self.campaigns.write().insert(id, (campaign, rows));
        id
    }

    #[must_use]
    pub fn run(&self, id: RunId) -> Option<RunSnapshot> {
        self.runs.read().get(&id).cloned()
    }

    /// Runs recorded for a campaign, oldest first
    #[must_use]
    pub fn runs_for(&self, campaign: CampaignId) -> Vec<RunSnapshot> {
        let mut runs: Vec<_> = self
            .runs
            .read()
            .values()
            .filter(|snapshot| snapshot.campaign_id == campaign)
            .cloned()
            .collect();
        runs.sort_by_key(|snapshot| snapshot.started_at);
        runs
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn campaign(&self, id: CampaignId) -> Result<Campaign, StoreError> {
        self.campaigns
            .read()
            .get(&id)
            .map(|(campaign, _)| campaign.clone())
            .ok_or(StoreError::CampaignNotFound(id))
    }

    async fn recipients(&self, id: CampaignId) -> Result<Vec<RecipientRow>, StoreError> {
        self.campaigns
            .read()
            .get(&id)
            .map(|(_, rows)| rows.clone())
            .ok_or(StoreError::CampaignNotFound(id))
    }

    async fn record_run(&self, snapshot: &RunSnapshot) -> Result<(), StoreError> {
        self.runs.write().insert(snapshot.run_id, snapshot.clone());
        Ok(())
    }
}
