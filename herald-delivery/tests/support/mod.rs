//! Shared fixtures for engine tests
#![allow(dead_code)] // Not every helper is used by every test binary

use std::sync::Arc;

use herald_delivery::{
    AttemptLog, Campaign, CampaignId, CampaignStore, Engine, EngineConfig, Event, EventStream, MemoryAttemptLog,
    MemoryCampaignStore, Mode, RecipientRow, Transport, template::Template,
    transport::ScriptedTransport,
};

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryCampaignStore>,
    pub log: Arc<MemoryAttemptLog>,
    pub transport: Arc<ScriptedTransport>,
}

impl Harness {
    pub fn new(transport: ScriptedTransport) -> Self {
        Self::with_config(EngineConfig::default(), transport)
    }

    pub fn with_config(config: EngineConfig, transport: ScriptedTransport) -> Self {
        let store = Arc::new(MemoryCampaignStore::new());
        let log = Arc::new(MemoryAttemptLog::new());
        let transport = Arc::new(transport);

        let engine = Engine::new(
            config,
            Arc::clone(&store) as Arc<dyn CampaignStore>,
            Arc::clone(&log) as Arc<dyn AttemptLog>,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        Self {
            engine,
            store,
            log,
            transport,
        }
    }

    pub fn add(&self, campaign: Campaign, rows: Vec<RecipientRow>) -> CampaignId {
        self.store.insert(campaign, rows)
    }
}

/// A real-mode campaign with `workers` workers
pub fn campaign(workers: usize) -> Campaign {
    let mut campaign = Campaign::new(
        "Launch",
        Template::new("Hello {{name}}", "<p>Dear {{name}},</p><p>News for {{email}}</p>"),
    );
    campaign.mode = Mode::Real;
    campaign.concurrency = workers;
    campaign
}

/// `count` rows at example.com, which carries no throttling
pub fn rows(count: usize) -> Vec<RecipientRow> {
    (0..count)
        .map(|i| RecipientRow::new(format!("user{i}@example.com")).with_variable("name", format!("User{i}")))
        .collect()
}

/// Drain a stream until the run ends
pub async fn collect(mut events: EventStream) -> Vec<Event> {
    let mut collected = Vec::new();
    while let Some(event) = events.next().await {
        collected.push(event);
    }
    collected
}
