use std::sync::{Arc, LazyLock};

use herald_common::{Signal, internal, tracing};
use herald_delivery::{
    Accepted, AttemptLog, AttemptOutcome, CampaignStore, Engine, Event, EventLevel, EventStream,
    FileAttemptLog, LogTransport, MemoryAttemptLog, MemoryCampaignStore, RunSnapshot, StopOutcome,
    Transport,
};
use tokio::sync::broadcast;

use crate::config::{CampaignFile, HeraldConfig};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Wait for Ctrl-C or SIGTERM and tell every listener to shut down
///
/// # Errors
///
/// If the signal handlers cannot be installed.
pub async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, stopping the run after in-flight sends");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, stopping the run");
        }
    };

    // No receivers just means nothing is running yet
    let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

    Ok(())
}

/// Command-line front end over one [`Engine`]
pub struct Herald {
    engine: Engine,
    store: Arc<MemoryCampaignStore>,
}

impl Herald {
    /// Engine backed by the dry-run [`LogTransport`]
    #[must_use]
    pub fn new(config: HeraldConfig) -> Self {
        Self::with_transport(config, Arc::new(LogTransport))
    }

    #[must_use]
    pub fn with_transport(config: HeraldConfig, transport: Arc<dyn Transport>) -> Self {
        let log: Arc<dyn AttemptLog> = match &config.log_path {
            Some(path) => {
                internal!(level = INFO, "Recording attempts to {}", path.display());
                Arc::new(FileAttemptLog::new(path))
            }
            None => Arc::new(MemoryAttemptLog::new()),
        };
        let store = Arc::new(MemoryCampaignStore::new());

        let engine = Engine::new(
            config.engine,
            Arc::clone(&store) as Arc<dyn CampaignStore>,
            log,
            transport,
        );

        Self { engine, store }
    }

    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run the campaign to the end, or until `shutdown` carries
    /// [`Signal::Shutdown`], in which case the run is stopped gracefully.
    ///
    /// # Errors
    ///
    /// If the run cannot be started.
    pub async fn run(
        &self,
        file: CampaignFile,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> anyhow::Result<RunSnapshot> {
        let campaign_id = self.store.insert(file.campaign, file.recipients);
        let run_id = self.engine.start_run(campaign_id).await?;
        let reporter = tokio::spawn(report(self.engine.subscribe_events(run_id)?));

        let snapshot = tokio::select! {
            snapshot = self.engine.wait(run_id) => snapshot?,
            signal = shutdown.recv() => {
                tracing::debug!("Received {signal:?}");
                if self.engine.stop_run(run_id)? == StopOutcome::Accepted {
                    internal!(level = INFO, "Stopping run {run_id}");
                }
                self.engine.wait(run_id).await?
            }
        };

        if let Err(e) = reporter.await {
            tracing::warn!("Event reporter for run {run_id} failed: {e}");
        }

        Ok(snapshot)
    }

    /// Send one rendered message of the campaign to `to`
    ///
    /// # Errors
    ///
    /// If `to` is invalid or the transport rejects the message.
    pub async fn send_test(&self, file: CampaignFile, to: &str) -> anyhow::Result<Accepted> {
        let campaign_id = self.store.insert(file.campaign, file.recipients);
        Ok(self.engine.send_test(campaign_id, to, file.sample).await?)
    }
}

/// Mirror run events into the log until the run ends
async fn report(mut events: EventStream) {
    while let Some(event) = events.next().await {
        match event {
            Event::Attempt { record, counters } => match record.outcome {
                AttemptOutcome::Success => internal!(
                    level = INFO,
                    "Sent to {} (try {}) [{} sent, {} failed, {} queued]",
                    record.recipient,
                    record.try_number,
                    counters.sent,
                    counters.failed,
                    counters.queued
                ),
                AttemptOutcome::TransientFailure => internal!(
                    level = WARN,
                    "Try {} for {} failed: {}",
                    record.try_number,
                    record.recipient,
                    record.error.as_deref().unwrap_or("unknown error")
                ),
                AttemptOutcome::PermanentFailure => internal!(
                    level = ERROR,
                    "Giving up on {}: {}",
                    record.recipient,
                    record.error.as_deref().unwrap_or("unknown error")
                ),
            },
            Event::Status { status, reason, .. } => match reason {
                Some(reason) => internal!(level = INFO, "Run is now {status}: {reason}"),
                None => internal!(level = INFO, "Run is now {status}"),
            },
            Event::Notice { level, message, .. } => match level {
                EventLevel::Info | EventLevel::Success => internal!(level = INFO, "{message}"),
                EventLevel::Warning => internal!(level = WARN, "{message}"),
                EventLevel::Error => internal!(level = ERROR, "{message}"),
            },
        }
    }
}
