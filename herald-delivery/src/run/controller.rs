//! The engine: owns every run and the operations exposed to operators.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use herald_common::{Address, internal};
use tokio::task::JoinSet;
use tracing::{error, instrument, warn};

use super::{
    RunId, RunSnapshot, RunStatus, StopOutcome, Trigger,
    state::{Control, RunState},
};
use crate::{
    attachment::AttachmentIndex,
    campaign::{CampaignId, Variables},
    config::EngineConfig,
    error::{RunError, TransportError},
    feed::{Recipient, RecipientFeed},
    log::{AttemptLog, AttemptRecord},
    policy::DomainPolicyResolver,
    sink::{EventLevel, EventStream},
    store::CampaignStore,
    template,
    transport::{Accepted, DeliverabilityHeaders, OutboundMessage, Transport},
    worker::{self, WorkerContext},
};

/// A run while it executes, then only its final snapshot
#[derive(Clone)]
enum RunEntry {
    Live(Arc<RunState>),
    Finished(RunSnapshot),
}

impl RunEntry {
    fn snapshot(&self) -> RunSnapshot {
        match self {
            Self::Live(state) => state.snapshot(),
            Self::Finished(snapshot) => snapshot.clone(),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn CampaignStore>,
    log: Arc<dyn AttemptLog>,
    transport: Arc<dyn Transport>,
    runs: DashMap<RunId, RunEntry>,
    /// Campaign → its latest run; guards the one-active-run rule
    active: DashMap<CampaignId, RunId>,
}

/// A claimed campaign slot, released on drop unless the run was registered.
///
/// Covers every early return of `start_run`, including the caller dropping
/// the future while it waits on the log.
struct Reservation<'a> {
    active: &'a DashMap<CampaignId, RunId>,
    campaign_id: CampaignId,
    run_id: RunId,
    held: bool,
}

impl Reservation<'_> {
    fn keep(mut self) {
        self.held = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.held {
            let run_id = self.run_id;
            self.active
                .remove_if(&self.campaign_id, |_, holder| *holder == run_id);
        }
    }
}

/// Campaign send engine.
///
/// Cheap to clone; all clones drive the same set of runs.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("runs", &self.inner.runs.len())
            .field("active", &self.inner.active.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CampaignStore>,
        log: Arc<dyn AttemptLog>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                log,
                transport,
                runs: DashMap::new(),
                active: DashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start a run of `campaign_id`.
    ///
    /// Validation happens before anything is created: a rejected start
    /// leaves no run behind.
    ///
    /// # Errors
    ///
    /// - [`RunError::Store`] if the campaign cannot be loaded
    /// - [`RunError::Config`] if the engine settings or the campaign are
    ///   invalid
    /// - [`RunError::AlreadyActive`] if another run of the campaign is active
    /// - [`RunError::Log`] if the checkpoint cannot be read
    #[instrument(skip(self))]
    pub async fn start_run(&self, campaign_id: CampaignId) -> Result<RunId, RunError> {
        let inner = &self.inner;
        inner.config.validate()?;
        let campaign = inner.store.campaign(campaign_id).await?;
        let rows = inner.store.recipients(campaign_id).await?;
        campaign.validate(inner.config.max_concurrency)?;

        let run_id = RunId::generate();
        let reservation = self.reserve(campaign_id, run_id)?;

        let delivered = inner.log.delivered(campaign_id).await?;
        let attachments = match &campaign.dynamic_attachment {
            Some(dynamic) => AttachmentIndex::build(&dynamic.folder).await,
            None => AttachmentIndex::default(),
        };

        let (feed, report) = RecipientFeed::build(&campaign, &rows, &delivered);
        let feed = Arc::new(feed);
        let state = Arc::new(RunState::new(
            run_id,
            campaign_id,
            Arc::clone(&feed),
            Arc::clone(&inner.log),
            inner.config.event_buffer,
        ));
        inner.runs.insert(run_id, RunEntry::Live(Arc::clone(&state)));
        reservation.keep();

        let columns = feed.columns();
        let unknown: Vec<String> = campaign
            .template
            .variables()
            .into_iter()
            .filter(|name| name != "email" && !columns.contains(name))
            .collect();
        if !unknown.is_empty() {
            warn!(
                "Campaign {campaign_id} uses variables no recipient provides: {}",
                unknown.join(", ")
            );
        }

        internal!(
            level = INFO,
            "Starting run {run_id} of campaign {campaign_id} '{}': {} recipient(s), {} worker(s), {} already delivered, {} invalid, {} duplicate(s)",
            campaign.name,
            feed.total(),
            campaign.concurrency,
            report.already_delivered,
            report.invalid.len(),
            report.duplicates.len()
        );

        state.transition(Trigger::Start, None);
        if !unknown.is_empty() {
            state.notice(
                EventLevel::Warning,
                format!("Template variables without data: {}", unknown.join(", ")),
            );
        }
        if report.already_delivered > 0 {
            state.notice(
                EventLevel::Info,
                format!(
                    "Skipping {} recipient(s) delivered by an earlier run",
                    report.already_delivered
                ),
            );
        }

        let retry = campaign
            .retry
            .clone()
            .unwrap_or_else(|| inner.config.retry.clone());
        let ctx = Arc::new(WorkerContext {
            state: Arc::clone(&state),
            feed,
            resolver: DomainPolicyResolver::new(inner.config.domains.clone(), retry),
            campaign: Arc::new(campaign),
            attachments,
            transport: Arc::clone(&inner.transport),
            sender: inner.config.sender.clone(),
            unsubscribe_url: inner.config.unsubscribe_url.clone(),
        });

        tokio::spawn(supervise(Arc::clone(&self.inner), ctx));

        Ok(run_id)
    }

    /// Claim the campaign's active slot for `run_id`
    fn reserve(&self, campaign_id: CampaignId, run_id: RunId) -> Result<Reservation<'_>, RunError> {
        let active = &self.inner.active;
        match active.entry(campaign_id) {
            Entry::Vacant(slot) => {
                slot.insert(run_id);
            }
            Entry::Occupied(mut slot) => {
                let holder = *slot.get();
                // A slot without a registered run is a start still in progress
                let busy = self.inner.runs.get(&holder).is_none_or(|entry| match entry.value() {
                    RunEntry::Live(state) => !state.status().is_terminal(),
                    RunEntry::Finished(_) => false,
                });

                if busy {
                    return Err(RunError::AlreadyActive {
                        campaign: campaign_id,
                        run: holder,
                    });
                }

                slot.insert(run_id);
            }
        }

        Ok(Reservation {
            active,
            campaign_id,
            run_id,
            held: true,
        })
    }

    fn entry(&self, run_id: RunId) -> Result<RunEntry, RunError> {
        self.inner
            .runs
            .get(&run_id)
            .map(|entry| entry.value().clone())
            .ok_or(RunError::NotFound(run_id))
    }

    /// The live state of a run that may still change status
    fn live(&self, run_id: RunId) -> Result<Option<Arc<RunState>>, RunError> {
        Ok(match self.entry(run_id)? {
            RunEntry::Live(state) => Some(state),
            RunEntry::Finished(_) => None,
        })
    }

    /// Ask a run to stop. Workers finish their current try and exit; the
    /// run becomes `Stopped` once all of them are gone.
    ///
    /// # Errors
    ///
    /// [`RunError::NotFound`] for unknown runs.
    pub fn stop_run(&self, run_id: RunId) -> Result<StopOutcome, RunError> {
        let Some(state) = self.live(run_id)? else {
            return Ok(StopOutcome::NotRunning);
        };

        if state.transition(Trigger::Stop, None).is_some() {
            state.request(Control::Stop);
            Ok(StopOutcome::Accepted)
        } else {
            Ok(StopOutcome::NotRunning)
        }
    }

    /// Workers finish the recipient in hand and wait.
    ///
    /// # Errors
    ///
    /// [`RunError::NotFound`] for unknown runs, [`RunError::NotRunning`]
    /// unless the run is `Running`.
    pub fn pause_run(&self, run_id: RunId) -> Result<RunStatus, RunError> {
        let state = self.live(run_id)?.ok_or(RunError::NotRunning(run_id))?;
        let status = state
            .transition(Trigger::Pause, None)
            .ok_or(RunError::NotRunning(run_id))?;
        state.request(Control::Pause);
        state.notice(EventLevel::Info, "Run paused");
        Ok(status)
    }

    /// # Errors
    ///
    /// [`RunError::NotFound`] for unknown runs, [`RunError::NotRunning`]
    /// unless the run is `Paused`.
    pub fn resume_run(&self, run_id: RunId) -> Result<RunStatus, RunError> {
        let state = self.live(run_id)?.ok_or(RunError::NotRunning(run_id))?;
        let status = state
            .transition(Trigger::Resume, None)
            .ok_or(RunError::NotRunning(run_id))?;
        state.request(Control::Run);
        state.notice(EventLevel::Info, "Run resumed");
        Ok(status)
    }

    /// # Errors
    ///
    /// [`RunError::NotFound`] for unknown runs.
    pub fn get_run_status(&self, run_id: RunId) -> Result<RunSnapshot, RunError> {
        Ok(self.entry(run_id)?.snapshot())
    }

    /// Live events of a run. The stream ends when the run reaches a
    /// terminal status; subscribing to a finished run yields nothing.
    ///
    /// # Errors
    ///
    /// [`RunError::NotFound`] for unknown runs.
    pub fn subscribe_events(&self, run_id: RunId) -> Result<EventStream, RunError> {
        Ok(self
            .live(run_id)?
            .map_or_else(EventStream::closed, |state| state.subscribe()))
    }

    /// All attempts recorded for a run, in order
    ///
    /// # Errors
    ///
    /// [`RunError::Log`] if the log cannot be read, [`RunError::NotFound`]
    /// if the run is neither known nor present in the log.
    pub async fn get_log(&self, run_id: RunId) -> Result<Vec<AttemptRecord>, RunError> {
        let records = self.inner.log.run_records(run_id).await?;
        if records.is_empty() && !self.inner.runs.contains_key(&run_id) {
            return Err(RunError::NotFound(run_id));
        }
        Ok(records)
    }

    /// Resolve once the run is terminal
    ///
    /// # Errors
    ///
    /// [`RunError::NotFound`] for unknown runs.
    pub async fn wait(&self, run_id: RunId) -> Result<RunSnapshot, RunError> {
        match self.entry(run_id)? {
            RunEntry::Live(state) => Ok(state.wait().await),
            RunEntry::Finished(snapshot) => Ok(snapshot),
        }
    }

    /// Send one rendered message of `campaign_id` to `address`, outside any
    /// run and without retries.
    ///
    /// Without `sample`, the first uploaded row provides the variables.
    ///
    /// # Errors
    ///
    /// [`RunError::Address`] for an invalid address, [`RunError::Store`] for
    /// an unknown campaign, [`RunError::Transport`] when the send fails.
    #[instrument(skip(self, sample))]
    pub async fn send_test(
        &self,
        campaign_id: CampaignId,
        address: &str,
        sample: Option<Variables>,
    ) -> Result<Accepted, RunError> {
        let inner = &self.inner;
        let address = Address::parse(address)?;
        let campaign = inner.store.campaign(campaign_id).await?;

        let variables = match sample {
            Some(variables) => variables,
            None => inner
                .store
                .recipients(campaign_id)
                .await?
                .into_iter()
                .next()
                .map(|row| row.variables)
                .unwrap_or_default(),
        };

        let recipient = Recipient {
            address: address.clone(),
            variables: Arc::new(variables),
            source: None,
        };
        let content = template::render(&campaign.template, &recipient);
        let headers = DeliverabilityHeaders::build(
            &inner.config.sender,
            &address,
            campaign_id,
            None,
            inner.config.unsubscribe_url.as_deref(),
        );
        let message = OutboundMessage::new(
            inner.config.sender.clone(),
            address,
            content,
            campaign.attachments.clone(),
            headers,
        );

        let accepted = inner.transport.send(&message).await.inspect_err(|e| {
            warn!("Test send for campaign {campaign_id} failed: {e}");
        })?;
        internal!(
            level = INFO,
            "Test message for campaign {campaign_id} accepted for {}",
            message.to
        );
        Ok(accepted)
    }

    /// Ids of runs that are not yet terminal
    #[must_use]
    pub fn active_runs(&self) -> Vec<RunId> {
        self.inner
            .runs
            .iter()
            .filter(|entry| {
                matches!(entry.value(), RunEntry::Live(state) if state.status().is_active())
            })
            .map(|entry| *entry.key())
            .collect()
    }
}

/// Drive one run from `Running` to a terminal status
async fn supervise(inner: Arc<EngineInner>, ctx: Arc<WorkerContext>) {
    let state = Arc::clone(&ctx.state);
    let run_id = state.run_id();

    if let Err(e) = inner.transport.verify().await {
        fail_verify(&state, &e);
    } else {
        let mut workers = JoinSet::new();
        for worker_id in 0..ctx.campaign.concurrency {
            workers.spawn(worker::run(worker_id, Arc::clone(&ctx)));
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker of run {run_id} aborted: {e}");
                state.fault(format!("worker aborted: {e}"));
            }
        }

        let trigger = if let Some(reason) = state.fault_reason() {
            (Trigger::Fault, Some(reason))
        } else if state.status() == RunStatus::Stopping {
            (Trigger::Halted, None)
        } else {
            (Trigger::Drained, None)
        };

        if state.transition(trigger.0, trigger.1).is_none() {
            // A stop raced the final drain
            state.transition(Trigger::Halted, None);
        }
    }

    let snapshot = state.snapshot();
    internal!(
        level = INFO,
        "Run {run_id} finished {}: sent {}, failed {}, retried {}",
        snapshot.status,
        snapshot.counters.sent,
        snapshot.counters.failed,
        snapshot.counters.retried
    );

    if let Err(e) = inner.store.record_run(&snapshot).await {
        warn!("Failed to record run {run_id}: {e}");
    }

    // Drops the feed, the rows and the log handle along with the state
    let campaign_id = snapshot.campaign_id;
    inner.runs.insert(run_id, RunEntry::Finished(snapshot));
    inner
        .active
        .remove_if(&campaign_id, |_, id| *id == run_id);
}

fn fail_verify(state: &RunState, error: &TransportError) {
    let reason = format!("transport verification failed: {error}");
    state.notice(EventLevel::Error, reason.clone());
    state.transition(Trigger::Fault, Some(reason));
}
