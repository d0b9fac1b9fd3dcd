//! Shared state of one run.
//!
//! Status changes go through [`RunState::transition`], which applies the
//! state machine atomically on the status channel and then publishes the
//! change. Attempts go through [`RunState::record`]: durable log first, then
//! counters, then the live event, so a subscriber never sees counters that
//! the log cannot back up.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_common::{audit, internal};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::warn;

use super::{RunCounters, RunId, RunSnapshot, RunStatus, Trigger};
use crate::{
    campaign::CampaignId,
    feed::RecipientFeed,
    log::{AttemptLog, AttemptOutcome, AttemptRecord},
    sink::{Event, EventLevel, EventSink, EventStream},
};

/// What workers are asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Stop,
}

pub struct RunState {
    run_id: RunId,
    campaign_id: CampaignId,
    status: watch::Sender<RunStatus>,
    control: watch::Sender<Control>,
    counters: Mutex<RunCounters>,
    feed: Arc<RecipientFeed>,
    started_at: DateTime<Utc>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    reason: Mutex<Option<String>>,
    fault: Mutex<Option<String>>,
    sink: EventSink,
    log: Arc<dyn AttemptLog>,
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("run_id", &self.run_id)
            .field("campaign_id", &self.campaign_id)
            .field("status", &*self.status.borrow())
            .field("counters", &*self.counters.lock())
            .finish_non_exhaustive()
    }
}

impl RunState {
    pub fn new(
        run_id: RunId,
        campaign_id: CampaignId,
        feed: Arc<RecipientFeed>,
        log: Arc<dyn AttemptLog>,
        event_buffer: usize,
    ) -> Self {
        let (status, _) = watch::channel(RunStatus::Pending);
        let (control, _) = watch::channel(Control::Run);

        Self {
            run_id,
            campaign_id,
            status,
            control,
            counters: Mutex::new(RunCounters::default()),
            feed,
            started_at: Utc::now(),
            ended_at: Mutex::new(None),
            reason: Mutex::new(None),
            fault: Mutex::new(None),
            sink: EventSink::new(event_buffer),
            log,
        }
    }

    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub const fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn counters(&self) -> RunCounters {
        let mut counters = *self.counters.lock();
        counters.queued = self.feed.remaining();
        counters
    }

    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            campaign_id: self.campaign_id,
            status: self.status(),
            counters: self.counters(),
            total: self.feed.total(),
            started_at: self.started_at,
            ended_at: *self.ended_at.lock(),
            reason: self.reason.lock().clone(),
        }
    }

    /// Apply `trigger`; returns the new status, or `None` if the current
    /// status does not accept it.
    pub fn transition(&self, trigger: Trigger, reason: Option<String>) -> Option<RunStatus> {
        let mut from = RunStatus::Pending;
        let mut to = None;

        // Bookkeeping happens under the channel lock so a waiter woken by the
        // new status always sees a consistent snapshot
        self.status.send_if_modified(|status| {
            from = *status;
            to = status.on(trigger);
            let Some(next) = to else {
                return false;
            };

            if next.is_terminal() {
                *self.ended_at.lock() = Some(Utc::now());
            }
            if let Some(reason) = &reason {
                *self.reason.lock() = Some(reason.clone());
            }
            *status = next;
            true
        });

        let to = to?;

        match &reason {
            Some(reason) => internal!(
                level = INFO,
                "Run {} of campaign {}: {from} -> {to} ({reason})",
                self.run_id,
                self.campaign_id
            ),
            None => internal!(
                level = INFO,
                "Run {} of campaign {}: {from} -> {to}",
                self.run_id,
                self.campaign_id
            ),
        }
        audit::log_run_transition(
            &self.run_id.to_string(),
            &self.campaign_id.to_string(),
            from.as_str(),
            to.as_str(),
        );

        self.sink.publish(Event::Status {
            run_id: self.run_id,
            status: to,
            counters: self.counters(),
            reason,
        });

        if to.is_terminal() {
            self.sink.close();
        }

        Some(to)
    }

    /// Ask workers to pause, resume or stop. A stop request is never
    /// downgraded.
    pub fn request(&self, wanted: Control) {
        self.control.send_if_modified(|current| {
            if *current == Control::Stop || *current == wanted {
                return false;
            }
            *current = wanted;
            true
        });
    }

    #[must_use]
    pub fn control(&self) -> watch::Receiver<Control> {
        self.control.subscribe()
    }

    /// Record an unrecoverable failure and stop the workers; the supervisor
    /// turns it into `Failed` once they have exited. The first reason wins.
    pub fn fault(&self, reason: impl Into<String>) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(reason.into());
            }
        }
        self.request(Control::Stop);
    }

    #[must_use]
    pub fn fault_reason(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Append an attempt to the durable log, update counters and notify
    /// subscribers.
    ///
    /// A log write failure is reported but does not change the outcome of
    /// the recipient.
    pub async fn record(&self, record: AttemptRecord) {
        if let Err(e) = self.log.append(&record).await {
            warn!(
                "Failed to persist attempt {} for {} in run {}: {e}",
                record.try_number, record.recipient, self.run_id
            );
        }

        let mut counters = {
            let mut counters = self.counters.lock();
            match record.outcome {
                AttemptOutcome::Success => counters.sent += 1,
                AttemptOutcome::PermanentFailure => counters.failed += 1,
                AttemptOutcome::TransientFailure if record.next_retry_ms.is_some() => {
                    counters.retried += 1;
                }
                AttemptOutcome::TransientFailure => {}
            }
            *counters
        };

        counters.queued = self.feed.remaining();
        self.sink.publish(Event::Attempt { record, counters });
    }

    pub fn notice(&self, level: EventLevel, message: impl Into<String>) {
        self.sink.publish(Event::Notice {
            run_id: self.run_id,
            level,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Live events; an already finished run yields an empty stream
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        self.sink.subscribe().unwrap_or_else(EventStream::closed)
    }

    /// Resolve once the run reaches a terminal status
    pub async fn wait(&self) -> RunSnapshot {
        let mut status = self.status.subscribe();
        // The sender lives in `self`, so the channel cannot close under us
        let _ = status.wait_for(|s| s.is_terminal()).await;
        self.snapshot()
    }
}
