//! Run identity, lifecycle and progress snapshots.

pub mod controller;
pub mod state;

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::campaign::CampaignId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId {
    id: ulid::Ulid,
}

impl RunId {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for RunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(|id| Self { id })
    }
}

impl Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of a run.
///
/// ```text
/// Pending ─start─▶ Running ⇄ Paused
///
/// Running | Paused            ─drained─▶ Completed
/// Running | Paused            ─stop────▶ Stopping ─halted─▶ Stopped
/// any non-terminal            ─fault───▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

/// Inputs of the run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Pause,
    Resume,
    Stop,
    /// Feed exhausted and every worker exited
    Drained,
    /// Every worker exited after a stop
    Halted,
    /// Unrecoverable transport or setup failure
    Fault,
}

impl RunStatus {
    /// `Completed`, `Stopped` and `Failed` never change again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// Statuses that block another run of the same campaign
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Running | Self::Paused | Self::Stopping
        )
    }

    /// Next status for `trigger`, or `None` when the transition is not allowed
    #[must_use]
    pub const fn on(self, trigger: Trigger) -> Option<Self> {
        match (self, trigger) {
            (Self::Pending, Trigger::Start) | (Self::Paused, Trigger::Resume) => {
                Some(Self::Running)
            }
            (Self::Running, Trigger::Pause) => Some(Self::Paused),
            (Self::Running | Self::Paused, Trigger::Stop) => Some(Self::Stopping),
            (Self::Stopping, Trigger::Halted) => Some(Self::Stopped),
            (Self::Running | Self::Paused, Trigger::Drained) => Some(Self::Completed),
            (Self::Pending | Self::Running | Self::Paused | Self::Stopping, Trigger::Fault) => {
                Some(Self::Failed)
            }
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run progress counters.
///
/// `sent` and `failed` only move on terminal attempts; `retried` counts
/// scheduled retries; `queued` is the number of recipients not yet claimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub queued: usize,
    pub sent: usize,
    pub failed: usize,
    pub retried: usize,
}

impl RunCounters {
    /// Recipients with a terminal outcome
    #[must_use]
    pub const fn processed(&self) -> usize {
        self.sent + self.failed
    }
}

/// Answer to a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Accepted,
    NotRunning,
}

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub campaign_id: CampaignId,
    pub status: RunStatus,
    pub counters: RunCounters,
    /// Recipients in the feed when the run started
    pub total: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl RunSnapshot {
    /// Time spent so far, or the full run time once it has ended
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    /// Percentage of recipients with a terminal outcome
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.counters.processed() as f64 / self.total as f64 * 100.0).min(100.0)
    }

    /// Linear estimate of the time left, from the average per recipient so
    /// far. `None` until something was processed or after the run ended.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn eta(&self) -> Option<Duration> {
        let processed = self.counters.processed();
        if processed == 0 || self.status.is_terminal() {
            return None;
        }

        let remaining = self.total.saturating_sub(processed);
        let per_recipient = self.elapsed().as_secs_f64() / processed as f64;
        Some(Duration::from_secs_f64(per_recipient * remaining as f64))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use RunStatus::*;

        assert_eq!(Pending.on(Trigger::Start), Some(Running));
        assert_eq!(Running.on(Trigger::Pause), Some(Paused));
        assert_eq!(Paused.on(Trigger::Resume), Some(Running));
        assert_eq!(Paused.on(Trigger::Stop), Some(Stopping));
        assert_eq!(Running.on(Trigger::Stop), Some(Stopping));
        assert_eq!(Stopping.on(Trigger::Halted), Some(Stopped));
        assert_eq!(Running.on(Trigger::Drained), Some(Completed));
        assert_eq!(Paused.on(Trigger::Drained), Some(Completed));
        assert_eq!(Running.on(Trigger::Fault), Some(Failed));

        assert_eq!(Stopping.on(Trigger::Stop), None);
        assert_eq!(Pending.on(Trigger::Pause), None);
        assert_eq!(Stopping.on(Trigger::Drained), None);
    }

    #[test]
    fn test_terminal_states_never_transition() {
        let triggers = [
            Trigger::Start,
            Trigger::Pause,
            Trigger::Resume,
            Trigger::Stop,
            Trigger::Drained,
            Trigger::Halted,
            Trigger::Fault,
        ];

        for status in [RunStatus::Completed, RunStatus::Stopped, RunStatus::Failed] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
            for trigger in triggers {
                assert_eq!(status.on(trigger), None, "{status} accepted {trigger:?}");
            }
        }
    }

    #[test]
    fn test_snapshot_progress_and_eta() {
        let started_at = Utc::now() - chrono::Duration::seconds(10);
        let snapshot = RunSnapshot {
            run_id: RunId::generate(),
            campaign_id: CampaignId::generate(),
            status: RunStatus::Running,
            counters: RunCounters {
                queued: 5,
                sent: 4,
                failed: 1,
                retried: 0,
            },
            total: 10,
            started_at,
            ended_at: None,
            reason: None,
        };

        assert!((snapshot.progress() - 50.0).abs() < f64::EPSILON);
        let eta = snapshot.eta().unwrap();
        assert!(eta >= Duration::from_secs(9) && eta <= Duration::from_secs(12));
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::generate();
        assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
        assert!("not-a-ulid".parse::<RunId>().is_err());
    }
}
