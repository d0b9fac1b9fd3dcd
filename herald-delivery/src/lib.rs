//! Campaign send engine
//!
//! This crate provides:
//! - Recipient feeds built from uploaded rows, with demo redirection and
//!   checkpoint skipping
//! - Per-recipient template rendering and attachment lookup
//! - A pluggable delivery transport with classified errors
//! - Retry backoff and per-domain throttling
//! - Worker pools supervised by a run state machine
//! - Durable attempt logs and live event streams

pub mod attachment;
pub mod campaign;
mod config;
mod error;
pub mod feed;
pub mod log;
pub mod policy;
pub mod run;
pub mod sink;
pub mod store;
pub mod template;
pub mod transport;
mod worker;

pub use campaign::{Campaign, CampaignId, Mode, RecipientRow, Variables};
pub use config::{EngineConfig, WORKER_LIMIT};
pub use error::{
    ConfigError, FatalError, LogError, PermanentError, RunError, StoreError, TransientError,
    TransportError,
};
pub use log::{AttemptLog, AttemptOutcome, AttemptRecord, FileAttemptLog, MemoryAttemptLog};
pub use run::{
    RunCounters, RunId, RunSnapshot, RunStatus, StopOutcome, controller::Engine,
};
pub use sink::{Event, EventLevel, EventStream};
pub use store::{CampaignStore, MemoryCampaignStore};
pub use transport::{Accepted, LogTransport, OutboundMessage, SenderIdentity, Transport};
