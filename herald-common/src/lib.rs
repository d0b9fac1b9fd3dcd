//! Pieces shared by every herald crate: log bootstrap and macros, audit
//! events, and the address/domain newtypes used to key delivery policy.

pub mod address;
pub mod audit;
pub mod domain;
pub mod logging;

pub use address::{Address, AddressError};
pub use domain::Domain;
pub use tracing;

/// Process-wide control messages sent to long-running tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
