//! Programmable transport for tests and rehearsals.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Accepted, OutboundMessage, Transport};
use crate::error::{FatalError, PermanentError, TransientError, TransportError};

/// What the transport answers for an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Accept,
    Transient,
    Permanent,
    Fatal,
    /// Fail transiently for the first `n` calls, then accept
    TransientThenAccept(u32),
}

/// One observed call to [`ScriptedTransport::send`]
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub to: String,
    pub subject: String,
    pub started: Instant,
}

#[derive(Debug)]
pub struct ScriptedTransport {
    default: Scripted,
    overrides: DashMap<String, Scripted>,
    latency: Duration,
    verify_error: Option<TransportError>,
    calls: Mutex<Vec<CallRecord>>,
    per_address: DashMap<String, u32>,
    in_flight: DashMap<String, usize>,
    overlapped: AtomicBool,
    concurrent: AtomicUsize,
    peak_concurrent: AtomicUsize,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new(Scripted::Accept)
    }
}

impl ScriptedTransport {
    #[must_use]
    pub fn new(default: Scripted) -> Self {
        Self {
            default,
            overrides: DashMap::new(),
            latency: Duration::ZERO,
            verify_error: None,
            calls: Mutex::new(Vec::new()),
            per_address: DashMap::new(),
            in_flight: DashMap::new(),
            overlapped: AtomicBool::new(false),
            concurrent: AtomicUsize::new(0),
            peak_concurrent: AtomicUsize::new(0),
        }
    }

    /// Answer `outcome` for `address` instead of the default
    #[must_use]
    pub fn with(self, address: &str, outcome: Scripted) -> Self {
        self.overrides.insert(address.to_ascii_lowercase(), outcome);
        self
    }

    /// Time every send takes before answering
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn failing_verify(mut self, error: TransportError) -> Self {
        self.verify_error = Some(error);
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn calls_to(&self, address: &str) -> u32 {
        self.per_address.get(address).map_or(0, |count| *count)
    }

    /// Whether two sends to the same address were ever in flight together
    #[must_use]
    pub fn saw_overlap(&self) -> bool {
        self.overlapped.load(Ordering::Acquire)
    }

    /// Highest number of sends in flight at once
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_concurrent.load(Ordering::Acquire)
    }

    fn outcome_for(&self, address: &str, call_number: u32) -> Result<Accepted, TransportError> {
        let scripted = self
            .overrides
            .get(address)
            .map_or(self.default, |entry| *entry);

        match scripted {
            Scripted::Accept => Ok(Accepted {
                provider_id: Some(format!("scripted-{address}-{call_number}")),
            }),
            Scripted::TransientThenAccept(failures) if call_number > failures => Ok(Accepted {
                provider_id: Some(format!("scripted-{address}-{call_number}")),
            }),
            Scripted::Transient | Scripted::TransientThenAccept(_) => Err(
                TransientError::ServerError {
                    status: 503,
                    message: "scripted outage".to_string(),
                }
                .into(),
            ),
            Scripted::Permanent => {
                Err(PermanentError::InvalidRecipient(address.to_string()).into())
            }
            Scripted::Fatal => Err(FatalError::Unauthorized("scripted key revoked".to_string()).into()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn verify(&self) -> Result<(), TransportError> {
        self.verify_error.clone().map_or(Ok(()), Err)
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Accepted, TransportError> {
        let address = message.to.to_string();

        let call_number = {
            let mut count = self.per_address.entry(address.clone()).or_insert(0);
            *count += 1;
            *count
        };

        self.calls.lock().push(CallRecord {
            to: address.clone(),
            subject: message.subject.clone(),
            started: Instant::now(),
        });

        {
            let mut in_flight = self.in_flight.entry(address.clone()).or_insert(0);
            *in_flight += 1;
            if *in_flight > 1 {
                self.overlapped.store(true, Ordering::Release);
            }
        }
        let now = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::AcqRel);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.concurrent.fetch_sub(1, Ordering::AcqRel);
        if let Some(mut in_flight) = self.in_flight.get_mut(&address) {
            *in_flight -= 1;
        }

        self.outcome_for(&address, call_number)
    }
}
