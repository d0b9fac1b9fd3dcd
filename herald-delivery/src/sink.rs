//! Live event fan-out.
//!
//! Each run owns one bounded broadcast channel. Slow subscribers lose the
//! oldest events rather than holding back workers; the stream ends once the
//! run reaches a terminal status and the sender is dropped.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    log::AttemptRecord,
    run::{RunCounters, RunId, RunStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// An attempt was recorded; `counters` already include it
    Attempt {
        record: AttemptRecord,
        counters: RunCounters,
    },
    Status {
        run_id: RunId,
        status: RunStatus,
        counters: RunCounters,
        reason: Option<String>,
    },
    /// Free-form operator message
    Notice {
        run_id: RunId,
        level: EventLevel,
        message: String,
        at: DateTime<Utc>,
    },
}

#[derive(Debug)]
pub struct EventSink {
    sender: Mutex<Option<broadcast::Sender<Event>>>,
}

impl EventSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Publish to current subscribers; dropped silently when nobody listens
    pub fn publish(&self, event: Event) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // Err only means there are no receivers right now
            let _ = sender.send(event);
        }
    }

    /// `None` once the sink has been closed
    #[must_use]
    pub fn subscribe(&self) -> Option<EventStream> {
        self.sender
            .lock()
            .as_ref()
            .map(|sender| EventStream::new(sender.subscribe()))
    }

    /// Drop the sender so every stream ends after draining
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

/// Receiving end handed to a subscriber
#[derive(Debug)]
pub struct EventStream {
    receiver: Option<broadcast::Receiver<Event>>,
}

impl EventStream {
    const fn new(receiver: broadcast::Receiver<Event>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// A stream that is already finished (run ended before subscribing)
    #[must_use]
    pub const fn closed() -> Self {
        Self { receiver: None }
    }

    /// Next event, or `None` when the run has finished and everything
    /// buffered was delivered.
    pub async fn next(&mut self) -> Option<Event> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event subscriber lagged, {skipped} event(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(run_id: RunId, n: usize) -> Event {
        Event::Notice {
            run_id,
            level: EventLevel::Info,
            message: format!("notice {n}"),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_stream_ends_after_close() {
        let sink = EventSink::new(8);
        let run = RunId::generate();
        let Some(mut stream) = sink.subscribe() else {
            panic!("open sink must accept subscribers");
        };

        sink.publish(notice(run, 1));
        sink.close();

        assert!(matches!(stream.next().await, Some(Event::Notice { .. })));
        assert!(stream.next().await.is_none());
        assert!(sink.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let sink = EventSink::new(2);
        let run = RunId::generate();
        let Some(mut stream) = sink.subscribe() else {
            panic!("open sink must accept subscribers");
        };

        for n in 0..5 {
            sink.publish(notice(run, n));
        }
        sink.close();

        let mut seen = Vec::new();
        while let Some(Event::Notice { message, .. }) = stream.next().await {
            seen.push(message);
        }
        assert_eq!(seen, vec!["notice 3".to_string(), "notice 4".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let sink = EventSink::new(4);
        sink.publish(notice(RunId::generate(), 0));
        assert!(EventStream::closed().next().await.is_none());
    }
}
