use async_trait::async_trait;
use herald_common::outgoing;

use super::{Accepted, OutboundMessage, Transport};
use crate::error::TransportError;

/// Dry-run transport: every message is written to the log and accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<Accepted, TransportError> {
        outgoing!(
            level = INFO,
            "[dry-run] {} -> {}: {:?} ({} attachment(s), {} header(s))",
            message.from.mailbox(),
            message.to,
            message.subject,
            message.attachments.len(),
            message.headers.len()
        );

        Ok(Accepted {
            provider_id: Some(message.message_id.clone()),
        })
    }
}
