//! The seam between the engine and an email provider.
//!
//! A [`Transport`] receives one fully rendered [`OutboundMessage`] at a time
//! and answers with either [`Accepted`] or a classified [`TransportError`].
//! Provider specifics (HTTP client, authentication) live behind it.

mod log;
mod scripted;

use async_trait::async_trait;
use herald_common::Address;
use serde::{Deserialize, Serialize};

pub use self::{
    log::LogTransport,
    scripted::{CallRecord, Scripted, ScriptedTransport},
};
use crate::{
    campaign::{AttachmentRef, CampaignId, Variables},
    error::TransportError,
    run::RunId,
    template::{RenderedContent, substitute},
};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Checked once when a run starts; a failure marks the run `Failed`
    /// before any recipient is claimed.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the transport cannot be used at all.
    async fn verify(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Hand a single message to the provider.
    ///
    /// # Errors
    ///
    /// Returns a classified [`TransportError`] when the provider refuses or
    /// cannot be reached.
    async fn send(&self, message: &OutboundMessage) -> Result<Accepted, TransportError>;
}

/// Provider acknowledgement of a send
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl SenderIdentity {
    /// Domain part of the sender address, used for `Message-ID`
    #[must_use]
    pub fn domain(&self) -> &str {
        self.email
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain)
    }

    /// `Name <email>` or just the address
    #[must_use]
    pub fn mailbox(&self) -> String {
        self.name.as_deref().map_or_else(
            || self.email.clone(),
            |name| format!("{name} <{}>", self.email),
        )
    }
}

impl Default for SenderIdentity {
    fn default() -> Self {
        Self {
            email: "noreply@localhost.localdomain".to_string(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub from: SenderIdentity,
    pub to: Address,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub attachments: Vec<AttachmentRef>,
    pub headers: Vec<(String, String)>,
    pub message_id: String,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(
        from: SenderIdentity,
        to: Address,
        content: RenderedContent,
        attachments: Vec<AttachmentRef>,
        headers: DeliverabilityHeaders,
    ) -> Self {
        let message_id = headers.message_id.clone();
        Self {
            from,
            to,
            subject: content.subject,
            html: content.html,
            text: content.text,
            attachments,
            headers: headers.into_headers(),
            message_id,
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Headers that keep bulk mail out of spam folders.
///
/// `List-Unsubscribe` is only emitted when an unsubscribe URL is configured;
/// a `{{email}}` placeholder in it is replaced with the percent-encoded
/// recipient address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverabilityHeaders {
    pub message_id: String,
    pub unsubscribe: Option<String>,
    pub campaign_id: CampaignId,
    pub run_id: Option<RunId>,
}

impl DeliverabilityHeaders {
    #[must_use]
    pub fn build(
        sender: &SenderIdentity,
        recipient: &Address,
        campaign_id: CampaignId,
        run_id: Option<RunId>,
        unsubscribe_url: Option<&str>,
    ) -> Self {
        let unsubscribe = unsubscribe_url.map(|url| {
            let email = urlencoding::encode(recipient.as_str());
            let variables: Variables = std::iter::once(("email", email.as_ref())).collect();
            substitute(url, &variables)
        });

        Self {
            message_id: format!("<{}@{}>", ulid::Ulid::new(), sender.domain()),
            unsubscribe,
            campaign_id,
            run_id,
        }
    }

    #[must_use]
    pub fn into_headers(self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Message-ID".to_string(), self.message_id),
            ("X-Herald-Campaign".to_string(), self.campaign_id.to_string()),
        ];

        if let Some(run_id) = self.run_id {
            headers.push(("X-Herald-Run".to_string(), run_id.to_string()));
        }

        if let Some(url) = self.unsubscribe {
            headers.push(("List-Unsubscribe".to_string(), format!("<{url}>")));
            headers.push((
                "List-Unsubscribe-Post".to_string(),
                "List-Unsubscribe=One-Click".to_string(),
            ));
        }

        headers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sender() -> SenderIdentity {
        SenderIdentity {
            email: "news@herald.example".to_string(),
            name: Some("Herald News".to_string()),
        }
    }

    #[test]
    fn test_sender_identity() {
        assert_eq!(sender().domain(), "herald.example");
        assert_eq!(sender().mailbox(), "Herald News <news@herald.example>");
    }

    #[test]
    fn test_headers_with_unsubscribe() {
        let to = Address::parse("ann@example.com").unwrap();
        let run = RunId::generate();
        let headers = DeliverabilityHeaders::build(
            &sender(),
            &to,
            CampaignId::generate(),
            Some(run),
            Some("https://herald.example/unsub?e={{email}}"),
        );

        assert!(headers.message_id.ends_with("@herald.example>"));

        let message = OutboundMessage::new(
            sender(),
            to,
            RenderedContent {
                subject: "s".to_string(),
                html: "h".to_string(),
                text: "t".to_string(),
            },
            Vec::new(),
            headers,
        );

        assert_eq!(
            message.header("list-unsubscribe"),
            Some("<https://herald.example/unsub?e=ann%40example.com>")
        );
        assert_eq!(
            message.header("List-Unsubscribe-Post"),
            Some("List-Unsubscribe=One-Click")
        );
        assert_eq!(message.header("X-Herald-Run"), Some(run.to_string().as_str()));
        assert_eq!(message.header("Message-ID"), Some(message.message_id.as_str()));
    }

    #[test]
    fn test_headers_without_unsubscribe() {
        let to = Address::parse("ann@example.com").unwrap();
        let headers =
            DeliverabilityHeaders::build(&sender(), &to, CampaignId::generate(), None, None)
                .into_headers();
        assert!(headers.iter().all(|(k, _)| !k.starts_with("List-")));
        assert!(headers.iter().all(|(k, _)| k != "X-Herald-Run"));
    }

    #[test]
    fn test_unsubscribe_address_is_encoded() {
        let to = Address::parse("ann+news@example.com").unwrap();
        let headers = DeliverabilityHeaders::build(
            &sender(),
            &to,
            CampaignId::generate(),
            None,
            Some("https://herald.example/unsub?e={{email}}&list=spring"),
        );

        assert_eq!(
            headers.unsubscribe.as_deref(),
            Some("https://herald.example/unsub?e=ann%2Bnews%40example.com&list=spring")
        );
    }
}
