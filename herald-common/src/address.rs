//! Validated recipient addresses

use std::fmt::{self, Display};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Domain;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Invalid address '{0}'")]
    Invalid(String),

    #[error("Expected a single mailbox, got a group or list: '{0}'")]
    NotSingle(String),
}

/// A single mailbox, trimmed and lowercased.
///
/// Comparison and hashing operate on the normalised form, so two rows that
/// differ only in case collapse to the same recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and normalise a raw address.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if the input is empty, is not a valid
    /// RFC 5322 mailbox, or names more than one mailbox.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let list =
            mailparse::addrparse(trimmed).map_err(|_| AddressError::Invalid(trimmed.to_string()))?;

        let [MailAddr::Single(info)] = list.as_slice() else {
            return Err(AddressError::NotSingle(trimmed.to_string()));
        };

        let addr = info.addr.trim().to_ascii_lowercase();
        match addr.split_once('@') {
            Some((local, domain))
                if !local.is_empty() && domain.contains('.') && !domain.ends_with('.') =>
            {
                Ok(Self(addr))
            }
            _ => Err(AddressError::Invalid(trimmed.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the `@`
    #[must_use]
    pub fn domain(&self) -> Domain {
        Domain::new(self.0.rsplit_once('@').map_or("", |(_, domain)| domain))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_normalises_case_and_whitespace() {
        let address = Address::parse("  Alice@Example.COM ").unwrap();
        assert_eq!(address.as_str(), "alice@example.com");
        assert_eq!(address.domain(), Domain::new("example.com"));
    }

    #[test]
    fn test_parse_accepts_display_name() {
        let address = Address::parse("Bob Smith <bob@example.org>").unwrap();
        assert_eq!(address.as_str(), "bob@example.org");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Address::parse(""), Err(AddressError::Empty));
        assert!(Address::parse("not-an-address").is_err());
        assert!(Address::parse("user@localhost").is_err());
        assert!(Address::parse("@example.com").is_err());
    }

    #[test]
    fn test_parse_rejects_lists() {
        assert!(matches!(
            Address::parse("a@example.com, b@example.com"),
            Err(AddressError::NotSingle(_))
        ));
    }

    #[test]
    fn test_try_from_string_validates() {
        let address = Address::try_from("Carol@Example.com".to_string()).unwrap();
        assert_eq!(String::from(address), "carol@example.com");
        assert!(Address::try_from("nope".to_string()).is_err());
    }
}
