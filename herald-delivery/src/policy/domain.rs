//! Per-domain throttling
//!
//! Large webmail providers are quick to filter bursts from a single sender.
//! Recipients on listed domains get a stretched retry schedule and a fixed
//! pause before every send; everything else uses the campaign policy as is.

use std::{collections::HashMap, time::Duration};

use herald_common::Domain;
use serde::{Deserialize, Serialize};

use super::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainThrottle {
    /// Multiplies the retry base delay and cap
    #[serde(default = "default_multiplier")]
    pub delay_multiplier: u32,

    /// Pause before each send to this domain
    #[serde(default)]
    pub inter_send_delay_ms: u64,
}

impl Default for DomainThrottle {
    fn default() -> Self {
        Self {
            delay_multiplier: default_multiplier(),
            inter_send_delay_ms: 0,
        }
    }
}

const fn default_multiplier() -> u32 {
    1
}

/// Domain → throttle table, as written in config:
///
/// ```ron
/// domains: {
///     "gmail.com": (delay_multiplier: 2, inter_send_delay_ms: 500),
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainThrottleRegistry {
    domains: HashMap<Domain, DomainThrottle>,
}

impl DomainThrottleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table shipped by default: the two big consumer webmail providers
    #[must_use]
    pub fn webmail() -> Self {
        let throttle = DomainThrottle {
            delay_multiplier: 2,
            inter_send_delay_ms: 500,
        };

        let mut registry = Self::new();
        registry.insert("gmail.com", throttle.clone());
        registry.insert("hotmail.com", throttle);
        registry
    }

    pub fn insert(&mut self, domain: impl Into<Domain>, throttle: DomainThrottle) {
        self.domains.insert(domain.into(), throttle);
    }

    #[must_use]
    pub fn get(&self, domain: &Domain) -> Option<&DomainThrottle> {
        self.domains.get(domain)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Policy in force for one recipient domain
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub retry: RetryPolicy,
    pub inter_send_delay: Duration,
}

/// Combines a campaign's retry policy with the domain table
#[derive(Debug, Clone)]
pub struct DomainPolicyResolver {
    domains: DomainThrottleRegistry,
    retry: RetryPolicy,
}

impl DomainPolicyResolver {
    #[must_use]
    pub const fn new(domains: DomainThrottleRegistry, retry: RetryPolicy) -> Self {
        Self { domains, retry }
    }

    #[must_use]
    pub fn resolve(&self, domain: &Domain) -> EffectivePolicy {
        self.domains.get(domain).map_or_else(
            || EffectivePolicy {
                retry: self.retry.clone(),
                inter_send_delay: Duration::ZERO,
            },
            |throttle| EffectivePolicy {
                retry: self.retry.scaled(throttle.delay_multiplier),
                inter_send_delay: Duration::from_millis(throttle.inter_send_delay_ms),
            },
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unlisted_domain_uses_base_policy() {
        let resolver =
            DomainPolicyResolver::new(DomainThrottleRegistry::webmail(), RetryPolicy::default());
        let policy = resolver.resolve(&Domain::new("example.com"));
        assert_eq!(policy.retry, RetryPolicy::default());
        assert_eq!(policy.inter_send_delay, Duration::ZERO);
    }

    #[test]
    fn test_webmail_domains_are_throttled() {
        let resolver =
            DomainPolicyResolver::new(DomainThrottleRegistry::webmail(), RetryPolicy::default());

        for domain in ["gmail.com", "HOTMAIL.com"] {
            let policy = resolver.resolve(&Domain::new(domain));
            assert_eq!(policy.retry.base_delay_ms, 2000);
            assert_eq!(policy.inter_send_delay, Duration::from_millis(500));
        }
    }

    #[test]
    fn test_registry_from_ron() {
        let registry: DomainThrottleRegistry = ron::from_str(
            r#"{
                "yahoo.com": (delay_multiplier: 3),
                "outlook.com": (inter_send_delay_ms: 250),
            }"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        let yahoo = registry.get(&Domain::new("yahoo.com")).unwrap();
        assert_eq!(yahoo.delay_multiplier, 3);
        assert_eq!(yahoo.inter_send_delay_ms, 0);
        let outlook = registry.get(&Domain::new("outlook.com")).unwrap();
        assert_eq!(outlook.delay_multiplier, 1);
    }
}
