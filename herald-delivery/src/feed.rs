//! Recipient feed for a run.
//!
//! The feed is materialised once when a run starts: rows are validated,
//! de-duplicated and filtered against the campaign's checkpoint (addresses
//! already delivered by an earlier run). Workers then claim recipients with a
//! single atomic increment, so every recipient is handed out exactly once no
//! matter how many workers pull concurrently.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use herald_common::{Address, internal};
use serde::Serialize;

use crate::campaign::{Campaign, Mode, RecipientRow, Variables};

/// A validated recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: Address,
    pub variables: Arc<Variables>,
    /// Row address this recipient stands in for (demo mode)
    pub source: Option<String>,
}

/// Rows dropped while building a feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedReport {
    pub invalid: Vec<String>,
    pub duplicates: Vec<String>,
    pub already_delivered: usize,
}

#[derive(Debug)]
pub struct RecipientFeed {
    items: Vec<Arc<Recipient>>,
    cursor: AtomicUsize,
}

impl RecipientFeed {
    #[must_use]
    pub fn new(items: Vec<Recipient>) -> Self {
        Self {
            items: items.into_iter().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Build the feed for `campaign` from its uploaded `rows`, skipping every
    /// address contained in `delivered`.
    pub fn build(
        campaign: &Campaign,
        rows: &[RecipientRow],
        delivered: &HashSet<String>,
    ) -> (Self, FeedReport) {
        let mut report = FeedReport::default();
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        let candidates: Vec<(String, Variables, Option<String>)> = match campaign.mode {
            Mode::Real => rows
                .iter()
                .map(|row| (row.email.clone(), row.variables.clone(), None))
                .collect(),
            Mode::Demo => campaign
                .demo_addresses
                .iter()
                .enumerate()
                .map(|(idx, test_address)| {
                    if rows.is_empty() {
                        return (test_address.clone(), Variables::new(), None);
                    }

                    let row = &rows[idx % rows.len()];
                    let mut variables = row.variables.clone();
                    if !variables.contains("email") {
                        variables.insert("email", row.email.trim());
                    }
                    (test_address.clone(), variables, Some(row.email.clone()))
                })
                .collect(),
        };

        for (raw, variables, source) in candidates {
            let Ok(address) = Address::parse(&raw) else {
                internal!(level = WARN, "Dropping invalid recipient address '{raw}'");
                report.invalid.push(raw);
                continue;
            };

            if !seen.insert(address.clone()) {
                internal!(level = WARN, "Dropping duplicate recipient {address}");
                report.duplicates.push(address.to_string());
                continue;
            }

            if delivered.contains(address.as_str()) {
                report.already_delivered += 1;
                continue;
            }

            items.push(Recipient {
                address,
                variables: Arc::new(variables),
                source,
            });
        }

        (Self::new(items), report)
    }

    /// Claim the next recipient, or `None` once the feed is exhausted
    pub fn next(&self) -> Option<Arc<Recipient>> {
        let idx = self.cursor.fetch_add(1, Ordering::AcqRel);
        self.items.get(idx).cloned()
    }

    /// Recipients not yet claimed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.items
            .len()
            .saturating_sub(self.cursor.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Union of variable names across all recipients, used to warn about
    /// placeholders no row can fill
    #[must_use]
    pub fn columns(&self) -> HashSet<String> {
        self.items
            .iter()
            .flat_map(|r| r.variables.iter().map(|(k, _)| k.to_string()))
            .collect()
    }
}
