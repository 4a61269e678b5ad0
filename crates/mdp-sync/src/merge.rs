//! Reconciles freshly extracted candidates against the persisted dataset.
//!
//! Records are matched on [`mdp_core::identity_key`]. A match with a changed
//! price appends to the record's history; anything unmatched becomes a new
//! record placed ahead of the carried-over dataset. Nothing is ever removed.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use mdp_core::{DealRecord, ListingCandidate};
use serde::{Deserialize, Serialize};

/// When a re-observed record's `last_seen` moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LastSeenPolicy {
    /// Only a price change refreshes `last_seen`.
    #[default]
    PriceChangeOnly,
    /// Every re-observation refreshes `last_seen`.
    EveryObservation,
}

impl LastSeenPolicy {
    pub fn from_name(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "price-change-only" | "price-change" => Some(Self::PriceChangeOnly),
            "every-observation" | "always" => Some(Self::EveryObservation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeConfig {
    pub last_seen_policy: LastSeenPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Records created by this merge, in candidate order.
    pub new_records: Vec<DealRecord>,
    /// Addresses of pre-existing records whose price changed.
    pub updated_addresses: Vec<String>,
    /// New records followed by the prior dataset in its original order.
    pub dataset: Vec<DealRecord>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Existing(usize),
    Created(usize),
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn merge(
        &self,
        candidates: Vec<ListingCandidate>,
        mut existing: Vec<DealRecord>,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let mut index = HashMap::with_capacity(existing.len() + candidates.len());
        for (pos, record) in existing.iter().enumerate() {
            let key = record.identity_key();
            if !key.is_empty() {
                index.insert(key, Slot::Existing(pos));
            }
        }

        let mut created: Vec<DealRecord> = Vec::new();
        let mut updated_addresses = Vec::new();
        let mut updated_positions = HashSet::new();

        for candidate in candidates {
            let Some(key) = candidate.identity_key() else {
                continue;
            };
            match index.get(&key).copied() {
                Some(Slot::Existing(pos)) => {
                    let record = &mut existing[pos];
                    if self.observe(record, &candidate, now) && updated_positions.insert(pos) {
                        updated_addresses.push(record.address.clone());
                    }
                }
                // Same property seen twice in one run: fold into the record created above.
                Some(Slot::Created(pos)) => {
                    self.observe(&mut created[pos], &candidate, now);
                }
                None => {
                    index.insert(key, Slot::Created(created.len()));
                    created.push(DealRecord::from_candidate(candidate, now));
                }
            }
        }

        for record in &mut existing {
            record.is_new = false;
        }

        let mut dataset = Vec::with_capacity(created.len() + existing.len());
        dataset.extend(created.iter().cloned());
        dataset.extend(existing);

        MergeOutcome {
            new_records: created,
            updated_addresses,
            dataset,
        }
    }

    /// Applies one re-observation; returns whether the price changed.
    fn observe(&self, record: &mut DealRecord, candidate: &ListingCandidate, now: DateTime<Utc>) -> bool {
        let changed_price = candidate
            .known_price()
            .filter(|price| record.previous_price() != Some(*price));

        match changed_price {
            Some(price) => {
                record.record_price(price, now);
                record.last_seen = now;
                true
            }
            None => {
                if self.config.last_seen_policy == LastSeenPolicy::EveryObservation {
                    record.last_seen = now;
                }
                false
            }
        }
    }
}
