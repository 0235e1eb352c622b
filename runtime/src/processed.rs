//! Short-TTL cache of decided idempotency keys.
//!
//! Sits in front of the ledger's processed-key table: keys found here are not
//! sent to the ledger snapshot. The table stays authoritative, so losing this
//! set (restart) only costs a slightly larger snapshot query.

use chrono::{DateTime, Utc};
use flashsale_core::types::{IdempotencyKey, ProcessedKey};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Process-local processed-key set.
#[derive(Debug, Clone, Default)]
pub struct ProcessedSet {
    entries: Arc<RwLock<HashMap<IdempotencyKey, ProcessedKey>>>,
}

impl ProcessedSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome recorded for `key`, if still retained
    #[must_use]
    pub fn get(&self, key: &IdempotencyKey) -> Option<ProcessedKey> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    /// Remember freshly committed outcomes
    pub fn extend<'a>(&self, processed: impl IntoIterator<Item = &'a ProcessedKey>) {
        if let Ok(mut entries) = self.entries.write() {
            for record in processed {
                entries
                    .entry(record.idempotency_key.clone())
                    .or_insert_with(|| record.clone());
            }
        }
    }

    /// Drop entries decided before `older_than`; returns how many
    pub fn purge(&self, older_than: DateTime<Utc>) -> usize {
        self.entries.write().map_or(0, |mut entries| {
            let before = entries.len();
            entries.retain(|_, record| record.processed_at >= older_than);
            before - entries.len()
        })
    }

    /// Number of retained keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    /// Whether no key is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
