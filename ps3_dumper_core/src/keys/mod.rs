//! Key material ingestion (C1) and key-selection protocol (C4), spec §4.1/§4.4.

pub mod providers;
pub mod select;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::cancel::CancellationToken;
use crate::model::KeyRecord;

/// A source of decryption keys, scanned from the local key cache directory.
///
/// The provider set is closed and small (spec §9 design note); adding a
/// provider means adding an implementation and registering it in
/// [`enumerate_all_providers`], no dynamic dispatch beyond that loop.
pub trait KeyProvider {
    /// Scans `cache_dir` for this provider's file kind and parses every
    /// match into a [`KeyRecord`]. Errors in a single file are logged and
    /// skipped; a provider's enumeration as a whole never fails (spec §4.1).
    fn enumerate(
        &self,
        cache_dir: &Path,
        product_code: &str,
        cancel: &CancellationToken,
    ) -> Vec<KeyRecord>;
}

/// `decrypted_key_id -> KeyRecords`, the only process-wide mutable
/// structure in this engine (spec §3, §5). All insertions happen under one
/// exclusive lock taken around the entire batch of records from one
/// provider call; readers take the same lock.
#[derive(Default)]
pub struct KeyIndex {
    groups: Mutex<HashMap<String, Vec<KeyRecord>>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a batch of records (typically one provider's enumeration
    /// output) under a single lock acquisition.
    pub fn insert_batch(&self, records: Vec<KeyRecord>) {
        let mut groups = self.groups.lock().expect("key index lock poisoned");
        for record in records {
            groups.entry(record.decrypted_key_id.clone()).or_default().push(record);
        }
    }

    /// Snapshot of every known key id, for the selector's `untested` set
    /// computation.
    pub fn key_ids(&self) -> Vec<String> {
        let groups = self.groups.lock().expect("key index lock poisoned");
        groups.keys().cloned().collect()
    }

    /// All records sharing a given key id, in insertion order.
    pub fn records_for(&self, key_id: &str) -> Vec<KeyRecord> {
        let groups = self.groups.lock().expect("key index lock poisoned");
        groups.get(key_id).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        let groups = self.groups.lock().expect("key index lock poisoned");
        groups.is_empty()
    }
}

/// Runs every registered provider, in the fixed order IRD-then-Redump, and
/// inserts their output into `index` (spec §4.1).
pub fn enumerate_all_providers(
    index: &KeyIndex,
    cache_dir: &Path,
    product_code: &str,
    cancel: &CancellationToken,
) {
    let providers: Vec<Box<dyn KeyProvider>> = vec![
        Box::new(providers::IrdProvider),
        Box::new(providers::RedumpProvider),
    ];
    for provider in providers {
        if cancel.is_cancelled() {
            return;
        }
        let records = provider.enumerate(cache_dir, product_code, cancel);
        index.insert_batch(records);
    }
}
