//! Key selection protocol (C4, spec §4.4).

use std::collections::HashSet;

use crate::cancel::CancellationToken;
use crate::crypto::decrypt_sector;
use crate::model::{DetectionProbe, KeyRecord, SECTOR_SIZE};

use super::KeyIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelectError {
    /// No untested keys remain (spec §4.4 step 1).
    NoKey,
    /// Every untested key failed the probe (spec §4.4 step 2).
    NoMatch,
}

/// The outcome of a successful selection: the chosen key id, its 16 bytes,
/// and the single [`KeyRecord`] chosen to carry reference metadata.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub key_id: String,
    pub key: [u8; 16],
    pub carrier: KeyRecord,
}

/// Runs spec §4.4 steps 1-5 against `index`, given the already-read
/// ciphertext of the probe sector.
///
/// `tested` accumulates every key id tried across calls on the same
/// engine instance (spec §8 invariant 4: repeated runs on an unchanged
/// `KeyIndex` yield the same chosen id; a *fresh* engine is required to
/// observe that, since `tested` is per-engine state).
pub fn select_key(
    index: &KeyIndex,
    probe: &DetectionProbe,
    probe_ciphertext: &[u8; SECTOR_SIZE],
    tested: &mut HashSet<String>,
    product_code: &str,
    cancel: &CancellationToken,
) -> Result<SelectedKey, KeySelectError> {
    let untested: Vec<String> =
        index.key_ids().into_iter().filter(|id| !tested.contains(id)).collect();
    if untested.is_empty() {
        return Err(KeySelectError::NoKey);
    }

    let matches = probe_untested_keys(index, probe, probe_ciphertext, &untested, cancel);

    for id in &untested {
        tested.insert(id.clone());
    }

    if matches.is_empty() {
        return Err(KeySelectError::NoMatch);
    }

    if matches.len() > 1 {
        log::warn!(
            "key selection ambiguous: {} keys matched the detection probe ({}); choosing the first in enumeration order",
            matches.len(),
            matches.join(", "),
        );
    }

    // Deterministic: first in enumeration order (spec §4.4 step 4).
    let chosen_id = matches[0].clone();
    let records = index.records_for(&chosen_id);
    let carrier = choose_carrier(&records, product_code);
    let key = carrier.decrypted_key;
    Ok(SelectedKey { key_id: chosen_id, key, carrier })
}

/// Probes every untested key against the probe sector. Runs on a bounded
/// thread pool when there are enough keys to make it worthwhile, or
/// serially otherwise — the cipher has no shared state, so both produce
/// identical results (spec §4.2, §5 point 1, §9 design note).
fn probe_untested_keys(
    index: &KeyIndex,
    probe: &DetectionProbe,
    probe_ciphertext: &[u8; SECTOR_SIZE],
    untested: &[String],
    cancel: &CancellationToken,
) -> Vec<String> {
    const PARALLEL_THRESHOLD: usize = 8;
    const MAX_WORKERS: usize = 8;

    let records_for_ids: Vec<(String, [u8; 16])> = untested
        .iter()
        .map(|id| {
            let records = index.records_for(id);
            (id.clone(), records[0].decrypted_key)
        })
        .collect();

    if records_for_ids.len() < PARALLEL_THRESHOLD {
        return records_for_ids
            .into_iter()
            .take_while(|_| !cancel.is_cancelled())
            .filter(|(_, key)| check_key(key, probe, probe_ciphertext))
            .map(|(id, _)| id)
            .collect();
    }

    let worker_count = MAX_WORKERS.min(records_for_ids.len());
    let chunk_size = records_for_ids.len().div_ceil(worker_count);
    std::thread::scope(|scope| {
        let handles: Vec<_> = records_for_ids
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    if cancel.is_cancelled() {
                        return Vec::new();
                    }
                    chunk
                        .iter()
                        .filter(|(_, key)| check_key(key, probe, probe_ciphertext))
                        .map(|(id, _)| id.clone())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut matched = Vec::new();
        for handle in handles {
            matched.extend(handle.join().expect("key probe worker panicked"));
        }
        // Preserve enumeration order for the deterministic tie-break.
        matched.sort_by_key(|id| untested.iter().position(|u| u == id).unwrap_or(usize::MAX));
        matched
    })
}

fn check_key(key: &[u8; 16], probe: &DetectionProbe, ciphertext: &[u8; SECTOR_SIZE]) -> bool {
    let plaintext = decrypt_sector(key, &probe.sector_iv, ciphertext);
    plaintext.starts_with(&probe.expected_prefix)
}

/// Among records sharing the chosen id, prefer (i) an IRD whose filename
/// contains the product code case-insensitively, else (ii) any IRD, else
/// (iii) the first record (spec §4.4 step 5).
fn choose_carrier(records: &[KeyRecord], product_code: &str) -> KeyRecord {
    use crate::model::KeySourceKind;

    let product_code_lower = product_code.to_ascii_lowercase();
    if let Some(r) = records.iter().find(|r| {
        r.source_kind == KeySourceKind::Ird
            && r.source_path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_ascii_lowercase().contains(&product_code_lower))
    }) {
        return r.clone();
    }
    if let Some(r) = records.iter().find(|r| r.source_kind == KeySourceKind::Ird) {
        return r.clone();
    }
    records[0].clone()
}
