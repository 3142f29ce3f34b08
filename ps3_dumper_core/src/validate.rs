//! Reference-hash validation (C7, spec §4.7).

use std::collections::HashMap;

use crate::model::{FileHashes, KeyRecord, ValidationStatus};

/// Per-file reference digests assembled from every matching IRD
/// [`KeyRecord`] (spec §4.7): `game_version` must equal the disc's
/// version, records from other versions are ignored.
pub struct ReferenceHashes {
    /// source_path -> list of (algorithm, digest) pairs, one list entry
    /// per contributing IRD record since the same path may appear with
    /// differing hashes across archives (spec §4.7 iterates "for each
    /// reference record").
    per_file: HashMap<String, Vec<FileHashes>>,
}

impl ReferenceHashes {
    /// Builds the reference set from every `KeyRecord` sharing the chosen
    /// key id whose `game_version` matches `disc_version`.
    pub fn from_key_records(records: &[KeyRecord], disc_version: &str) -> Self {
        let mut per_file: HashMap<String, Vec<FileHashes>> = HashMap::new();
        for record in records {
            if record.game_version.as_deref() != Some(disc_version) {
                continue;
            }
            let Some(file_hashes) = &record.file_hashes else { continue };
            for (path, hashes) in file_hashes {
                per_file.entry(path.clone()).or_default().push(hashes.clone());
            }
        }
        ReferenceHashes { per_file }
    }

    pub fn has_any(&self) -> bool {
        !self.per_file.is_empty()
    }

    pub fn for_file(&self, source_path: &str) -> Option<&[FileHashes]> {
        self.per_file.get(source_path).map(|v| v.as_slice())
    }
}

/// Per-file validation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVerdict {
    /// At least one (algorithm, digest) pair matched a reference record.
    Verified,
    /// Reference hashes exist for this file but none matched.
    Mismatch,
    /// No reference hashes exist for this file at all.
    NoReference,
}

pub struct Validator<'a> {
    reference: &'a ReferenceHashes,
}

impl<'a> Validator<'a> {
    pub fn new(reference: &'a ReferenceHashes) -> Self {
        Validator { reference }
    }

    /// Implements the §4.7 match rule: for each reference record, for each
    /// (algorithm, digest) pair computed by the stream, if the reference
    /// contains the same algorithm with an equal digest, the file is
    /// verified. A single match across any reference record suffices.
    pub fn verify_file(&self, source_path: &str, computed: &FileHashes) -> FileVerdict {
        let Some(candidates) = self.reference.for_file(source_path) else {
            return FileVerdict::NoReference;
        };
        for reference_hashes in candidates {
            for (algorithm, digest) in computed {
                if reference_hashes.get(algorithm).is_some_and(|d| d.eq_ignore_ascii_case(digest)) {
                    return FileVerdict::Verified;
                }
            }
        }
        FileVerdict::Mismatch
    }
}

/// Folds a single file's verdict into the running overall status
/// (spec §4.7, §8 invariant 7): starts Ok, becomes Unknown on first file
/// with no reference, becomes Failed on any hard failure or non-matching
/// hash after retries are exhausted. `Failed` is sticky.
pub fn fold_status(current: ValidationStatus, verdict: ValidationFold) -> ValidationStatus {
    match (current, verdict) {
        (ValidationStatus::Failed, _) => ValidationStatus::Failed,
        (_, ValidationFold::HardFailure) => ValidationStatus::Failed,
        (ValidationStatus::Ok, ValidationFold::NoReference) => ValidationStatus::Unknown,
        (status, ValidationFold::NoReference) => status,
        (status, ValidationFold::Verified) => status,
    }
}

/// What the controller folds into the overall status after a file's copy
/// attempts are exhausted.
#[derive(Debug, Clone, Copy)]
pub enum ValidationFold {
    Verified,
    NoReference,
    HardFailure,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeySourceKind;
    use std::path::PathBuf;

    fn ird_record(version: &str, path: &str, algo: &str, digest: &str) -> KeyRecord {
        let mut hashes = FileHashes::new();
        hashes.insert(algo.to_string(), digest.to_string());
        let mut file_hashes = HashMap::new();
        file_hashes.insert(path.to_string(), hashes);
        KeyRecord {
            decrypted_key: [0u8; 16],
            decrypted_key_id: "id".to_string(),
            source_kind: KeySourceKind::Ird,
            source_path: PathBuf::from("game.ird"),
            game_version: Some(version.to_string()),
            file_hashes: Some(file_hashes),
        }
    }

    #[test]
    fn matching_algorithm_and_digest_verifies() {
        let records = vec![ird_record("01.00", "FILE.BIN", "md5", "abc123")];
        let reference = ReferenceHashes::from_key_records(&records, "01.00");
        let validator = Validator::new(&reference);
        let mut computed = FileHashes::new();
        computed.insert("md5".to_string(), "ABC123".to_string());
        assert_eq!(validator.verify_file("FILE.BIN", &computed), FileVerdict::Verified);
    }

    #[test]
    fn mismatched_digest_is_mismatch() {
        let records = vec![ird_record("01.00", "FILE.BIN", "md5", "abc123")];
        let reference = ReferenceHashes::from_key_records(&records, "01.00");
        let validator = Validator::new(&reference);
        let mut computed = FileHashes::new();
        computed.insert("md5".to_string(), "deadbeef".to_string());
        assert_eq!(validator.verify_file("FILE.BIN", &computed), FileVerdict::Mismatch);
    }

    #[test]
    fn file_with_no_reference_is_unknown() {
        let records = vec![ird_record("01.00", "OTHER.BIN", "md5", "abc123")];
        let reference = ReferenceHashes::from_key_records(&records, "01.00");
        let validator = Validator::new(&reference);
        let computed = FileHashes::new();
        assert_eq!(validator.verify_file("FILE.BIN", &computed), FileVerdict::NoReference);
    }

    #[test]
    fn records_from_other_game_version_are_ignored() {
        let records = vec![ird_record("02.00", "FILE.BIN", "md5", "abc123")];
        let reference = ReferenceHashes::from_key_records(&records, "01.00");
        assert!(!reference.has_any());
    }

    #[test]
    fn failed_status_is_sticky() {
        let status = fold_status(ValidationStatus::Failed, ValidationFold::Verified);
        assert_eq!(status, ValidationStatus::Failed);
    }

    #[test]
    fn unknown_does_not_revert_to_ok() {
        let status = fold_status(ValidationStatus::Unknown, ValidationFold::Verified);
        assert_eq!(status, ValidationStatus::Unknown);
    }
}
