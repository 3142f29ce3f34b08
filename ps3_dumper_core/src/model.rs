use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// 2048 bytes, the addressable unit of a Blu-ray/ISO-9660 disc.
pub const SECTOR_SIZE: usize = 2048;

/// Identity extracted from the on-disc manifests (spec §3, §4.3).
///
/// Immutable once `detect_disc` returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscIdentity {
    pub title: String,
    /// 9 characters, layout `AAAA#####`.
    pub product_code: String,
    pub disc_version: String,
    pub app_version: String,
    /// Derived from `product_code`'s third character via the region table.
    pub region_code: String,
}

impl DiscIdentity {
    pub fn product_code_letters(&self) -> &str {
        &self.product_code[..4.min(self.product_code.len())]
    }

    pub fn product_code_numbers(&self) -> &str {
        let start = 4.min(self.product_code.len());
        &self.product_code[start..]
    }
}

/// One file entry obtained from the ISO-9660 reader over the mounted disc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Disc-relative, backslash-delimited path as reported by the reader.
    pub source_path: String,
    /// `source_path` normalized to the host separator at write time.
    pub target_path: PathBuf,
    pub start_sector: u64,
    pub length: u64,
    pub ctime_utc: DateTime<Utc>,
    pub mtime_utc: DateTime<Utc>,
}

/// An empty directory entry, preserved in the output tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub target_path: PathBuf,
    pub ctime_utc: DateTime<Utc>,
    pub mtime_utc: DateTime<Utc>,
}

/// Which kind of local cache file a key was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySourceKind {
    Ird,
    Redump,
}

/// Per-file reference hashes: algorithm name (lowercase) -> hex digest.
pub type FileHashes = HashMap<String, String>;

/// A single decryption key discovered by a [`crate::keys::KeyProvider`].
///
/// Multiple `KeyRecord`s may share a `decrypted_key_id`; `KeyIndex` groups
/// them. Within a group every `decrypted_key` byte array is identical
/// (spec §3 invariant).
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub decrypted_key: [u8; 16],
    pub decrypted_key_id: String,
    pub source_kind: KeySourceKind,
    pub source_path: PathBuf,
    /// IRD-only: the game version this record's reference hashes apply to.
    pub game_version: Option<String>,
    /// IRD-only: per-file reference hashes, source_path -> {algorithm -> digest}.
    pub file_hashes: Option<HashMap<String, FileHashes>>,
}

impl KeyRecord {
    pub fn compute_key_id(key: &[u8; 16]) -> String {
        hex::encode(key)
    }
}

/// A half-open sector range `[start, end)` that the raw device delivers as
/// plaintext despite the disc being otherwise encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnprotectedRegion {
    pub start: u64,
    pub end: u64,
}

impl UnprotectedRegion {
    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.start && sector < self.end
    }
}

/// Built from the first discoverable known-plaintext file on the disc.
#[derive(Debug, Clone)]
pub struct DetectionProbe {
    pub sector_number: u64,
    pub expected_prefix: Vec<u8>,
    pub sector_iv: [u8; 16],
}

/// Priority-ordered list of (disc path, expected plaintext prefix) used to
/// build a [`DetectionProbe`] (spec §3).
pub const DETECTION_CANDIDATES: &[(&str, &[u8])] = &[
    (r"\PS3_GAME\LICDIR\LIC.DAT", b"PS3LICDA"),
    (r"\PS3_GAME\USRDIR\EBOOT.BIN", b"SCE\x00\x00\x00\x00\x02"),
];

/// Overall dump-wide validation verdict (spec §3, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Ok,
    Unknown,
    Failed,
}

/// Why a file was recorded in `broken_files` (spec §4.6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenReason {
    Missing,
    Corrupted,
    ReadFailed,
}

impl BrokenReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokenReason::Missing => "missing",
            BrokenReason::Corrupted => "corrupted",
            BrokenReason::ReadFailed => "failed to read",
        }
    }
}

/// Live progress snapshot, mutated only by the dump controller.
#[derive(Debug, Clone)]
pub struct DumpState {
    pub current_file_index: usize,
    pub total_file_count: usize,
    pub current_sector: u64,
    pub total_sectors: u64,
    pub validation_status: ValidationStatus,
    pub broken_files: Vec<(String, BrokenReason)>,
}

impl DumpState {
    pub fn new(total_file_count: usize, total_sectors: u64) -> Self {
        DumpState {
            current_file_index: 0,
            total_file_count,
            current_sector: 0,
            total_sectors,
            validation_status: ValidationStatus::Ok,
            broken_files: Vec::new(),
        }
    }
}

/// Looks up the region for a product code's third character (spec §4.3).
///
/// Total over the documented set; unknown letters map to the empty string
/// (spec §8 invariant 9).
pub fn region_for_product_code(product_code: &str) -> &'static str {
    match product_code.chars().nth(2) {
        Some('A') => "ASIA",
        Some('E') => "EU",
        Some('H') => "HK",
        Some('J') => "JP",
        Some('K') => "KR",
        Some('P') => "JP",
        Some('T') => "JP",
        Some('U') => "US",
        _ => "",
    }
}
