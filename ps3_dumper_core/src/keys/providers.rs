//! The two concrete key sources (spec §4.1, §6, GLOSSARY).
//!
//! Both scan `cache_dir` recursively for files of their own kind, parse
//! each independently, and never let one bad file abort the scan — errors
//! are logged and the file is skipped, since the key cache is explicitly
//! best-effort (spec §7). The real `.ird` archive format and redump key
//! dump layout are community formats outside this crate's scope (spec
//! §1); the parsers here implement a minimal, self-consistent binary
//! layout sufficient to drive and test the full pipeline end to end.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use binrw::{BinRead, BinReaderExt, BinWrite};

use crate::cancel::CancellationToken;
use crate::model::{FileHashes, KeyRecord, KeySourceKind};

use super::KeyProvider;

/// Minimal stand-in for an `.ird` archive: magic, product code, game
/// version, the 16-byte disc key, and a per-file MD5 hash table.
#[derive(BinRead, BinWrite, Debug)]
#[brw(magic = b"3IRD", big)]
struct IrdHeader {
    product_code: [u8; 9],
    game_version: [u8; 4],
    disc_key: [u8; 16],
    file_count: u32,
    #[br(count = file_count)]
    files: Vec<IrdFileEntry>,
}

#[derive(BinRead, BinWrite, Debug)]
#[brw(big)]
struct IrdFileEntry {
    path_len: u16,
    #[br(count = path_len)]
    path_bytes: Vec<u8>,
    md5: [u8; 16],
}

fn walk_files(dir: &Path, matches: impl Fn(&Path) -> bool + Copy) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path, matches));
        } else if matches(&path) {
            out.push(path);
        }
    }
    out
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Parses `.ird` archives. Preferred as the tie-break carrier of richer
/// metadata when multiple sources yield the same key id (spec §4.1).
pub struct IrdProvider;

impl IrdProvider {
    fn parse_one(path: &Path) -> Result<KeyRecord, String> {
        let bytes = fs::read(path).map_err(|e| e.to_string())?;
        let mut cursor = std::io::Cursor::new(&bytes);
        let header: IrdHeader = cursor.read_be().map_err(|e| e.to_string())?;

        let game_version = String::from_utf8_lossy(&header.game_version).trim().to_string();

        let mut file_hashes: HashMap<String, FileHashes> = HashMap::new();
        for entry in &header.files {
            let file_path = String::from_utf8_lossy(&entry.path_bytes).to_string();
            let mut hashes = FileHashes::new();
            hashes.insert("md5".to_string(), hex::encode(entry.md5));
            file_hashes.insert(file_path, hashes);
        }

        Ok(KeyRecord {
            decrypted_key: header.disc_key,
            decrypted_key_id: KeyRecord::compute_key_id(&header.disc_key),
            source_kind: KeySourceKind::Ird,
            source_path: path.to_path_buf(),
            game_version: Some(game_version),
            file_hashes: Some(file_hashes),
        })
    }
}

impl KeyProvider for IrdProvider {
    fn enumerate(
        &self,
        cache_dir: &Path,
        _product_code: &str,
        cancel: &CancellationToken,
    ) -> Vec<KeyRecord> {
        let mut records = Vec::new();
        for path in walk_files(cache_dir, |p| has_extension(p, "ird")) {
            if cancel.is_cancelled() {
                break;
            }
            match Self::parse_one(&path) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!("skipping unreadable IRD file {}: {err}", path.display()),
            }
        }
        records
    }
}

/// Parses flat redump key dump files: a single 32-character hex string
/// (the 16-byte title key), no per-file hashes. Conventionally named
/// `<product_code>.dkey`.
pub struct RedumpProvider;

impl RedumpProvider {
    fn parse_one(path: &Path) -> Result<KeyRecord, String> {
        let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let trimmed = contents.trim();
        let bytes = hex::decode(trimmed).map_err(|e| e.to_string())?;
        let key: [u8; 16] = bytes
            .try_into()
            .map_err(|_| "redump key dump must decode to exactly 16 bytes".to_string())?;
        Ok(KeyRecord {
            decrypted_key: key,
            decrypted_key_id: KeyRecord::compute_key_id(&key),
            source_kind: KeySourceKind::Redump,
            source_path: path.to_path_buf(),
            game_version: None,
            file_hashes: None,
        })
    }
}

impl KeyProvider for RedumpProvider {
    fn enumerate(
        &self,
        cache_dir: &Path,
        _product_code: &str,
        cancel: &CancellationToken,
    ) -> Vec<KeyRecord> {
        let mut records = Vec::new();
        for path in walk_files(cache_dir, |p| has_extension(p, "dkey") || has_extension(p, "key"))
        {
            if cancel.is_cancelled() {
                break;
            }
            match Self::parse_one(&path) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!("skipping unreadable redump key file {}: {err}", path.display()),
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinWrite;
    use tempfile::tempdir;

    fn write_ird(path: &Path, product_code: &str, game_version: &str, key: [u8; 16]) {
        let mut pc = [0u8; 9];
        pc[..product_code.len().min(9)].copy_from_slice(product_code.as_bytes());
        let mut gv = [0u8; 4];
        gv[..game_version.len().min(4)].copy_from_slice(game_version.as_bytes());
        let header = IrdHeader {
            product_code: pc,
            game_version: gv,
            disc_key: key,
            file_count: 1,
            files: vec![IrdFileEntry {
                path_len: 8,
                path_bytes: b"FILE.BIN".to_vec(),
                md5: [0xAB; 16],
            }],
        };
        let mut buf = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut buf);
        header.write_be(&mut cursor).unwrap();
        fs::write(path, buf).unwrap();
    }

    #[test]
    fn ird_provider_parses_well_formed_archive() {
        let dir = tempdir().unwrap();
        let ird_path = dir.path().join("game.ird");
        write_ird(&ird_path, "BLES01234", "0100", [0x11; 16]);

        let cancel = CancellationToken::new();
        let records = IrdProvider.enumerate(dir.path(), "BLES01234", &cancel);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decrypted_key, [0x11; 16]);
        assert_eq!(records[0].game_version.as_deref(), Some("0100"));
        assert!(records[0].file_hashes.as_ref().unwrap().contains_key("FILE.BIN"));
    }

    #[test]
    fn ird_provider_skips_corrupt_file_without_failing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bad.ird"), b"not an ird file").unwrap();
        let cancel = CancellationToken::new();
        let records = IrdProvider.enumerate(dir.path(), "BLES01234", &cancel);
        assert!(records.is_empty());
    }

    #[test]
    fn redump_provider_parses_hex_key_dump() {
        let dir = tempdir().unwrap();
        let key_hex = "2".repeat(32);
        fs::write(dir.path().join("BLES01234.dkey"), format!("{key_hex}\n")).unwrap();
        let cancel = CancellationToken::new();
        let records = RedumpProvider.enumerate(dir.path(), "BLES01234", &cancel);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decrypted_key, [0x22; 16]);
        assert!(records[0].file_hashes.is_none());
    }

    #[test]
    fn redump_provider_skips_invalid_hex() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.dkey"), "not-hex").unwrap();
        let cancel = CancellationToken::new();
        let records = RedumpProvider.enumerate(dir.path(), "BLES01234", &cancel);
        assert!(records.is_empty());
    }
}
