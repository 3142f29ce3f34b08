//! The decrypting, hashing read-side stream (C5, spec §4.5).

use std::cell::Cell;
use std::collections::HashMap;
use std::io::{self, Read};

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::cancel::CancellationToken;
use crate::crypto::decrypt_sector;
use crate::device::RawBlockDevice;
use crate::model::{UnprotectedRegion, SECTOR_SIZE};

/// Which extra digests (beyond the always-computed MD5) a stream should
/// maintain, driven by what the matched reference metadata declares
/// (spec §3 `ReferenceHashes`, §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct HashAlgorithms {
    pub sha1: bool,
    pub sha256: bool,
}

enum HashSink {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl HashSink {
    fn update(&mut self, data: &[u8]) {
        match self {
            HashSink::Md5(h) => h.update(data),
            HashSink::Sha1(h) => h.update(data),
            HashSink::Sha256(h) => h.update(data),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            HashSink::Md5(_) => "md5",
            HashSink::Sha1(_) => "sha1",
            HashSink::Sha256(_) => "sha256",
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            HashSink::Md5(h) => hex::encode(h.finalize()),
            HashSink::Sha1(h) => hex::encode(h.finalize()),
            HashSink::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// A read-side stream over a raw block device that transparently decrypts
/// encrypted sectors, passes unprotected ones through untouched, and feeds
/// every emitted byte through each configured hash sink (spec §4.5).
pub struct DecryptingFileReader<'a> {
    device: &'a mut dyn RawBlockDevice,
    key: [u8; 16],
    unprotected_regions: Vec<UnprotectedRegion>,
    file_length: u64,
    bytes_emitted: u64,
    sector_position: u64,
    sector_buffer: Vec<u8>,
    sector_buffer_offset: usize,
    hashers: Vec<HashSink>,
    last_block_corrupted: Cell<bool>,
    cancel: CancellationToken,
}

impl<'a> DecryptingFileReader<'a> {
    pub fn new(
        device: &'a mut dyn RawBlockDevice,
        key: [u8; 16],
        unprotected_regions: Vec<UnprotectedRegion>,
        start_sector: u64,
        file_length: u64,
        algorithms: HashAlgorithms,
        cancel: CancellationToken,
    ) -> Self {
        let mut hashers = vec![HashSink::Md5(Md5::new())];
        if algorithms.sha1 {
            hashers.push(HashSink::Sha1(Sha1::new()));
        }
        if algorithms.sha256 {
            hashers.push(HashSink::Sha256(Sha256::new()));
        }
        DecryptingFileReader {
            device,
            key,
            unprotected_regions,
            file_length,
            bytes_emitted: 0,
            sector_position: start_sector,
            sector_buffer: Vec::new(),
            sector_buffer_offset: 0,
            hashers,
            last_block_corrupted: Cell::new(false),
            cancel,
        }
    }

    /// Monotone sector cursor, for progress reporting (spec §4.5).
    pub fn sector_position(&self) -> u64 {
        self.sector_position
    }

    /// Set when a sector's decryption or read failed; the stream reports
    /// this but never raises — the controller decides whether to retry
    /// (spec §4.5, §4.6.b).
    pub fn last_block_corrupted(&self) -> bool {
        self.last_block_corrupted.get()
    }

    /// Finalizes every hash sink. Consumes the stream since hashers can
    /// only be finalized once.
    pub fn finish_hashes(self) -> HashMap<String, String> {
        self.hashers.into_iter().map(|h| (h.name().to_string(), h.finalize_hex())).collect()
    }

    fn is_unprotected(&self, sector: u64) -> bool {
        self.unprotected_regions.iter().any(|r| r.contains(sector))
    }

    fn fill_sector_buffer(&mut self) -> io::Result<()> {
        let sector = self.sector_position;
        let raw = match self.device.read_sector(sector) {
            Ok(raw) => raw,
            Err(err) => {
                self.last_block_corrupted.set(true);
                return Err(err);
            }
        };

        let plaintext = if self.is_unprotected(sector) {
            raw
        } else {
            let iv = self.device.get_sector_iv(sector);
            decrypt_sector(&self.key, &iv, &raw)
        };

        let remaining_in_file = self.file_length - self.bytes_emitted.min(self.file_length);
        let usable = (SECTOR_SIZE as u64).min(remaining_in_file) as usize;
        self.sector_buffer = plaintext[..usable].to_vec();
        self.sector_buffer_offset = 0;
        self.sector_position += 1;
        Ok(())
    }
}

impl<'a> Read for DecryptingFileReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.bytes_emitted < self.file_length {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.sector_buffer_offset >= self.sector_buffer.len() {
                if let Err(err) = self.fill_sector_buffer() {
                    if written > 0 {
                        // Short reads are reported through the return
                        // value; the caller sees `last_block_corrupted`
                        // on the next status check (spec §4.5).
                        return Ok(written);
                    }
                    return Err(err);
                }
                if self.sector_buffer.is_empty() {
                    break;
                }
            }
            let available = self.sector_buffer.len() - self.sector_buffer_offset;
            let to_copy = available.min(buf.len() - written);
            let chunk =
                &self.sector_buffer[self.sector_buffer_offset..self.sector_buffer_offset + to_copy];
            buf[written..written + to_copy].copy_from_slice(chunk);
            for hasher in &mut self.hashers {
                hasher.update(chunk);
            }
            self.sector_buffer_offset += to_copy;
            self.bytes_emitted += to_copy as u64;
            written += to_copy;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RawBlockDevice;
    use std::path::Path;

    struct FakeDevice {
        sectors: Vec<[u8; SECTOR_SIZE]>,
        unprotected: Vec<UnprotectedRegion>,
    }

    impl RawBlockDevice for FakeDevice {
        fn read_sector(&mut self, sector: u64) -> io::Result<[u8; SECTOR_SIZE]> {
            Ok(self.sectors[sector as usize])
        }

        fn path_to_sector_range(&mut self, _path: &str) -> io::Result<Option<(u64, u64)>> {
            Ok(None)
        }

        fn get_sector_iv(&self, sector: u64) -> [u8; 16] {
            let mut iv = [0u8; 16];
            iv[0] = sector as u8;
            iv
        }

        fn get_unprotected_regions(&self) -> Vec<UnprotectedRegion> {
            self.unprotected.clone()
        }

        fn device_path(&self) -> &Path {
            Path::new("/dev/fake")
        }
    }

    use crate::crypto::encrypt_sector;

    #[test]
    fn decrypts_encrypted_sectors_and_passes_through_unprotected() {
        let key = [0x55u8; 16];
        let mut plain0 = [0u8; SECTOR_SIZE];
        plain0[..5].copy_from_slice(b"first");
        let mut plain1 = [0xABu8; SECTOR_SIZE]; // this one is "unprotected" ciphertext == plaintext
        plain1[..6].copy_from_slice(b"second");

        let iv0 = {
            let mut iv = [0u8; 16];
            iv[0] = 0;
            iv
        };
        let sectors = vec![encrypt_sector(&key, &iv0, &plain0), plain1];

        let mut device = FakeDevice {
            sectors,
            unprotected: vec![UnprotectedRegion { start: 1, end: 2 }],
        };
        let regions = device.get_unprotected_regions();
        let cancel = CancellationToken::new();
        let mut stream = DecryptingFileReader::new(
            &mut device,
            key,
            regions,
            0,
            (SECTOR_SIZE * 2) as u64,
            HashAlgorithms::default(),
            cancel,
        );
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(&out[..5], b"first");
        assert_eq!(&out[SECTOR_SIZE..SECTOR_SIZE + 6], b"second");
        assert!(!stream.last_block_corrupted());
    }

    #[test]
    fn truncates_last_sector_to_declared_length() {
        let key = [0x11u8; 16];
        let plain = [0x42u8; SECTOR_SIZE];
        let iv = [0u8; 16];
        let sectors = vec![encrypt_sector(&key, &iv, &plain)];
        let mut device = FakeDevice { sectors, unprotected: Vec::new() };
        let regions = device.get_unprotected_regions();
        let cancel = CancellationToken::new();
        let mut stream =
            DecryptingFileReader::new(&mut device, key, regions, 0, 100, HashAlgorithms::default(), cancel);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn hashes_finalize_after_close() {
        let key = [0x33u8; 16];
        let plain = [0x00u8; SECTOR_SIZE];
        let iv = [0u8; 16];
        let sectors = vec![encrypt_sector(&key, &iv, &plain)];
        let mut device = FakeDevice { sectors, unprotected: Vec::new() };
        let regions = device.get_unprotected_regions();
        let cancel = CancellationToken::new();
        let mut stream = DecryptingFileReader::new(
            &mut device,
            key,
            regions,
            0,
            SECTOR_SIZE as u64,
            HashAlgorithms { sha1: true, sha256: true },
            cancel,
        );
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        let hashes = stream.finish_hashes();
        assert!(hashes.contains_key("md5"));
        assert!(hashes.contains_key("sha1"));
        assert!(hashes.contains_key("sha256"));
    }

    #[test]
    fn cancellation_stops_the_copy_loop() {
        let key = [0x22u8; 16];
        let plain = [0x00u8; SECTOR_SIZE];
        let iv = [0u8; 16];
        let sectors = vec![encrypt_sector(&key, &iv, &plain); 4];
        let mut device = FakeDevice { sectors, unprotected: Vec::new() };
        let regions = device.get_unprotected_regions();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = DecryptingFileReader::new(
            &mut device,
            key,
            regions,
            0,
            (SECTOR_SIZE * 4) as u64,
            HashAlgorithms::default(),
            cancel,
        );
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
