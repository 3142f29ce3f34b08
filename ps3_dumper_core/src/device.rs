//! The two disc-side data sources named in spec §6: the mounted filesystem
//! and the raw, sector-addressed block device. Both are external
//! collaborators in this engine's scope — the real ISO-9660 reader and
//! device IOCTLs live outside this crate — so they are modeled as traits
//! the engine drives, exactly as `disc_riider`'s `WiiIsoReader` is generic
//! over any `Read + Seek` source.

use std::io;
use std::path::{Path, PathBuf};

use crate::model::{DirRecord, FileRecord, UnprotectedRegion, SECTOR_SIZE};

/// A mounted disc, readable as an ordinary filesystem.
///
/// Provides the manifest files the identifier parses and the full file
/// tree the dump controller copies from.
pub trait MountedDisc {
    /// Root directory of the mount, e.g. `/media/ps3disc` or `D:\`.
    fn root(&self) -> &Path;

    /// Reads a whole file relative to `root()`, using the mount's own
    /// native path separator conventions.
    fn read_file(&self, relative_path: &Path) -> io::Result<Vec<u8>>;

    /// True if a file exists (and, per spec §4.6.a, is non-empty-checkable)
    /// at the given mount-relative path.
    fn file_exists(&self, relative_path: &Path) -> bool;

    /// Enumerates every [`FileRecord`] under the mount (spec §4.3 step 4).
    fn list_files(&self) -> io::Result<Vec<FileRecord>>;

    /// Enumerates every directory under the mount that contains no files,
    /// directly or transitively, so the dump controller can recreate them
    /// (spec.md §3 `DirRecord` doc: "Includes empty directories").
    fn list_empty_dirs(&self) -> io::Result<Vec<DirRecord>>;
}

/// The same disc accessed as a raw, sector-addressed block device.
///
/// Exposes the ISO-9660 structure (`sector_size`, cluster lookup) plus the
/// two disc-crypto helpers spec §6 calls out: `get_sector_iv` and
/// `get_unprotected_regions`.
pub trait RawBlockDevice {
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Reads exactly one sector's ciphertext (or plaintext, for unprotected
    /// regions) at the given sector number.
    fn read_sector(&mut self, sector: u64) -> io::Result<[u8; SECTOR_SIZE]>;

    /// Resolves a disc-relative path to its (start_sector, length_in_bytes),
    /// used by the disc identifier to locate `PS3_DISC.SFB` on a raw device
    /// candidate (spec §6: `path_to_clusters`).
    fn path_to_sector_range(&mut self, path: &str) -> io::Result<Option<(u64, u64)>>;

    /// Platform/device-supplied 16-byte IV for sector `n`.
    fn get_sector_iv(&self, sector: u64) -> [u8; 16];

    /// Platform/device-supplied list of plaintext sector ranges.
    fn get_unprotected_regions(&self) -> Vec<UnprotectedRegion>;

    /// Identifying path of this device, e.g. `/dev/sr0` or `\\.\CDROM0`.
    fn device_path(&self) -> &Path;
}

/// Owned variant used where a device handle must be stored, matching the
/// shape `disc_riider::reader::WiiIsoReader<RS>` takes a generic `RS`.
pub type BoxedRawBlockDevice = Box<dyn RawBlockDevice + Send>;

pub fn device_path_buf(dev: &dyn RawBlockDevice) -> PathBuf {
    dev.device_path().to_path_buf()
}

/// The disc's authoritative file/directory catalog as produced by parsing
/// the ISO-9660 structure on the raw device (spec §4.6 step 1). This is a
/// separate trait from `RawBlockDevice` because the real ISO-9660 parser is
/// an external collaborator out of this crate's scope (spec §1, §6); the
/// engine only needs to hand it a buffer (or the live device) and get a
/// catalog back.
pub trait IsoCatalogReader {
    /// Parses a catalog from an in-memory prefix of the raw device, as
    /// produced by [`read_device_prefix`]. Fails if the buffer doesn't hold
    /// a complete-enough ISO-9660 structure to enumerate everything.
    fn catalog_from_buffer(&self, buffer: &[u8]) -> io::Result<(Vec<FileRecord>, Vec<DirRecord>)>;

    /// Parses a catalog by reading directly from the live device, sector by
    /// sector, with no size limit. Used as the fallback when the buffered
    /// parse fails (spec §4.6 step 1).
    fn catalog_live(
        &self,
        device: &mut dyn RawBlockDevice,
    ) -> io::Result<(Vec<FileRecord>, Vec<DirRecord>)>;
}

/// How much of the raw device to read into memory before attempting the
/// buffered ISO-9660 parse (spec §4.6 step 1).
pub const CATALOG_BUFFER_BYTES: u64 = 64 * 1024 * 1024;

/// Builds the authoritative file/directory catalog for a dump (spec §4.6
/// step 1): reads the first [`CATALOG_BUFFER_BYTES`] of `device` into
/// memory and hands it to `iso_reader`, falling back to a live read of
/// `device` if the buffered parse fails.
pub fn build_catalog(
    iso_reader: &dyn IsoCatalogReader,
    device: &mut dyn RawBlockDevice,
) -> io::Result<(Vec<FileRecord>, Vec<DirRecord>)> {
    let buffer = read_device_prefix(device, CATALOG_BUFFER_BYTES)?;
    match iso_reader.catalog_from_buffer(&buffer) {
        Ok(catalog) => Ok(catalog),
        Err(err) => {
            log::warn!(
                "buffered ISO-9660 parse of first {CATALOG_BUFFER_BYTES} bytes failed ({err}); \
                 falling back to live raw-device reader"
            );
            iso_reader.catalog_live(device)
        }
    }
}

/// Reads up to `max_bytes` from the start of `device`, stopping early (with
/// whatever was read so far) if the device is shorter than that.
fn read_device_prefix(device: &mut dyn RawBlockDevice, max_bytes: u64) -> io::Result<Vec<u8>> {
    let sector_size = device.sector_size() as u64;
    let sector_count = max_bytes.div_ceil(sector_size);
    let mut buffer = Vec::with_capacity((sector_count * sector_size) as usize);
    for sector in 0..sector_count {
        match device.read_sector(sector) {
            Ok(data) => buffer.extend_from_slice(&data),
            Err(_) => break,
        }
    }
    Ok(buffer)
}
