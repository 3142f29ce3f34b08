//! Windows-family optical drive enumeration (spec §4.8).
//!
//! A real implementation would query the platform's storage inventory
//! (`IOCTL_STORAGE_QUERY_PROPERTY` / WMI `Win32_CDROMDrive`) for CD-ROM
//! devices; that API surface is outside this crate's scope, so the
//! fallback enumeration — probing `\\.\CDROMn` for n in 0..32 — is the one
//! always exercised here. `query_storage_inventory` is the seam a real
//! backend would replace.

use std::path::PathBuf;

use super::DriveEnumerator;

#[derive(Default)]
pub struct WindowsDriveEnumerator;

impl WindowsDriveEnumerator {
    /// Stand-in for the platform storage-inventory query. Returns `None`
    /// to signal "unavailable", which always falls back to the `CDROM0..31`
    /// probe per spec §4.8.
    fn query_storage_inventory(&self) -> Option<Vec<PathBuf>> {
        None
    }

    fn fallback_probe(&self) -> Vec<PathBuf> {
        (0..32)
            .map(|n| PathBuf::from(format!(r"\\.\CDROM{n}")))
            .collect()
    }
}

impl DriveEnumerator for WindowsDriveEnumerator {
    fn list_optical_drives(&self) -> Vec<PathBuf> {
        match self.query_storage_inventory() {
            Some(drives) if !drives.is_empty() => drives,
            _ => self.fallback_probe(),
        }
    }
}
