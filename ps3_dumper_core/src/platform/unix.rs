//! Unix-family optical drive enumeration (spec §4.8).
//!
//! Parses the kernel's `/proc/sys/dev/cdrom/info` table for `drive name:`
//! entries and globs `/dev/sr*`, deduplicating and keeping only paths that
//! still exist.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::DriveEnumerator;

const CDROM_INFO_PATH: &str = "/proc/sys/dev/cdrom/info";

#[derive(Default)]
pub struct UnixDriveEnumerator;

impl UnixDriveEnumerator {
    fn from_cdrom_info(&self, contents: &str) -> Vec<PathBuf> {
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("drive name:") {
                return rest
                    .split_whitespace()
                    .map(|name| PathBuf::from(format!("/dev/{name}")))
                    .collect();
            }
        }
        Vec::new()
    }

    fn glob_dev_sr(&self) -> Vec<PathBuf> {
        let dev = Path::new("/dev");
        let Ok(entries) = fs::read_dir(dev) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("sr"))
            })
            .collect()
    }
}

impl DriveEnumerator for UnixDriveEnumerator {
    fn list_optical_drives(&self) -> Vec<PathBuf> {
        let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();
        if let Ok(info) = fs::read_to_string(CDROM_INFO_PATH) {
            candidates.extend(self.from_cdrom_info(&info));
        }
        candidates.extend(self.glob_dev_sr());
        candidates.into_iter().filter(|p| p.exists()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_drive_name_line() {
        let enumerator = UnixDriveEnumerator;
        let info = "CD-ROM information, Id: cdrom.c 3.20\n\ndrive name:\t\tsr1\tsr0\n";
        let drives = enumerator.from_cdrom_info(info);
        assert_eq!(drives, vec![PathBuf::from("/dev/sr1"), PathBuf::from("/dev/sr0")]);
    }

    #[test]
    fn missing_info_table_yields_empty() {
        let enumerator = UnixDriveEnumerator;
        assert!(enumerator.from_cdrom_info("").is_empty());
    }
}
