//! Platform dispatch for optical drive enumeration (spec §4.8, C8).
//!
//! Windows and Unix behavior live behind one trait so the rest of the
//! engine stays platform-agnostic, mirroring the `#[cfg(target_os = ...)]`
//! split `restore_keys.rs`'s `check_restore_tools` uses for Linux-only
//! tooling checks in the retrieval pack.

use std::path::PathBuf;

#[cfg(windows)]
pub mod windows;
#[cfg(unix)]
pub mod unix;

/// Enumerates raw-device paths for attached optical drives.
pub trait DriveEnumerator {
    fn list_optical_drives(&self) -> Vec<PathBuf>;
}

/// Returns the drive enumerator appropriate for the compiled target.
#[cfg(windows)]
pub fn default_enumerator() -> Box<dyn DriveEnumerator> {
    Box::new(windows::WindowsDriveEnumerator::default())
}

#[cfg(unix)]
pub fn default_enumerator() -> Box<dyn DriveEnumerator> {
    Box::new(unix::UnixDriveEnumerator::default())
}

#[cfg(not(any(windows, unix)))]
pub fn default_enumerator() -> Box<dyn DriveEnumerator> {
    struct NoDrives;
    impl DriveEnumerator for NoDrives {
        fn list_optical_drives(&self) -> Vec<PathBuf> {
            Vec::new()
        }
    }
    Box::new(NoDrives)
}
