//! Per-file copy orchestration (C6, spec §4.6).

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use filetime::{set_file_times, FileTime};

use crate::cancel::CancellationToken;
use crate::device::{MountedDisc, RawBlockDevice};
use crate::model::{
    BrokenReason, DirRecord, FileHashes, FileRecord, UnprotectedRegion, ValidationStatus,
};
use crate::stream::{DecryptingFileReader, HashAlgorithms};
use crate::validate::{FileVerdict, ReferenceHashes, Validator};

/// Default chunk size for the per-file copy loop (spec §4.6.b, §5).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Maximum copy attempts per file before giving up (spec §4.6.b).
const MAX_ATTEMPTS: u32 = 2;

/// Reserve bytes compared against destination free space before starting
/// (spec §4.6 step 2).
const FREE_SPACE_MARGIN_BYTES: u64 = 100 * 1024;

/// Seam for destination free-space reporting. The real implementation is
/// an OS-specific statvfs/GetDiskFreeSpaceEx call, outside this crate's
/// scope; `None` means "unknown", which skips the check entirely rather
/// than blocking a dump on an unanswerable question.
pub trait OutputVolume {
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Default volume reporter: always unknown, matching a deployment with no
/// platform-specific free-space query wired in.
pub struct UnknownVolume;

impl OutputVolume for UnknownVolume {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        None
    }
}

/// Final summary of one `dump` invocation (spec §3 `Dump state`, §6).
#[derive(Debug, Clone)]
pub struct DumpReport {
    pub validation_status: ValidationStatus,
    pub broken_files: Vec<(String, BrokenReason)>,
}

/// Orchestrates per-file copy, retry-on-hash-mismatch, directory
/// reconstruction, timestamp restoration, progress reporting, and
/// cancellation (spec §4.6).
pub struct DumpController<'a> {
    device: &'a mut dyn RawBlockDevice,
    mount: &'a dyn MountedDisc,
    key: [u8; 16],
    unprotected_regions: Vec<UnprotectedRegion>,
    files: Vec<FileRecord>,
    dirs: Vec<DirRecord>,
    reference: ReferenceHashes,
    reference_algorithms: HashAlgorithms,
    cancel: CancellationToken,
    chunk_size: usize,
}

impl<'a> DumpController<'a> {
    pub fn new(
        device: &'a mut dyn RawBlockDevice,
        mount: &'a dyn MountedDisc,
        key: [u8; 16],
        files: Vec<FileRecord>,
        dirs: Vec<DirRecord>,
        reference: ReferenceHashes,
        cancel: CancellationToken,
    ) -> Self {
        let unprotected_regions = device.get_unprotected_regions();
        let reference_algorithms = detect_reference_algorithms(&reference, &files);
        DumpController {
            device,
            mount,
            key,
            unprotected_regions,
            files,
            dirs,
            reference,
            reference_algorithms,
            cancel,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Runs the full sequence from spec §4.6 steps 1-6.
    ///
    /// `progress` is called after every file's outcome is known (success
    /// or recorded as broken); `volume` backs the best-effort free-space
    /// warning.
    pub fn run(
        &mut self,
        output_base: &Path,
        volume: &dyn OutputVolume,
        mut progress: impl FnMut(usize, usize),
    ) -> io::Result<DumpReport> {
        self.warn_if_low_on_space(output_base, volume);
        self.materialize_directory_tree(output_base)?;

        let mut status = ValidationStatus::Ok;
        let mut broken_files = Vec::new();
        let total = self.files.len();

        for index in 0..total {
            if self.cancel.is_cancelled() {
                break;
            }
            let file = self.files[index].clone();
            let outcome = self.copy_one_file(output_base, &file);
            match outcome {
                FileOutcome::Missing => {
                    broken_files.push((file.source_path.clone(), BrokenReason::Missing));
                    status = ValidationStatus::Failed;
                }
                FileOutcome::Corrupted => {
                    broken_files.push((file.source_path.clone(), BrokenReason::Corrupted));
                    status = ValidationStatus::Failed;
                }
                FileOutcome::ReadFailed => {
                    broken_files.push((file.source_path.clone(), BrokenReason::ReadFailed));
                    status = ValidationStatus::Failed;
                }
                FileOutcome::NoReference => {
                    if status == ValidationStatus::Ok {
                        status = ValidationStatus::Unknown;
                    }
                }
                FileOutcome::Verified => {}
                FileOutcome::Cancelled => break,
            }
            progress(index + 1, total);
        }

        self.restore_directory_timestamps(output_base)?;

        Ok(DumpReport { validation_status: status, broken_files })
    }

    fn warn_if_low_on_space(&self, output_base: &Path, volume: &dyn OutputVolume) {
        let total_bytes: u64 = self.files.iter().map(|f| f.length).sum();
        if let Some(available) = volume.available_bytes(output_base) {
            if available < total_bytes + FREE_SPACE_MARGIN_BYTES {
                log::warn!(
                    "destination has {available} bytes free, dump needs ~{} bytes; proceeding anyway",
                    total_bytes + FREE_SPACE_MARGIN_BYTES
                );
            }
        }
    }

    fn materialize_directory_tree(&self, output_base: &Path) -> io::Result<()> {
        for dir in &self.dirs {
            fs::create_dir_all(output_base.join(&dir.target_path))?;
        }
        for file in &self.files {
            if let Some(parent) = file.target_path.parent() {
                fs::create_dir_all(output_base.join(parent))?;
            }
        }
        Ok(())
    }

    /// Attempts up to [`MAX_ATTEMPTS`] copies of one file (spec §4.6.b).
    fn copy_one_file(&mut self, output_base: &Path, file: &FileRecord) -> FileOutcome {
        if self.cancel.is_cancelled() {
            return FileOutcome::Cancelled;
        }

        if !self.mount.file_exists(&file.target_path) {
            return FileOutcome::Missing;
        }

        let output_path = output_base.join(&file.target_path);
        let mut previous_md5: Option<String> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return FileOutcome::Cancelled;
            }

            let copy_result = self.try_copy_once(&output_path, file);
            let (hashes, last_block_corrupted) = match copy_result {
                Ok(result) => result,
                Err(_) if attempt < MAX_ATTEMPTS => {
                    log::warn!("read error copying {}, retrying", file.source_path);
                    continue;
                }
                Err(_) => {
                    log::warn!("giving up on {} after {attempt} attempts", file.source_path);
                    return FileOutcome::ReadFailed;
                }
            };

            let md5 = hashes.get("md5").cloned().unwrap_or_default();
            let verdict = Validator::new(&self.reference).verify_file(&file.source_path, &hashes);

            match verdict {
                FileVerdict::Verified => {
                    self.restore_file_timestamps(&output_path, file);
                    return FileOutcome::Verified;
                }
                FileVerdict::NoReference => {
                    self.restore_file_timestamps(&output_path, file);
                    return FileOutcome::NoReference;
                }
                FileVerdict::Mismatch => {
                    let repeats_previous = previous_md5.as_deref() == Some(md5.as_str());
                    if repeats_previous || last_block_corrupted || attempt == MAX_ATTEMPTS {
                        log::warn!("hash mismatch for {}, giving up", file.source_path);
                        return FileOutcome::Corrupted;
                    }
                    log::warn!("hash mismatch for {}, retrying", file.source_path);
                    previous_md5 = Some(md5);
                }
            }
        }
        FileOutcome::Corrupted
    }

    fn try_copy_once(
        &mut self,
        output_path: &Path,
        file: &FileRecord,
    ) -> io::Result<(FileHashes, bool)> {
        let mut output = File::create(output_path)?;
        let mut stream = DecryptingFileReader::new(
            self.device,
            self.key,
            self.unprotected_regions.clone(),
            file.start_sector,
            file.length,
            self.reference_algorithms,
            self.cancel.clone(),
        );

        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let read = stream.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            output.write_all(&buffer[..read])?;
        }
        output.flush()?;
        let last_block_corrupted = stream.last_block_corrupted();
        let hashes = stream.finish_hashes();
        Ok((hashes, last_block_corrupted))
    }

    fn restore_file_timestamps(&self, output_path: &Path, file: &FileRecord) {
        let mtime = FileTime::from_unix_time(file.mtime_utc.timestamp(), 0);
        if let Err(err) = set_file_times(output_path, mtime, mtime) {
            log::warn!("failed to restore timestamps for {}: {err}", output_path.display());
        }
        restore_creation_time(output_path, file.ctime_utc);
    }

    /// Walks target directories in reverse lexical order and restores
    /// their timestamps, so parent writes never clobber a child's already
    /// restored mtime (spec §4.6 step 5, §8 invariant 6).
    fn restore_directory_timestamps(&self, output_base: &Path) -> io::Result<()> {
        let mut dirs = self.dirs.clone();
        dirs.sort_by(|a, b| b.target_path.cmp(&a.target_path));
        for dir in &dirs {
            let path = output_base.join(&dir.target_path);
            let mtime = FileTime::from_unix_time(dir.mtime_utc.timestamp(), 0);
            if let Err(err) = set_file_times(&path, mtime, mtime) {
                log::warn!("failed to restore timestamps for {}: {err}", path.display());
            }
            restore_creation_time(&path, dir.ctime_utc);
        }
        Ok(())
    }
}

/// Restores the source ctime as the output path's *creation* time (spec §8
/// invariant 6), on the one platform where that's a real, settable field
/// distinct from mtime: Windows. `filetime` has no ctime/birthtime setter,
/// so this uses the stable `std::fs::FileTimes` API directly.
///
/// On POSIX, `ctime` is the kernel-maintained inode change time: it's
/// bumped automatically on every metadata write and can't be set to an
/// arbitrary historical value without root and platform-specific tooling
/// (e.g. debugfs), so there is nothing to restore it to; this is a no-op.
#[cfg(windows)]
fn restore_creation_time(path: &Path, ctime_utc: DateTime<Utc>) {
    use std::os::windows::fs::{FileTimesExt, OpenOptionsExt};

    const FILE_FLAG_BACKUP_SEMANTICS: u32 = 0x0200_0000;

    let seconds = ctime_utc.timestamp().max(0) as u64;
    let system_time = std::time::UNIX_EPOCH + std::time::Duration::from_secs(seconds);
    let times = fs::FileTimes::new().set_created(system_time);

    let result = fs::OpenOptions::new()
        .write(true)
        .custom_flags(FILE_FLAG_BACKUP_SEMANTICS)
        .open(path)
        .and_then(|f| f.set_times(times));
    if let Err(err) = result {
        log::warn!("failed to restore creation time for {}: {err}", path.display());
    }
}

#[cfg(not(windows))]
fn restore_creation_time(_path: &Path, _ctime_utc: DateTime<Utc>) {}

fn detect_reference_algorithms(reference: &ReferenceHashes, files: &[FileRecord]) -> HashAlgorithms {
    let mut algorithms = HashAlgorithms::default();
    for file in files {
        let Some(candidates) = reference.for_file(&file.source_path) else { continue };
        for hashes in candidates {
            if hashes.contains_key("sha1") {
                algorithms.sha1 = true;
            }
            if hashes.contains_key("sha256") {
                algorithms.sha256 = true;
            }
        }
    }
    algorithms
}

enum FileOutcome {
    Verified,
    NoReference,
    Missing,
    Corrupted,
    ReadFailed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KeyRecord, KeySourceKind, SECTOR_SIZE};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct FakeDevice {
        sectors: Vec<[u8; SECTOR_SIZE]>,
        key: [u8; 16],
    }

    impl RawBlockDevice for FakeDevice {
        fn read_sector(&mut self, sector: u64) -> io::Result<[u8; SECTOR_SIZE]> {
            self.sectors
                .get(sector as usize)
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "sector out of range"))
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
            Vec::new()
        }

        fn device_path(&self) -> &Path {
            Path::new("/dev/fake")
        }
    }

    use crate::crypto::encrypt_sector;

    /// A mount that reports every path present except those named in
    /// `missing` (spec §4.6 step 4a).
    struct FakeMount {
        missing: std::collections::HashSet<PathBuf>,
    }

    impl FakeMount {
        fn all_present() -> Self {
            FakeMount { missing: std::collections::HashSet::new() }
        }

        fn with_missing(paths: &[&str]) -> Self {
            FakeMount { missing: paths.iter().map(PathBuf::from).collect() }
        }
    }

    impl MountedDisc for FakeMount {
        fn root(&self) -> &Path {
            Path::new("/mnt/disc")
        }

        fn read_file(&self, _relative_path: &Path) -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "not used by DumpController"))
        }

        fn file_exists(&self, relative_path: &Path) -> bool {
            !self.missing.contains(relative_path)
        }

        fn list_files(&self) -> io::Result<Vec<FileRecord>> {
            Ok(Vec::new())
        }

        fn list_empty_dirs(&self) -> io::Result<Vec<DirRecord>> {
            Ok(Vec::new())
        }
    }

    fn iv_for(device: &FakeDevice, sector: u64) -> [u8; 16] {
        device.get_sector_iv(sector)
    }

    fn make_file(name: &str, start_sector: u64, length: u64) -> FileRecord {
        FileRecord {
            source_path: name.to_string(),
            target_path: PathBuf::from(name),
            start_sector,
            length,
            ctime_utc: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            mtime_utc: Utc.timestamp_opt(1_600_000_100, 0).unwrap(),
        }
    }

    fn ird_with_hash(path: &str, version: &str, md5_hex: &str) -> KeyRecord {
        let mut hashes = FileHashes::new();
        hashes.insert("md5".to_string(), md5_hex.to_string());
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
    fn happy_path_copies_and_verifies_against_reference() {
        let key = [0x10u8; 16];
        let mut plaintext = [0u8; SECTOR_SIZE];
        plaintext[..4].copy_from_slice(b"data");
        let mut device = FakeDevice { sectors: vec![], key };
        let iv = iv_for(&device, 0);
        device.sectors.push(encrypt_sector(&key, &iv, &plaintext));

        let computed_md5 = {
            use md5::{Digest, Md5};
            let mut h = Md5::new();
            h.update(&plaintext[..4]);
            hex::encode(h.finalize())
        };

        let file = make_file("FILE.BIN", 0, 4);
        let ird = ird_with_hash("FILE.BIN", "01.00", &computed_md5);
        let reference = ReferenceHashes::from_key_records(&[ird], "01.00");

        let out_dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mount = FakeMount::all_present();
        let mut controller =
            DumpController::new(&mut device, &mount, key, vec![file], vec![], reference, cancel);
        let report = controller.run(out_dir.path(), &UnknownVolume, |_, _| {}).unwrap();

        assert_eq!(report.validation_status, ValidationStatus::Ok);
        assert!(report.broken_files.is_empty());
        let content = fs::read(out_dir.path().join("FILE.BIN")).unwrap();
        assert_eq!(&content, b"data");
    }

    #[test]
    fn missing_mount_file_is_recorded_and_does_not_block_others() {
        // GOOD.BIN is present on the mount and copies normally; BAD.BIN is
        // cataloged (it has a FileRecord) but absent from the mount, so it
        // must be reported missing without interrupting the loop (spec
        // §4.6 step 4a).
        let key = [0x20u8; 16];
        let mut device = FakeDevice { sectors: vec![], key };
        let mut good_plain = [0u8; SECTOR_SIZE];
        good_plain[..4].copy_from_slice(b"good");
        let iv0 = iv_for(&device, 0);
        device.sectors.push(encrypt_sector(&key, &iv0, &good_plain));

        let file_good = make_file("GOOD.BIN", 0, 4);
        let file_missing = make_file("MISSING.BIN", 1, 3);
        let reference = ReferenceHashes::from_key_records(&[], "01.00");

        let out_dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mount = FakeMount::with_missing(&["MISSING.BIN"]);
        let mut controller = DumpController::new(
            &mut device,
            &mount,
            key,
            vec![file_good, file_missing],
            vec![],
            reference,
            cancel,
        );
        let report = controller.run(out_dir.path(), &UnknownVolume, |_, _| {}).unwrap();
        assert_eq!(report.validation_status, ValidationStatus::Failed);
        assert_eq!(report.broken_files, vec![("MISSING.BIN".to_string(), BrokenReason::Missing)]);
        assert!(out_dir.path().join("GOOD.BIN").exists());
        assert!(!out_dir.path().join("MISSING.BIN").exists());
    }

    #[test]
    fn persistent_hash_mismatch_is_reported_as_corrupted() {
        let key = [0x30u8; 16];
        let mut plaintext = [0u8; SECTOR_SIZE];
        plaintext[..4].copy_from_slice(b"data");
        let mut device = FakeDevice { sectors: vec![], key };
        let iv = iv_for(&device, 0);
        device.sectors.push(encrypt_sector(&key, &iv, &plaintext));

        let file = make_file("FILE.BIN", 0, 4);
        // Reference hash deliberately wrong so the file never verifies.
        let ird = ird_with_hash("FILE.BIN", "01.00", "0000000000000000000000000000000");
        let reference = ReferenceHashes::from_key_records(&[ird], "01.00");

        let out_dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mount = FakeMount::all_present();
        let mut controller =
            DumpController::new(&mut device, &mount, key, vec![file], vec![], reference, cancel);
        let report = controller.run(out_dir.path(), &UnknownVolume, |_, _| {}).unwrap();

        assert_eq!(report.validation_status, ValidationStatus::Failed);
        assert_eq!(report.broken_files.len(), 1);
        assert_eq!(report.broken_files[0].1, BrokenReason::Corrupted);
    }

    #[test]
    fn cancellation_mid_run_does_not_mark_status_failed() {
        let key = [0x40u8; 16];
        let mut plaintext = [0u8; SECTOR_SIZE];
        plaintext[..4].copy_from_slice(b"data");
        let mut device = FakeDevice { sectors: vec![], key };
        let iv = iv_for(&device, 0);
        device.sectors.push(encrypt_sector(&key, &iv, &plaintext));

        let file = make_file("FILE.BIN", 0, 4);
        let reference = ReferenceHashes::from_key_records(&[], "01.00");

        let out_dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mount = FakeMount::all_present();
        let mut controller =
            DumpController::new(&mut device, &mount, key, vec![file], vec![], reference, cancel);
        let report = controller.run(out_dir.path(), &UnknownVolume, |_, _| {}).unwrap();

        assert_ne!(report.validation_status, ValidationStatus::Failed);
        assert!(report.broken_files.is_empty());
    }

    #[test]
    fn empty_directories_are_materialized() {
        let key = [0x50u8; 16];
        let mut device = FakeDevice { sectors: vec![], key };
        device.sectors.push([0u8; SECTOR_SIZE]);
        let reference = ReferenceHashes::from_key_records(&[], "01.00");
        let dir = DirRecord {
            target_path: PathBuf::from("EMPTY_DIR"),
            ctime_utc: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            mtime_utc: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
        };

        let out_dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mount = FakeMount::all_present();
        let mut controller =
            DumpController::new(&mut device, &mount, key, vec![], vec![dir], reference, cancel);
        controller.run(out_dir.path(), &UnknownVolume, |_, _| {}).unwrap();
        assert!(out_dir.path().join("EMPTY_DIR").is_dir());
    }
}
