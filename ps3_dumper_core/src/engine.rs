//! Host-facing façade (C0, spec §6): `detect_disc`, `find_key`, and `dump`
//! wrap every component beneath them behind the only surface a consuming
//! application needs, mirroring how `disc_riider::reader::WiiIsoReader`
//! is the single entry point its callers construct.

use std::collections::HashSet;
use std::path::Path;

use crate::cancel::CancellationToken;
use crate::config::DumpConfig;
use crate::device::{build_catalog, IsoCatalogReader, MountedDisc, RawBlockDevice};
use crate::dump::{DumpController, DumpReport, OutputVolume};
use crate::error::{Error, Result};
use crate::identify;
use crate::keys::select::{select_key, KeySelectError, SelectedKey};
use crate::keys::{enumerate_all_providers, KeyIndex};
use crate::model::{DetectionProbe, DiscIdentity, DETECTION_CANDIDATES, SECTOR_SIZE};
use crate::validate::ReferenceHashes;

/// Everything learned once [`DumpEngine::detect_disc`] succeeds.
pub struct DetectedDisc {
    pub identity: DiscIdentity,
    pub mount_index: usize,
    pub device_index: usize,
    pub probe: DetectionProbe,
}

/// Drives the three-stage pipeline spec.md §6 names: identify the disc,
/// select its decryption key, then copy and verify every file. One
/// `DumpEngine` is meant to live for one disc's worth of work; its
/// `KeyIndex` and `tested` set accumulate for that lifetime (spec §3, §8
/// invariant 4).
pub struct DumpEngine {
    config: DumpConfig,
    key_index: KeyIndex,
    tested_keys: HashSet<String>,
    cancel: CancellationToken,
}

impl DumpEngine {
    pub fn new(config: DumpConfig) -> Self {
        DumpEngine { config, key_index: KeyIndex::new(), tested_keys: HashSet::new(), cancel: CancellationToken::new() }
    }

    pub fn config(&self) -> &DumpConfig {
        &self.config
    }

    /// A clone of the running cancellation flag, for a host to hand to a
    /// "cancel" button independent of whatever thread drives `dump`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spec §4.3: locates the mounted disc, parses its manifests, matches
    /// it to a raw device, and builds the detection probe `find_key` needs.
    pub fn detect_disc(
        &self,
        mounts: &[Box<dyn MountedDisc>],
        devices: &mut [Box<dyn RawBlockDevice + Send>],
        input_dir: Option<&Path>,
    ) -> Result<DetectedDisc> {
        let mount_index = identify::locate_mounted_disc(mounts, input_dir)?;
        let mount = mounts[mount_index].as_ref();
        let identity = identify::identify_from_mount(mount)?;
        let device_index = identify::match_physical_device(mount, devices)?;
        let probe = build_detection_probe(mount, devices[device_index].as_mut())?;
        Ok(DetectedDisc { identity, mount_index, device_index, probe })
    }

    /// Spec §4.1/§4.4: scans the key cache on the first call and selects a
    /// key by decrypting the probe sector against every untested key.
    pub fn find_key(
        &mut self,
        detected: &DetectedDisc,
        probe_ciphertext: &[u8; SECTOR_SIZE],
    ) -> Result<SelectedKey> {
        if self.key_index.is_empty() {
            enumerate_all_providers(
                &self.key_index,
                &self.config.key_cache_dir,
                &detected.identity.product_code,
                &self.cancel,
            );
        }
        select_key(
            &self.key_index,
            &detected.probe,
            probe_ciphertext,
            &mut self.tested_keys,
            &detected.identity.product_code,
            &self.cancel,
        )
        .map_err(|err| match err {
            KeySelectError::NoKey => Error::NoKey,
            KeySelectError::NoMatch => Error::NoMatch,
        })
    }

    /// Spec §4.6/§4.7: builds the authoritative file/directory catalog from
    /// `iso_reader` over `device` (spec §4.6 step 1), then copies every
    /// cataloged file that is present on `mount` into the rendered output
    /// directory, verifying against whatever reference hashes the selected
    /// key's carrier record supplies, and restores timestamps on both files
    /// and directories.
    pub fn dump(
        &self,
        mount: &dyn MountedDisc,
        device: &mut dyn RawBlockDevice,
        iso_reader: &dyn IsoCatalogReader,
        identity: &DiscIdentity,
        selected: &SelectedKey,
        output_dir_name: &str,
        volume: &dyn OutputVolume,
        progress: impl FnMut(usize, usize),
    ) -> Result<DumpReport> {
        let (files, dirs) = build_catalog(iso_reader, device)
            .map_err(|source| Error::Io { path: device.device_path().to_path_buf(), source })?;
        let reference =
            ReferenceHashes::from_key_records(std::slice::from_ref(&selected.carrier), &identity.disc_version);

        let output_path = self.config.output_path_for(output_dir_name);
        let mut controller =
            DumpController::new(device, mount, selected.key, files, dirs, reference, self.cancel.clone())
                .with_chunk_size(self.config.chunk_size);
        controller
            .run(&output_path, volume, progress)
            .map_err(|source| Error::Io { path: output_path, source })
    }
}

/// Finds the first [`DETECTION_CANDIDATES`] entry present with non-zero
/// length on the mount, then resolves it to sectors on the matched raw
/// device to build a [`DetectionProbe`] (spec §4.3 step 6, §4.4).
fn build_detection_probe(
    mount: &dyn MountedDisc,
    device: &mut dyn RawBlockDevice,
) -> Result<DetectionProbe> {
    for (disc_path, expected_prefix) in DETECTION_CANDIDATES {
        let relative = disc_path.trim_start_matches('\\').replace('\\', "/");
        let relative_path = Path::new(&relative);
        if !mount.file_exists(relative_path) {
            continue;
        }
        let Ok(bytes) = mount.read_file(relative_path) else { continue };
        if bytes.is_empty() {
            continue;
        }
        let Ok(Some((start_sector, _length))) = device.path_to_sector_range(disc_path) else {
            continue;
        };
        let sector_iv = device.get_sector_iv(start_sector);
        return Ok(DetectionProbe { sector_number: start_sector, expected_prefix: expected_prefix.to_vec(), sector_iv });
    }
    Err(Error::DetectionFileMissing)
}
