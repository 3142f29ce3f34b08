//! Disc identification (C3, spec §4.3): manifest parsing, mount/device
//! matching, and output-directory naming.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::device::{MountedDisc, RawBlockDevice};
use crate::error::{Error, Result};
use crate::model::{region_for_product_code, DiscIdentity};

const SFB_RELATIVE_PATH: &str = "PS3_DISC.SFB";
const PARAM_SFO_RELATIVE_PATH: &str = "PS3_GAME/PARAM.SFO";

/// Parses the key/value manifest format both `PS3_DISC.SFB` and the
/// `PARAM.SFO` stand-in use here: one `KEY = VALUE` pair per line,
/// comments (`#`) and blank lines ignored. The real PARAM.SFO is a typed
/// binary key/value table (spec §6); that parser is external to this
/// crate's scope, so the engine only requires this minimal textual
/// contract from whatever reader feeds it.
pub fn parse_manifest(bytes: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(bytes);
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// Strips spaces/NULs and collapses a possibly multi-line `TITLE` to a
/// single space-separated line (spec §6).
fn clean_sfo_string(raw: &str) -> String {
    let collapsed = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(" ");
    collapsed.replace('\0', "").trim().to_string()
}

/// Normalizes an over-long `TITLE_ID` to its first 4 and last 5 characters
/// (spec §4.3 step 2).
fn normalize_title_id(title_id: &str) -> String {
    if title_id.len() > 9 {
        let chars: Vec<char> = title_id.chars().collect();
        let prefix: String = chars.iter().take(4).collect();
        let suffix: String = chars.iter().rev().take(5).rev().collect();
        format!("{prefix}{suffix}")
    } else {
        title_id.to_string()
    }
}

/// Locates the mount (by index) holding `PS3_DISC.SFB`, or the
/// caller-supplied directory if `input_dir` is given (spec §4.3 step 1).
pub fn locate_mounted_disc(
    mounts: &[Box<dyn MountedDisc>],
    input_dir: Option<&Path>,
) -> Result<usize> {
    if let Some(dir) = input_dir {
        return mounts
            .iter()
            .position(|m| m.root() == dir)
            .ok_or(Error::DiscNotFound);
    }
    mounts
        .iter()
        .position(|m| m.file_exists(Path::new(SFB_RELATIVE_PATH)))
        .ok_or(Error::DiscNotFound)
}

/// Parses both manifests from a mounted disc and builds the
/// [`DiscIdentity`] per spec §4.3 steps 2-3.
pub fn identify_from_mount(mount: &dyn MountedDisc) -> Result<DiscIdentity> {
    let sfb_bytes = mount
        .read_file(Path::new(SFB_RELATIVE_PATH))
        .map_err(|source| Error::Io { path: mount.root().join(SFB_RELATIVE_PATH), source })?;
    let sfb = parse_manifest(&sfb_bytes);

    let hybrid_flag = sfb.get("HYBRID_FLAG").cloned().unwrap_or_default();
    if !hybrid_flag.contains('g') {
        log::warn!("PS3_DISC.SFB HYBRID_FLAG {hybrid_flag:?} does not contain 'g' (game disc)");
    }
    let sfb_title_id = sfb
        .get("TITLE_ID")
        .map(|s| normalize_title_id(s))
        .ok_or_else(|| Error::InvalidDisc("PS3_DISC.SFB missing TITLE_ID".to_string()))?;

    let sfo_bytes = mount.read_file(Path::new(PARAM_SFO_RELATIVE_PATH)).map_err(|source| {
        Error::Io { path: mount.root().join(PARAM_SFO_RELATIVE_PATH), source }
    })?;
    let sfo = parse_manifest(&sfo_bytes);

    let title = sfo
        .get("TITLE")
        .map(|s| clean_sfo_string(s))
        .ok_or_else(|| Error::InvalidDisc("PARAM.SFO missing TITLE".to_string()))?;
    let product_code = sfo
        .get("TITLE_ID")
        .map(|s| clean_sfo_string(s))
        .ok_or_else(|| Error::InvalidDisc("PARAM.SFO missing TITLE_ID".to_string()))?;
    let disc_version = sfo.get("VERSION").map(|s| clean_sfo_string(s)).unwrap_or_default();
    let app_version = sfo.get("APP_VER").map(|s| clean_sfo_string(s)).unwrap_or_default();

    if product_code != sfb_title_id {
        log::warn!(
            "PARAM.SFO TITLE_ID {product_code:?} does not match PS3_DISC.SFB TITLE_ID {sfb_title_id:?}; proceeding with PARAM.SFO value"
        );
    }

    let region_code = region_for_product_code(&product_code).to_string();
    Ok(DiscIdentity { title, product_code, disc_version, app_version, region_code })
}

/// Matches the mounted disc to its raw block device by comparing
/// `PS3_DISC.SFB` bytes read via the mount against bytes read from each
/// candidate raw device (spec §4.3 step 5). Returns the matching device's
/// index.
pub fn match_physical_device(
    mount: &dyn MountedDisc,
    devices: &mut [Box<dyn RawBlockDevice + Send>],
) -> Result<usize> {
    let mounted_sfb = mount
        .read_file(Path::new(SFB_RELATIVE_PATH))
        .map_err(|source| Error::Io { path: mount.root().join(SFB_RELATIVE_PATH), source })?;

    for (index, device) in devices.iter_mut().enumerate() {
        let Ok(Some((start_sector, length))) = device.path_to_sector_range(SFB_RELATIVE_PATH)
        else {
            continue;
        };
        let Ok(device_bytes) = read_exact_from_device(device.as_mut(), start_sector, length)
        else {
            continue;
        };
        if device_bytes == mounted_sfb {
            return Ok(index);
        }
    }
    Err(Error::NoPhysicalDeviceMatch)
}

fn read_exact_from_device(
    device: &mut dyn RawBlockDevice,
    start_sector: u64,
    length: u64,
) -> std::io::Result<Vec<u8>> {
    let sector_size = device.sector_size() as u64;
    let sector_count = length.div_ceil(sector_size);
    let mut out = Vec::with_capacity(length as usize);
    for offset in 0..sector_count {
        let sector = device.read_sector(start_sector + offset)?;
        out.extend_from_slice(&sector);
    }
    out.truncate(length as usize);
    Ok(out)
}

/// Renders the output directory name from the configured template
/// (spec §4.3): substitutes `{product_code}`, `{product_code_letters}`,
/// `{product_code_numbers}`, `{title}`, `{region}`, strips any character
/// forbidden in host paths, and right-trims each path segment of `.`.
///
/// If sanitization leaves an empty final segment, falls back to
/// `unknown-<product_code>` (spec §9 design note, open question a).
pub fn render_output_dir_name(template: &str, identity: &DiscIdentity) -> String {
    let rendered = template
        .replace("{product_code_letters}", identity.product_code_letters())
        .replace("{product_code_numbers}", identity.product_code_numbers())
        .replace("{product_code}", &identity.product_code)
        .replace("{title}", &identity.title)
        .replace("{region}", &identity.region_code);

    let sanitized: String = rendered
        .split(['/', '\\'])
        .map(sanitize_segment)
        .collect::<Vec<_>>()
        .join("_");

    if sanitized.trim_matches('_').is_empty() {
        format!("unknown-{}", identity.product_code)
    } else {
        sanitized
    }
}

const FORBIDDEN_PATH_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn sanitize_segment(segment: &str) -> String {
    let stripped: String = segment.chars().filter(|c| !FORBIDDEN_PATH_CHARS.contains(c)).collect();
    stripped.trim_end_matches('.').to_string()
}

pub fn default_output_template() -> &'static str {
    "{product_code} - {title} [{region}]"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(product_code: &str, title: &str, region: &str) -> DiscIdentity {
        DiscIdentity {
            title: title.to_string(),
            product_code: product_code.to_string(),
            disc_version: "01.00".to_string(),
            app_version: "01.00".to_string(),
            region_code: region.to_string(),
        }
    }

    #[test]
    fn parses_key_value_manifest() {
        let text = b"HYBRID_FLAG = g\nTITLE_ID=BLES01234\n# comment\n\n";
        let map = parse_manifest(text);
        assert_eq!(map.get("HYBRID_FLAG").unwrap(), "g");
        assert_eq!(map.get("TITLE_ID").unwrap(), "BLES01234");
    }

    #[test]
    fn normalizes_overlong_title_id() {
        assert_eq!(normalize_title_id("BLESXX01234YY"), "BLES01234");
        assert_eq!(normalize_title_id("BLES01234"), "BLES01234");
    }

    #[test]
    fn collapses_multiline_title_and_strips_nuls() {
        assert_eq!(clean_sfo_string("Example\nGame\0\0"), "Example Game");
    }

    #[test]
    fn renders_default_template() {
        let id = identity("BLES01234", "Example Game", "EU");
        let name = render_output_dir_name(default_output_template(), &id);
        assert_eq!(name, "BLES01234 - Example Game [EU]");
    }

    #[test]
    fn strips_forbidden_characters_and_trailing_dots() {
        let id = identity("BLES01234", "Bad: Title? / Name.", "EU");
        let name = render_output_dir_name("{title}", &id);
        assert!(!name.contains(':'));
        assert!(!name.contains('?'));
        assert!(!name.ends_with('.'));
    }

    #[test]
    fn empty_rendered_name_falls_back_to_sentinel() {
        let id = identity("BLES01234", "???", "");
        let name = render_output_dir_name("{title}", &id);
        assert_eq!(name, "unknown-BLES01234");
    }
}
