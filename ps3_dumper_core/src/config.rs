//! Engine-wide tunables (spec §6 host-boundary configuration).

use std::path::PathBuf;

use crate::dump::DEFAULT_CHUNK_SIZE;

/// Settings a host application supplies when constructing a
/// [`crate::engine::DumpEngine`]. Every field has a default that matches
/// the behavior spec.md describes when left unconfigured.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Directory scanned by the key providers for `.ird`/`.dkey`/`.key`
    /// files (spec §4.1).
    pub key_cache_dir: PathBuf,
    /// Base directory under which the rendered output directory name is
    /// created (spec §4.3, §4.6).
    pub output_base_dir: PathBuf,
    /// Template passed to [`crate::identify::render_output_dir_name`].
    pub output_dir_template: String,
    /// Bytes copied per `read`/`write` call during a file copy (spec §4.6,
    /// §5). Larger chunks reduce syscall overhead; smaller chunks give
    /// finer-grained progress and cancellation response.
    pub chunk_size: usize,
}

impl DumpConfig {
    pub fn new(key_cache_dir: impl Into<PathBuf>, output_base_dir: impl Into<PathBuf>) -> Self {
        DumpConfig {
            key_cache_dir: key_cache_dir.into(),
            output_base_dir: output_base_dir.into(),
            output_dir_template: crate::identify::default_output_template().to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_output_dir_template(mut self, template: impl Into<String>) -> Self {
        self.output_dir_template = template.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn output_path_for(&self, rendered_name: &str) -> PathBuf {
        self.output_base_dir.join(rendered_name)
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        let key_cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ps3-dumper")
            .join("keys");
        DumpConfig::new(key_cache_dir, PathBuf::from("."))
    }
}
