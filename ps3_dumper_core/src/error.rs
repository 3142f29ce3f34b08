use std::path::PathBuf;

use thiserror::Error;

/// Errors that can abort `detect_disc`, `find_key`, or `dump` outright.
///
/// Per-file failures during a dump are *not* represented here; they are
/// accumulated into [`crate::dump::DumpReport::broken_files`] instead, since
/// a single bad file must never stop the rest of the copy.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no PS3_DISC.SFB found on any mounted drive")]
    DiscNotFound,

    #[error("PS3_GAME/PARAM.SFO missing or unparseable: {0}")]
    InvalidDisc(String),

    #[error("no raw block device matches the mounted disc")]
    NoPhysicalDeviceMatch,

    #[error("no untested keys remain in the key cache")]
    NoKey,

    #[error("no candidate key decrypted the detection probe correctly")]
    NoMatch,

    #[error("none of the known detection-probe files exist with a non-zero length")]
    DetectionFileMissing,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) trait IoContext<T> {
    fn io_ctx(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_ctx(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|source| Error::Io { path: path.to_path_buf(), source })
    }
}
