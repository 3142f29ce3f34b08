//! Engine for identifying, key-selecting, decrypting, and verifying a
//! PlayStation 3 Blu-ray disc dump. Host applications (a GUI, a CLI) drive
//! this crate through [`engine::DumpEngine`]; every other module is an
//! internal component it composes.

pub mod cancel;
pub mod config;
pub mod crypto;
pub mod device;
pub mod dump;
pub mod engine;
pub mod error;
pub mod identify;
pub mod keys;
pub mod model;
pub mod platform;
pub mod stream;
pub mod validate;

pub use config::DumpConfig;
pub use engine::{DetectedDisc, DumpEngine};
pub use error::{Error, Result};
