use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single cooperative cancellation flag threaded through the key selector,
/// the decryption stream's copy loop, and the per-file dump loop.
///
/// Observing a cancellation must short-circuit work in progress without
/// marking `validation_status` as `Failed` (spec §4.6, §5, §8 invariant 8).
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
