//! Cooperative stop flag shared between a running session and its callers

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Cloneable stop flag
///
/// Setting it never interrupts native work directly; the engine sees it
/// at its next poll checkpoint. Clones share one flag, so a token handed
/// to another thread stops the session that created it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}
