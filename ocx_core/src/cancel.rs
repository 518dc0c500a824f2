//! Cooperative cancellation flag.
//!
//! Checked at Riccati node boundaries and rollout event stops; a cancelled
//! solve returns best-so-far and leaves any committed policy untouched.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable cancellation handle shared between the solver and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Re-arm the token for a new solve.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}
