//! Capability context threaded through engine operations.
//!
//! The engine has no native timeouts; callers cancel long-running work
//! cooperatively by flagging the context. Builders and readers call
//! [`Cx::checkpoint`] between I/O steps and surface
//! `RevfsError::Interrupted` when the flag is set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use revfs_error::{Result, RevfsError};

/// Shared cancellation context.
///
/// Cloning is cheap and all clones observe the same interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    interrupted: Arc<AtomicBool>,
}

impl Cx {
    /// Create a fresh, non-interrupted context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative cancellation of every operation holding a clone
    /// of this context.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[inline]
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Fail with `Interrupted` if cancellation has been requested.
    #[inline]
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(RevfsError::Interrupted)
        } else {
            Ok(())
        }
    }
}
