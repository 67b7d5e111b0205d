//! Cooperative cancellation for in-flight crawls
//!
//! A [`CancelToken`] is passed explicitly into every suspending call of the
//! crawl and enrichment path. Workers check it before taking the next unit of
//! work, so a cancel request stops the pipeline within one unit rather than
//! at the next phase boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, SkemaError};

/// Shared cancellation flag, cloned into every task of one crawl.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(SkemaError::Cancelled)` if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SkemaError::Cancelled)
        } else {
            Ok(())
        }
    }
}
