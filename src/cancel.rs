//! Cooperative cancellation.
//!
//! Long operations (generation, download, model load) poll a shared token
//! at their suspension points and wind down cleanly when it trips.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Every clone observes the cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`crate::error::EngineError::Cancelled`] if tripped.
    pub fn check(&self) -> crate::error::EngineResult<()> {
        if self.is_cancelled() {
            Err(crate::error::EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
