//! Cooperative cancellation for long scans and builds

use crate::error::{MolvecError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of compared fingerprints between cancellation checks
pub const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Shared cancellation flag with an optional deadline
///
/// Clones share the flag, so cancelling one cancels all.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// Token that only trips when cancelled explicitly
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also trips once `timeout` has elapsed
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Token that trips at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Trip the token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether the token was cancelled or its deadline passed
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// `Err(Cancelled)` once tripped
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(MolvecError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Check an optional token
#[inline]
pub(crate) fn check(cancel: Option<&CancellationToken>, what: &str) -> Result<()> {
    match cancel {
        Some(token) => token.check(what),
        None => Ok(()),
    }
}
