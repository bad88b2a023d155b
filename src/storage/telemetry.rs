//! Error tracking for read paths that degrade instead of failing.

use tracing::error;

use crate::error::StorageError;

/// Receives failures that were swallowed to keep a read surface available.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorTracker: Send + Sync {
    fn track(&self, error: &StorageError);
}

/// Default tracker: one structured `error!` event per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorTracker;

impl ErrorTracker for TracingErrorTracker {
    fn track(&self, err: &StorageError) {
        error!(
            code = err.code(),
            category = %err.category(),
            details = ?err.details(),
            error = %err,
            "Storage read degraded"
        );
    }
}
