//! Structured error taxonomy for the upcall cache.
//!
//! Mirrors the error kinds of the reference implementation's negative
//! `errno` returns (`-ENOMEM`, `-EINTR`, `-ETIMEDOUT`, `-EREMCHG`,
//! `-EINVAL`, `-EIDRM`) as a proper Rust enum instead of integer codes.

use thiserror::Error;

/// Failure modes surfaced by [`crate::Cache`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Allocation failed while creating a new entry.
    #[error("out of memory allocating cache entry")]
    OutOfMemory,

    /// The calling thread was interrupted while waiting for an in-flight
    /// acquisition to complete.
    #[error("interrupted while waiting for acquisition to complete")]
    Interrupted,

    /// `acquire_expire` elapsed while the entry was still `ACQUIRING`.
    #[error("timed out waiting for upcall to complete")]
    TimedOut,

    /// The upcall resolver reported that the key no longer exists
    /// upstream. Never retried.
    #[error("key no longer exists upstream")]
    RemovedUpstream,

    /// A downcall arrived for an entry that was not `ACQUIRING`, or
    /// `parse_downcall` reported stale data.
    #[error("entry is not in a valid state for this operation")]
    InvalidState,

    /// A downcall arrived for a key with no matching entry.
    #[error("no matching entry found for downcall")]
    NotFound,

    /// `do_upcall` or `parse_downcall` reported a hook-level failure.
    #[error("upcall failed with code {0}")]
    UpcallError(i32),
}

impl CacheError {
    /// Whether this error can be transparently retried once by
    /// `get_entry` when the cache is configured with `acquire_replay`.
    pub(crate) fn is_replayable(&self) -> bool {
        matches!(self, CacheError::Interrupted | CacheError::TimedOut)
    }
}
