//! Queue error types.

use thiserror::Error;

/// Errors surfaced by [`crate::TimeQueue`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue's handle space is exhausted; no entry was added.
    #[error("time queue is full")]
    Full,

    /// The handle does not name a live entry with the given key: it has
    /// already fired, was removed, or the key does not match.
    #[error("stale handle or key mismatch")]
    Stale,
}
