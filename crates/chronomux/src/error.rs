//! Scheduler and event-manager error types.
//!
//! Everything recoverable is a `Result`; the only panicking paths in the
//! crate are documented precondition violations (stopping the scheduler
//! from its own dispatcher thread, starting a clock with a zero period).

use thiserror::Error;

/// A new event or clock could not be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The underlying queue's handle space is exhausted. Nothing was
    /// scheduled; the call is safe to retry after entries drain.
    #[error("scheduler handle space exhausted")]
    Exhausted,
}

/// A cancel or reschedule did not find its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    /// The handle/key pair names nothing pending: the item already fired,
    /// was already cancelled, the key mismatched, or, for a concurrent
    /// cancel, the item was mid-dispatch and suppression could not be
    /// confirmed. With `wait = true` the dispatcher has completed a full
    /// pass by the time this is returned, so "may still fire" has
    /// resolved to "has fired or never will".
    #[error("no pending item for this handle and key")]
    NotFound,
}

/// The dispatcher thread could not be started.
#[derive(Debug, Error)]
pub enum StartError {
    /// OS thread creation failed. The scheduler remains stopped and
    /// `start()` may be retried.
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors from the socket event manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventManagerError {
    /// The wait was interrupted by a signal and the caller asked for
    /// interruptions to be reported rather than restarted.
    #[error("dispatch interrupted by signal")]
    Interrupted,

    /// An OS call failed.
    #[error("OS error: errno {0}")]
    Os(i32),
}
