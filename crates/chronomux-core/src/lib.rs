//! Core types for the chronomux timer/event multiplexing crates.
//!
//! This crate is deliberately small and dependency-light. It provides:
//!
//! - [`TimePoint`] / [`ClockType`]: absolute timestamps on a selectable
//!   clock (monotonic or wall-clock)
//! - [`TqHandle`] / [`EventKey`]: generation-checked queue handles and
//!   caller-supplied identity keys
//! - [`TimeQueue`]: the handle-indexed deadline-queue contract, and
//!   [`HeapTimeQueue`], its binary-heap implementation
//!
//! The scheduler and the socket event manager live in the `chronomux`
//! crate, which builds on these types.

mod error;
mod handle;
mod queue;
mod time;

pub use error::QueueError;
pub use handle::{EventKey, TqHandle};
pub use queue::{HeapTimeQueue, PopOutcome, TimeQueue, TqItem};
pub use time::{ClockType, TimePoint};
