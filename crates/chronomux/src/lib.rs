//! chronomux: timer event scheduling and socket readiness multiplexing
//!
//! Two independent primitives, designed to be composed by higher-level
//! networking code:
//!
//! - [`TimerEventScheduler`]: one-shot events and recurring clocks,
//!   dispatched in deadline order from a dedicated background thread.
//!   Any number of threads may schedule, reschedule, and cancel
//!   concurrently; cancellation has precise, documented semantics against
//!   in-flight dispatch.
//! - [`SocketEventManager`] / [`EpollEventManager`]: per-socket read and
//!   write readiness callbacks, dispatched synchronously from a
//!   caller-driven `dispatch()` call. No background thread.
//!
//! # Architecture
//!
//! ```text
//!   caller threads                     dispatcher thread
//!   ──────────────                     ─────────────────
//!   schedule_event ──┐                 loop:
//!   start_clock ─────┼─► [ event queue ]   drain due ≤ now
//!   cancel_* ────────┘   [ clock queue ]   merge by deadline
//!          │                  ▲            invoke callbacks (unlocked)
//!          └── condvar signal ┘            re-arm clocks at t + period
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chronomux::{EventKey, TimerEventScheduler};
//! use std::time::Duration;
//!
//! let scheduler = TimerEventScheduler::new();
//! scheduler.start().unwrap();
//!
//! let at = scheduler.now() + Duration::from_millis(100);
//! scheduler
//!     .schedule_event(at, EventKey::NONE, || println!("fired"))
//!     .unwrap();
//!
//! scheduler.stop();
//! ```

mod config;
mod error;
mod event_manager;
mod scheduler;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::{EpollEventManager, EpollStats};
    }
}

pub use config::{DispatcherFn, EventCallback, SchedulerConfig};
pub use error::{CancelError, EventManagerError, ScheduleError, StartError};
pub use event_manager::{InterruptMode, SocketCallback, SocketEvent, SocketEventManager};
pub use scheduler::{ClockHandle, EventHandle, SchedulerStats, TimerEventScheduler};

pub use chronomux_core::{ClockType, EventKey, TimePoint};
