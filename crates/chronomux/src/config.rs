//! Scheduler configuration
//!
//! Plain value struct with `Default` and chainable setters. Everything
//! the scheduler depends on is explicit here; there is no process-wide
//! default dispatcher or clock.

use std::sync::Arc;

use chronomux_core::ClockType;

/// A scheduled callback. Shared between the queue, the clock registry,
/// and the dispatcher's in-flight buffers, hence `Arc`.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Wraps every callback invocation on the dispatcher thread.
///
/// The default simply invokes the callback. Overriding lets callers
/// interpose on every dispatch: timing instrumentation, or handing the
/// callback off to a thread pool, and so on.
pub type DispatcherFn = Arc<dyn Fn(&EventCallback) + Send + Sync>;

/// Configuration for a [`crate::TimerEventScheduler`].
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Which clock deadlines are measured on.
    /// Default: [`ClockType::Monotonic`].
    pub clock_type: ClockType,

    /// Invocation wrapper; `None` means "call the callback directly".
    pub dispatcher: Option<DispatcherFn>,

    /// Initial storage sizing for the event handle space.
    /// Default: 64.
    pub event_capacity: usize,

    /// Initial storage sizing for the clock handle space.
    /// Default: 16.
    pub clock_capacity: usize,

    /// Hard cap on concurrently scheduled events (None = unbounded).
    pub max_events: Option<usize>,

    /// Hard cap on concurrently registered clocks (None = unbounded).
    pub max_clocks: Option<usize>,

    /// Dispatcher thread name.
    /// Default: "chronomux-dispatch".
    pub thread_name: String,

    /// Stack size for the dispatcher thread (None = system default).
    pub stack_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            clock_type: ClockType::Monotonic,
            dispatcher: None,
            event_capacity: 64,
            clock_capacity: 16,
            max_events: None,
            max_clocks: None,
            thread_name: "chronomux-dispatch".into(),
            stack_size: None,
        }
    }
}

impl SchedulerConfig {
    pub fn clock_type(mut self, clock_type: ClockType) -> Self {
        self.clock_type = clock_type;
        self
    }

    /// Install an invocation wrapper around every dispatched callback.
    pub fn dispatcher(mut self, dispatcher: DispatcherFn) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn clock_capacity(mut self, capacity: usize) -> Self {
        self.clock_capacity = capacity;
        self
    }

    pub fn max_events(mut self, limit: usize) -> Self {
        self.max_events = Some(limit);
        self
    }

    pub fn max_clocks(mut self, limit: usize) -> Self {
        self.max_clocks = Some(limit);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("clock_type", &self.clock_type)
            .field("dispatcher", &self.dispatcher.as_ref().map(|_| "<custom>"))
            .field("event_capacity", &self.event_capacity)
            .field("clock_capacity", &self.clock_capacity)
            .field("max_events", &self.max_events)
            .field("max_clocks", &self.max_clocks)
            .field("thread_name", &self.thread_name)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}
