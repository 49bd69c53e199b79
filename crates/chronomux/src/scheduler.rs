//! Timer event scheduler
//!
//! [`TimerEventScheduler`] dispatches one-shot events and recurring clocks
//! from a single dedicated background thread. Producers on any thread
//! schedule and cancel through the public API; the dispatcher drains due
//! entries from two deadline queues, merges them in ascending deadline
//! order, and invokes callbacks with no lock held.
//!
//! # Locking
//!
//! One mutex guards both queues, the clock registry, and the pass
//! counter. It is never held across a callback invocation; callbacks may
//! re-enter the scheduler. That creates an inherent window where an item
//! has been drained from its queue but not yet invoked; cancellation is
//! tiered around that window:
//!
//! 1. Removal straight from the queue; the callback will never run.
//! 2. If cancelling from the dispatcher thread itself (i.e. from inside
//!    another callback), suppress the item in the drained-but-not-yet-
//!    invoked buffer.
//! 3. Otherwise the item may be mid-invocation; the caller can at most
//!    wait for the current dispatch pass to complete
//!    ([`TimerEventScheduler::yield_to_dispatcher`]).
//!
//! Recurring clocks carry their own `cancelled` flag, checked immediately
//! before invocation and again before re-arm, so a cancel that loses the
//! queue-removal race still suppresses future firings.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use chronomux_core::{
    ClockType, EventKey, HeapTimeQueue, TimePoint, TimeQueue, TqHandle, TqItem,
};
use tracing::{debug, error, warn};

use crate::config::{DispatcherFn, EventCallback, SchedulerConfig};
use crate::error::{CancelError, ScheduleError, StartError};

/// Per-pass drain bound for each queue. Keeps lock-held time bounded and
/// prevents one queue from starving the other; anything left over is
/// picked up by the next pass.
const MAX_PENDING_PER_QUEUE: usize = 64;

/// Handle to a scheduled one-shot event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(TqHandle);

impl EventHandle {
    /// Raw handle value (for debugging/logging).
    pub fn raw(self) -> u64 {
        self.0.raw()
    }
}

/// Handle to a registered recurring clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockHandle(u64);

impl ClockHandle {
    /// Raw handle value (for debugging/logging).
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Counters from dispatcher execution (lifetime totals).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Dispatch passes completed (including empty ones).
    pub passes: u64,
    /// One-shot event callbacks invoked.
    pub events_fired: u64,
    /// Recurring clock callbacks invoked.
    pub clocks_fired: u64,
    /// Callbacks that panicked (caught; the dispatcher survives).
    pub callback_panics: u64,
}

/// One recurring clock. Shared between the registry and the dispatcher's
/// in-flight buffer, so a cancel is visible to a firing already drained
/// from the queue.
struct ClockData {
    callback: EventCallback,
    period: Duration,
    /// Authoritative cancellation gate. Written under the scheduler
    /// mutex; read lock-free right before invocation (a stale read there
    /// costs at most one extra firing, which the re-arm check under the
    /// mutex then stops).
    cancelled: AtomicBool,
    /// Raw [`TqHandle`] of this clock's next firing. Written only while
    /// the scheduler mutex is held.
    queue_handle: AtomicU64,
}

/// One drained-but-not-yet-invoked event, published so a cancel arriving
/// from inside a callback (same thread) can still suppress it.
struct PendingEvent {
    handle: TqHandle,
    key: EventKey,
    time: TimePoint,
    callback: EventCallback,
    skipped: AtomicBool,
}

struct Inner {
    events: HeapTimeQueue<EventCallback>,
    clocks: HeapTimeQueue<Arc<ClockData>>,
    registry: HashMap<ClockHandle, Arc<ClockData>>,
    next_clock_handle: u64,
    running: bool,
    dispatcher_thread: Option<ThreadId>,
    /// Completed dispatch passes; the wait target of
    /// [`TimerEventScheduler::yield_to_dispatcher`].
    passes_completed: u64,
    /// Events drained in the pass currently executing.
    pending_events: Vec<Arc<PendingEvent>>,
}

struct StatCounters {
    passes: AtomicU64,
    events_fired: AtomicU64,
    clocks_fired: AtomicU64,
    callback_panics: AtomicU64,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Wakes the dispatcher: new earliest deadline, or shutdown.
    work_cv: Condvar,
    /// Broadcast at the end of every dispatch pass.
    pass_cv: Condvar,
    clock_type: ClockType,
    dispatcher: DispatcherFn,
    /// Index into `pending_events` of the event currently being invoked
    /// (`usize::MAX` when none). Only the dispatcher thread writes or
    /// acts on it.
    pending_pos: AtomicUsize,
    num_events: AtomicUsize,
    num_clocks: AtomicUsize,
    stats: StatCounters,
}

/// Event-driven timer and clock dispatch engine.
///
/// See the [module docs](self) for the dispatch and cancellation model.
/// `stop()` (and therefore `Drop`) must not run on the dispatcher thread
/// itself; that is asserted, since it would self-deadlock on the join.
pub struct TimerEventScheduler {
    shared: Arc<Shared>,
    /// Guards start/stop transitions and owns the dispatcher join handle.
    join: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
    stack_size: Option<usize>,
}

impl TimerEventScheduler {
    /// Create a stopped scheduler with default configuration.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a stopped scheduler measuring deadlines on `clock_type`.
    pub fn with_clock_type(clock_type: ClockType) -> Self {
        Self::with_config(SchedulerConfig::default().clock_type(clock_type))
    }

    /// Create a stopped scheduler from an explicit configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        let events = match config.max_events {
            Some(limit) => HeapTimeQueue::with_capacity_limit(limit),
            None => HeapTimeQueue::with_capacity_hint(config.event_capacity),
        };
        let clocks = match config.max_clocks {
            Some(limit) => HeapTimeQueue::with_capacity_limit(limit),
            None => HeapTimeQueue::with_capacity_hint(config.clock_capacity),
        };
        let dispatcher = config
            .dispatcher
            .unwrap_or_else(|| Arc::new(|callback: &EventCallback| callback()));

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    events,
                    clocks,
                    registry: HashMap::new(),
                    next_clock_handle: 1,
                    running: false,
                    dispatcher_thread: None,
                    passes_completed: 0,
                    pending_events: Vec::new(),
                }),
                work_cv: Condvar::new(),
                pass_cv: Condvar::new(),
                clock_type: config.clock_type,
                dispatcher,
                pending_pos: AtomicUsize::new(usize::MAX),
                num_events: AtomicUsize::new(0),
                num_clocks: AtomicUsize::new(0),
                stats: StatCounters {
                    passes: AtomicU64::new(0),
                    events_fired: AtomicU64::new(0),
                    clocks_fired: AtomicU64::new(0),
                    callback_panics: AtomicU64::new(0),
                },
            }),
            join: Mutex::new(None),
            thread_name: config.thread_name,
            stack_size: config.stack_size,
        }
    }

    /// Current time on this scheduler's clock.
    pub fn now(&self) -> TimePoint {
        self.shared.clock_type.now()
    }

    /// The clock deadlines are measured on.
    pub fn clock_type(&self) -> ClockType {
        self.shared.clock_type
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the dispatcher thread with the thread attributes from the
    /// construction-time config. Idempotent: a no-op success if the
    /// scheduler is already running. On spawn failure the scheduler
    /// remains stopped and `start()` may be retried.
    pub fn start(&self) -> Result<(), StartError> {
        self.spawn_dispatcher(self.thread_name.clone(), self.stack_size)
    }

    /// Like [`start`](Self::start), but with explicit thread attributes
    /// for this spawn, overriding the configured name and stack size.
    /// A no-op success if the scheduler is already running (the running
    /// dispatcher keeps its attributes).
    pub fn start_with(
        &self,
        thread_name: impl Into<String>,
        stack_size: Option<usize>,
    ) -> Result<(), StartError> {
        self.spawn_dispatcher(thread_name.into(), stack_size)
    }

    fn spawn_dispatcher(
        &self,
        thread_name: String,
        stack_size: Option<usize>,
    ) -> Result<(), StartError> {
        let mut join = self.join.lock().unwrap();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.running {
                return Ok(());
            }
            inner.running = true;
        }

        let mut builder = thread::Builder::new().name(thread_name.clone());
        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = self.shared.clone();
        match builder.spawn(move || dispatcher_loop(&shared)) {
            Ok(handle) => {
                debug!(thread = %thread_name, "dispatcher started");
                *join = Some(handle);
                Ok(())
            }
            Err(e) => {
                // Roll back and wake anything that raced into a wait
                // while `running` was briefly true.
                self.shared.inner.lock().unwrap().running = false;
                self.shared.work_cv.notify_all();
                self.shared.pass_cv.notify_all();
                Err(StartError::Spawn(e))
            }
        }
    }

    /// Stop the dispatcher thread and block until it has fully exited.
    /// Idempotent. Pending events and clocks stay registered; a later
    /// `start()` resumes dispatching them.
    ///
    /// # Panics
    ///
    /// If called from the dispatcher thread itself (i.e. from inside a
    /// callback); that would self-deadlock on the join.
    pub fn stop(&self) {
        let mut join = self.join.lock().unwrap();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.running {
                assert_ne!(
                    inner.dispatcher_thread,
                    Some(thread::current().id()),
                    "stop() must not be called from the dispatcher thread"
                );
                inner.running = false;
                self.shared.work_cv.notify_all();
                self.shared.pass_cv.notify_all();
            }
        }
        if let Some(handle) = join.take() {
            let _ = handle.join();
            debug!("dispatcher stopped");
        }
    }

    /// True while the dispatcher thread is running.
    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().unwrap().running
    }

    // ========================================================================
    // One-shot events
    // ========================================================================

    /// Schedule `callback` to run once at absolute time `at`. A time in
    /// the past fires on the next dispatch pass.
    ///
    /// `key` is an opaque token stored with the event; cancel and
    /// reschedule must present the same key, which guards against a
    /// recycled handle being mistaken for a different logical event.
    pub fn schedule_event<F>(
        &self,
        at: TimePoint,
        key: EventKey,
        callback: F,
    ) -> Result<EventHandle, ScheduleError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let mut inner = self.shared.inner.lock().unwrap();
        let earliest = inner.events.next_deadline();
        let handle = inner
            .events
            .add(at, key, callback)
            .map_err(|_| ScheduleError::Exhausted)?;
        self.shared.num_events.fetch_add(1, Ordering::Relaxed);
        // Only a new earliest deadline changes the dispatcher's wait.
        if earliest.map_or(true, |d| at < d) {
            self.shared.work_cv.notify_all();
        }
        Ok(EventHandle(handle))
    }

    /// Move a pending event to `new_time`. Fails if the event is no
    /// longer in the queue (already fired, cancelled, mid-dispatch) or
    /// the key mismatches. With `wait = true` a failure additionally
    /// blocks for one dispatch pass, after which the old-time callback
    /// has either run or never will.
    pub fn reschedule_event(
        &self,
        handle: EventHandle,
        key: EventKey,
        new_time: TimePoint,
        wait: bool,
    ) -> Result<(), CancelError> {
        let updated = {
            let mut inner = self.shared.inner.lock().unwrap();
            let updated = inner.events.update(handle.0, key, new_time).is_ok();
            if updated {
                self.shared.work_cv.notify_all();
            }
            updated
        };
        if updated {
            return Ok(());
        }
        if wait {
            self.yield_to_dispatcher();
        }
        Err(CancelError::NotFound)
    }

    /// Cancel a pending event. `Ok` guarantees the callback will never
    /// run. See the [module docs](self) for the tiered semantics when the
    /// event is already mid-dispatch; `wait = true` bounds that ambiguity
    /// by one dispatch pass.
    pub fn cancel_event(
        &self,
        handle: EventHandle,
        key: EventKey,
        wait: bool,
    ) -> Result<(), CancelError> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            // Tier 1: still in the queue.
            if inner.events.remove(handle.0, key).is_ok() {
                self.shared.num_events.fetch_sub(1, Ordering::Relaxed);
                return Ok(());
            }
            // Tier 2: we ARE the dispatcher thread (cancel from inside a
            // callback); suppress the item if it is drained but not yet
            // invoked. Entries at or before `pending_pos` have started.
            if inner.dispatcher_thread == Some(thread::current().id()) {
                let start = self.shared.pending_pos.load(Ordering::Relaxed).wrapping_add(1);
                for pending in inner.pending_events.iter().skip(start) {
                    if pending.handle == handle.0
                        && pending.key == key
                        && !pending.skipped.swap(true, Ordering::Relaxed)
                    {
                        self.shared.num_events.fetch_sub(1, Ordering::Relaxed);
                        return Ok(());
                    }
                }
                return Err(CancelError::NotFound);
            }
        }
        // Tier 3: possibly mid-invocation on the dispatcher thread.
        if wait {
            self.yield_to_dispatcher();
        }
        Err(CancelError::NotFound)
    }

    /// Cancel every pending event. Events still in the queue are
    /// guaranteed never to fire. With `wait = true`, additionally blocks
    /// one dispatch pass so items that were already mid-flight have
    /// resolved by the time this returns.
    pub fn cancel_all_events(&self, wait: bool) {
        let from_dispatcher = {
            let mut inner = self.shared.inner.lock().unwrap();
            let mut drained = Vec::new();
            let removed = inner.events.remove_all(&mut drained);
            if removed > 0 {
                self.shared.num_events.fetch_sub(removed, Ordering::Relaxed);
            }
            let from_dispatcher = inner.dispatcher_thread == Some(thread::current().id());
            if from_dispatcher {
                // Same-thread: also suppress drained-but-not-invoked items.
                let start = self.shared.pending_pos.load(Ordering::Relaxed).wrapping_add(1);
                for pending in inner.pending_events.iter().skip(start) {
                    if !pending.skipped.swap(true, Ordering::Relaxed) {
                        self.shared.num_events.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
            from_dispatcher
        };
        if wait && !from_dispatcher {
            self.yield_to_dispatcher();
        }
    }

    // ========================================================================
    // Recurring clocks
    // ========================================================================

    /// Register a clock firing every `period`, first at `now + period`.
    ///
    /// # Panics
    ///
    /// If `period` is zero (contract violation).
    pub fn start_clock<F>(&self, period: Duration, callback: F) -> Result<ClockHandle, ScheduleError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let first = self.now() + period;
        self.start_clock_at(period, first, callback)
    }

    /// Register a clock firing every `period`, first at absolute time
    /// `first`. A first time in the past fires on the next dispatch pass.
    ///
    /// # Panics
    ///
    /// If `period` is zero (contract violation).
    pub fn start_clock_at<F>(
        &self,
        period: Duration,
        first: TimePoint,
        callback: F,
    ) -> Result<ClockHandle, ScheduleError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        assert!(period > Duration::ZERO, "clock period must be nonzero");

        let data = Arc::new(ClockData {
            callback: Arc::new(callback),
            period,
            cancelled: AtomicBool::new(false),
            queue_handle: AtomicU64::new(0),
        });

        let mut inner = self.shared.inner.lock().unwrap();
        let earliest = inner.clocks.next_deadline();
        // Register in the handle map only after the queue accepts the
        // first firing; on failure the ClockData simply drops.
        let queue_handle = inner
            .clocks
            .add(first, EventKey::NONE, data.clone())
            .map_err(|_| ScheduleError::Exhausted)?;
        data.queue_handle.store(queue_handle.raw(), Ordering::Relaxed);

        let handle = ClockHandle(inner.next_clock_handle);
        inner.next_clock_handle += 1;
        inner.registry.insert(handle, data);
        self.shared.num_clocks.fetch_add(1, Ordering::Relaxed);

        if earliest.map_or(true, |d| first < d) {
            self.shared.work_cv.notify_all();
        }
        Ok(handle)
    }

    /// Cancel a clock. `Ok` guarantees no *new* firings: the cancelled
    /// flag is set before the queue removal is attempted, so even a
    /// firing already drained by the dispatcher is suppressed before
    /// invocation or re-arm. An invocation already in progress cannot be
    /// recalled; `wait = true` blocks one dispatch pass so it has
    /// finished by the time this returns.
    pub fn cancel_clock(&self, handle: ClockHandle, wait: bool) -> Result<(), CancelError> {
        let still_in_queue = {
            let mut inner = self.shared.inner.lock().unwrap();
            let Some(data) = inner.registry.remove(&handle) else {
                return Err(CancelError::NotFound);
            };
            // Flag first: closes the race against an in-flight firing.
            data.cancelled.store(true, Ordering::Release);
            self.shared.num_clocks.fetch_sub(1, Ordering::Relaxed);

            let queue_handle = TqHandle::from_raw(data.queue_handle.load(Ordering::Relaxed));
            inner.clocks.remove(queue_handle, EventKey::NONE).is_ok()
        };
        if !still_in_queue && wait {
            // Removal race-lost: the firing is in the dispatcher's buffer
            // or executing right now.
            self.yield_to_dispatcher();
        }
        Ok(())
    }

    /// Cancel every registered clock. All cancelled flags are set before
    /// any queue removal is attempted, closing the in-flight race for
    /// the whole batch at once.
    pub fn cancel_all_clocks(&self, wait: bool) {
        let any_in_flight = {
            let mut inner = self.shared.inner.lock().unwrap();
            let drained: Vec<Arc<ClockData>> = inner.registry.drain().map(|(_, d)| d).collect();
            for data in &drained {
                data.cancelled.store(true, Ordering::Release);
            }
            let mut any_in_flight = false;
            for data in &drained {
                let queue_handle = TqHandle::from_raw(data.queue_handle.load(Ordering::Relaxed));
                if inner.clocks.remove(queue_handle, EventKey::NONE).is_err() {
                    any_in_flight = true;
                }
            }
            if !drained.is_empty() {
                self.shared.num_clocks.fetch_sub(drained.len(), Ordering::Relaxed);
            }
            any_in_flight
        };
        if any_in_flight && wait {
            self.yield_to_dispatcher();
        }
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Block until the dispatcher has completed at least one full
    /// drain-and-dispatch pass, the primitive behind every `wait = true`
    /// path. Returns immediately when called from the dispatcher thread
    /// (waiting for oneself) or when the scheduler is stopped.
    pub fn yield_to_dispatcher(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if !inner.running || inner.dispatcher_thread == Some(thread::current().id()) {
            return;
        }
        let target = inner.passes_completed + 1;
        // Nudge the dispatcher out of its deadline wait.
        self.shared.work_cv.notify_all();
        while inner.running && inner.passes_completed < target {
            inner = self.shared.pass_cv.wait(inner).unwrap();
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Number of scheduled events not yet fired or cancelled (including
    /// items drained for the pass in progress).
    pub fn num_events(&self) -> usize {
        self.shared.num_events.load(Ordering::Relaxed)
    }

    /// Number of registered, non-cancelled clocks.
    pub fn num_clocks(&self) -> usize {
        self.shared.num_clocks.load(Ordering::Relaxed)
    }

    /// Snapshot of dispatcher counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            passes: self.shared.stats.passes.load(Ordering::Relaxed),
            events_fired: self.shared.stats.events_fired.load(Ordering::Relaxed),
            clocks_fired: self.shared.stats.clocks_fired.load(Ordering::Relaxed),
            callback_panics: self.shared.stats.callback_panics.load(Ordering::Relaxed),
        }
    }
}

impl Default for TimerEventScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerEventScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TimerEventScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEventScheduler")
            .field("clock_type", &self.shared.clock_type)
            .field("num_events", &self.num_events())
            .field("num_clocks", &self.num_clocks())
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Dispatcher thread
// ============================================================================

fn dispatcher_loop(shared: &Shared) {
    let mut due_clocks: Vec<TqItem<Arc<ClockData>>> = Vec::with_capacity(MAX_PENDING_PER_QUEUE);
    let mut due_events: Vec<TqItem<EventCallback>> = Vec::with_capacity(MAX_PENDING_PER_QUEUE);

    let mut inner = shared.inner.lock().unwrap();
    inner.dispatcher_thread = Some(thread::current().id());

    while inner.running {
        let now = shared.clock_type.now();
        due_clocks.clear();
        due_events.clear();
        let clock_drain = inner.clocks.pop_due(now, MAX_PENDING_PER_QUEUE, &mut due_clocks);
        let event_drain = inner.events.pop_due(now, MAX_PENDING_PER_QUEUE, &mut due_events);

        if due_clocks.is_empty() && due_events.is_empty() {
            complete_pass(shared, &mut inner);
            let next = match (clock_drain.next_deadline, event_drain.next_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            inner = match next {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(shared.clock_type.now());
                    shared.work_cv.wait_timeout(inner, timeout).unwrap().0
                }
                None => shared.work_cv.wait(inner).unwrap(),
            };
            continue;
        }

        // Publish drained events so a same-thread cancel can suppress
        // the ones that have not started yet.
        let pending: Vec<Arc<PendingEvent>> = due_events
            .drain(..)
            .map(|item| {
                Arc::new(PendingEvent {
                    handle: item.handle,
                    key: item.key,
                    time: item.time,
                    callback: item.data,
                    skipped: AtomicBool::new(false),
                })
            })
            .collect();
        inner.pending_events = pending.clone();
        shared.pending_pos.store(usize::MAX, Ordering::Relaxed);
        drop(inner);

        dispatch_pass(shared, &due_clocks, &pending);

        inner = shared.inner.lock().unwrap();
        inner.pending_events.clear();
        complete_pass(shared, &mut inner);
    }

    inner.dispatcher_thread = None;
    inner.pending_events.clear();
    // Release anyone parked in yield_to_dispatcher.
    shared.pass_cv.notify_all();
}

fn complete_pass(shared: &Shared, inner: &mut Inner) {
    inner.passes_completed += 1;
    shared.stats.passes.fetch_add(1, Ordering::Relaxed);
    shared.pass_cv.notify_all();
}

/// Invoke due clocks and events merged in ascending deadline order.
/// Runs with no lock held.
fn dispatch_pass(shared: &Shared, clocks: &[TqItem<Arc<ClockData>>], events: &[Arc<PendingEvent>]) {
    let mut ci = 0;
    let mut ei = 0;
    while ci < clocks.len() || ei < events.len() {
        let clock_turn = match (clocks.get(ci), events.get(ei)) {
            (Some(c), Some(e)) => c.time <= e.time,
            (Some(_), None) => true,
            _ => false,
        };
        if clock_turn {
            dispatch_clock(shared, &clocks[ci]);
            ci += 1;
        } else {
            let pending = &events[ei];
            shared.pending_pos.store(ei, Ordering::Relaxed);
            ei += 1;
            if pending.skipped.load(Ordering::Relaxed) {
                continue;
            }
            shared.num_events.fetch_sub(1, Ordering::Relaxed);
            invoke(shared, &pending.callback);
            shared.stats.events_fired.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn dispatch_clock(shared: &Shared, item: &TqItem<Arc<ClockData>>) {
    let data = &item.data;
    // First gate: a cancel that raced the queue drain.
    if data.cancelled.load(Ordering::Acquire) {
        return;
    }
    invoke(shared, &data.callback);
    shared.stats.clocks_fired.fetch_add(1, Ordering::Relaxed);

    let mut inner = shared.inner.lock().unwrap();
    // Second gate, under the mutex: the callback itself (or a concurrent
    // caller) may have cancelled this clock; never re-arm it then.
    if data.cancelled.load(Ordering::Acquire) {
        return;
    }
    // Re-arm from the scheduled time, not from now: dispatch latency
    // must not accumulate into drift.
    let next = item.time + data.period;
    match inner.clocks.add(next, EventKey::NONE, data.clone()) {
        Ok(queue_handle) => data.queue_handle.store(queue_handle.raw(), Ordering::Relaxed),
        Err(_) => {
            inner.registry.retain(|_, d| !Arc::ptr_eq(d, data));
            shared.num_clocks.fetch_sub(1, Ordering::Relaxed);
            warn!("clock re-arm failed: handle space exhausted; clock dropped");
        }
    }
}

fn invoke(shared: &Shared, callback: &EventCallback) {
    let dispatcher = &shared.dispatcher;
    if catch_unwind(AssertUnwindSafe(|| dispatcher(callback))).is_err() {
        shared.stats.callback_panics.fetch_add(1, Ordering::Relaxed);
        error!("callback panicked on dispatcher thread; dispatcher continues");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started() -> TimerEventScheduler {
        let scheduler = TimerEventScheduler::new();
        scheduler.start().unwrap();
        scheduler
    }

    #[test]
    fn test_event_fires() {
        let scheduler = started();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler
            .schedule_event(scheduler.now() + Duration::from_millis(10), EventKey::NONE, move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(scheduler.num_events(), 1);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.num_events(), 0);
    }

    #[test]
    fn test_past_deadline_fires_promptly() {
        let scheduler = started();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler
            .schedule_event(scheduler.now() - Duration::from_secs(1), EventKey::NONE, move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_fire() {
        let scheduler = started();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let handle = scheduler
            .schedule_event(scheduler.now() + Duration::from_millis(100), EventKey(9), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scheduler.cancel_event(handle, EventKey(9), false).unwrap();
        assert_eq!(scheduler.num_events(), 0);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let scheduler = started();
        let handle = scheduler
            .schedule_event(scheduler.now() + Duration::from_secs(10), EventKey(1), || {})
            .unwrap();

        assert_eq!(scheduler.cancel_event(handle, EventKey(2), false), Err(CancelError::NotFound));
        assert_eq!(
            scheduler.reschedule_event(handle, EventKey(2), scheduler.now(), false),
            Err(CancelError::NotFound)
        );
        // The real event is untouched
        assert_eq!(scheduler.num_events(), 1);
        scheduler.cancel_event(handle, EventKey(1), false).unwrap();
    }

    #[test]
    fn test_clock_fires_repeatedly() {
        let scheduler = started();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let handle = scheduler
            .start_clock(Duration::from_millis(10), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(scheduler.num_clocks(), 1);

        thread::sleep(Duration::from_millis(100));
        scheduler.cancel_clock(handle, true).unwrap();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 5, "clock fired only {} times", fired);
        assert_eq!(scheduler.num_clocks(), 0);
    }

    #[test]
    fn test_cancelled_clock_stays_cancelled() {
        let scheduler = started();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let handle = scheduler
            .start_clock(Duration::from_millis(5), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        thread::sleep(Duration::from_millis(30));
        scheduler.cancel_clock(handle, true).unwrap();
        let after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);

        // Double cancel fails cleanly
        assert_eq!(scheduler.cancel_clock(handle, false), Err(CancelError::NotFound));
    }

    #[test]
    fn test_start_stop_idempotent() {
        let scheduler = TimerEventScheduler::new();
        scheduler.stop(); // stop before ever starting is a no-op

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());

        // Restart works
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
    }

    #[test]
    fn test_stop_preserves_pending_work() {
        let scheduler = TimerEventScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler
            .schedule_event(scheduler.now() + Duration::from_millis(10), EventKey::NONE, move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Not started: nothing fires
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.num_events(), 1);

        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reschedule_moves_deadline() {
        let scheduler = started();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let handle = scheduler
            .schedule_event(scheduler.now() + Duration::from_secs(60), EventKey(3), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scheduler
            .reschedule_event(handle, EventKey(3), scheduler.now() + Duration::from_millis(10), false)
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhausted_handle_space() {
        let scheduler = TimerEventScheduler::with_config(SchedulerConfig::default().max_events(2));
        let far = scheduler.now() + Duration::from_secs(60);
        scheduler.schedule_event(far, EventKey::NONE, || {}).unwrap();
        scheduler.schedule_event(far, EventKey::NONE, || {}).unwrap();
        assert_eq!(
            scheduler.schedule_event(far, EventKey::NONE, || {}),
            Err(ScheduleError::Exhausted)
        );
    }

    #[test]
    fn test_dispatcher_override_wraps_invocations() {
        let wrapped = Arc::new(AtomicUsize::new(0));
        let w = wrapped.clone();
        let scheduler = TimerEventScheduler::with_config(SchedulerConfig::default().dispatcher(
            Arc::new(move |callback: &EventCallback| {
                w.fetch_add(1, Ordering::SeqCst);
                callback();
            }),
        ));
        scheduler.start().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        scheduler
            .schedule_event(scheduler.now(), EventKey::NONE, move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(wrapped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_counters() {
        let scheduler = started();
        scheduler.schedule_event(scheduler.now(), EventKey::NONE, || {}).unwrap();
        thread::sleep(Duration::from_millis(50));

        let stats = scheduler.stats();
        assert_eq!(stats.events_fired, 1);
        assert!(stats.passes >= 1);
        assert_eq!(stats.callback_panics, 0);
    }

    #[test]
    fn test_start_with_thread_attributes() {
        let scheduler = TimerEventScheduler::new();
        scheduler.start_with("attrs-test", Some(256 * 1024)).unwrap();

        let seen = Arc::new(Mutex::new(None::<String>));
        let s = seen.clone();
        scheduler
            .schedule_event(scheduler.now(), EventKey::NONE, move || {
                *s.lock().unwrap() = thread::current().name().map(String::from);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("attrs-test"));

        // Each restart can pick fresh attributes
        scheduler.stop();
        scheduler.start_with("attrs-test-2", None).unwrap();
        let s = seen.clone();
        scheduler
            .schedule_event(scheduler.now(), EventKey::NONE, move || {
                *s.lock().unwrap() = thread::current().name().map(String::from);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("attrs-test-2"));

        // Redundant start_with on a running scheduler is a no-op
        scheduler.start_with("ignored", None).unwrap();
        assert!(scheduler.is_running());
    }

    #[test]
    fn test_spawn_failure_rolls_back() {
        // A stack size beyond the address space makes spawn fail
        let scheduler = TimerEventScheduler::with_config(
            SchedulerConfig::default().stack_size(1 << 50),
        );
        assert!(matches!(scheduler.start(), Err(StartError::Spawn(_))));
        assert!(!scheduler.is_running());

        // Waiters see the rolled-back state instead of hanging
        scheduler.yield_to_dispatcher();

        // Retrying with sane attributes recovers
        scheduler.start_with("spawn-retry", None).unwrap();
        assert!(scheduler.is_running());
    }

    #[test]
    #[should_panic(expected = "clock period must be nonzero")]
    fn test_zero_period_asserts() {
        let scheduler = TimerEventScheduler::new();
        let _ = scheduler.start_clock(Duration::ZERO, || {});
    }
}
