//! Timer scheduler demo
//!
//! Runs a scheduler with a mix of recurring clocks and one-shot events,
//! cancels some of them mid-flight, and prints the dispatch counters.
//!
//! ```sh
//! RUST_LOG=debug cargo run -p chronomux-clock-demo
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chronomux::{EventKey, SchedulerConfig, TimerEventScheduler};
use tracing::info;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let scheduler = TimerEventScheduler::with_config(
        SchedulerConfig::default().thread_name("demo-dispatch"),
    );
    scheduler.start().expect("failed to start dispatcher");

    // A fast clock and a slow clock
    let fast_fires = Arc::new(AtomicUsize::new(0));
    let f = fast_fires.clone();
    let fast = scheduler
        .start_clock(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::Relaxed);
        })
        .expect("failed to start fast clock");

    scheduler
        .start_clock(Duration::from_millis(200), || {
            info!("slow clock tick");
        })
        .expect("failed to start slow clock");

    // One-shot events, one of which gets cancelled before its deadline
    let at = scheduler.now() + Duration::from_millis(300);
    scheduler
        .schedule_event(at, EventKey(1), || info!("one-shot event fired"))
        .expect("failed to schedule event");
    let doomed = scheduler
        .schedule_event(at, EventKey(2), || info!("this should never print"))
        .expect("failed to schedule event");
    scheduler
        .cancel_event(doomed, EventKey(2), false)
        .expect("failed to cancel event");

    thread::sleep(Duration::from_millis(500));

    scheduler.cancel_clock(fast, true).expect("failed to cancel clock");
    let fast_count = fast_fires.load(Ordering::Relaxed);
    info!(fast_count, "fast clock cancelled");

    thread::sleep(Duration::from_millis(300));

    let stats = scheduler.stats();
    info!(
        passes = stats.passes,
        events_fired = stats.events_fired,
        clocks_fired = stats.clocks_fired,
        "shutting down"
    );
    scheduler.stop();
}
