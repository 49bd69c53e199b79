//! Socket readiness demo (Linux)
//!
//! Feeds bytes through a pipe from a writer thread and drives an
//! [`chronomux::EpollEventManager`] dispatch loop on the main thread.
//!
//! ```sh
//! RUST_LOG=debug cargo run -p chronomux-readiness-demo
//! ```

#[cfg(target_os = "linux")]
fn main() {
    use std::cell::Cell;
    use std::os::fd::RawFd;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    use chronomux::{EpollEventManager, InterruptMode, SocketEvent, SocketEventManager};
    use tracing::info;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut fds: [RawFd; 2] = [0; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    let (read_fd, write_fd) = (fds[0], fds[1]);

    const MESSAGES: usize = 5;
    let writer = thread::spawn(move || {
        for i in 0..MESSAGES as u8 {
            thread::sleep(Duration::from_millis(100));
            let byte = [i];
            unsafe { libc::write(write_fd, byte.as_ptr().cast(), 1) };
        }
    });

    let manager = EpollEventManager::new().expect("failed to create epoll instance");
    let received = Rc::new(Cell::new(0usize));

    let r = received.clone();
    manager
        .register_socket_event(
            read_fd,
            SocketEvent::Read,
            Rc::new(move || {
                let mut byte = [0u8];
                let n = unsafe { libc::read(read_fd, byte.as_mut_ptr().cast(), 1) };
                assert_eq!(n, 1);
                r.set(r.get() + 1);
                info!(seq = byte[0], "received byte");
            }),
        )
        .expect("failed to register read callback");

    while received.get() < MESSAGES {
        let dispatched = manager
            .dispatch(Some(Duration::from_secs(1)), InterruptMode::Restart)
            .expect("dispatch failed");
        if dispatched == 0 {
            info!("dispatch timed out, retrying");
        }
    }

    writer.join().unwrap();
    manager.deregister_all();

    let stats = manager.stats();
    info!(
        dispatches = stats.dispatches,
        callbacks = stats.callbacks_invoked,
        "done"
    );

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("readiness-demo requires Linux (epoll)");
}
