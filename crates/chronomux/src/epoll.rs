//! epoll-backed socket event manager (Linux)
//!
//! [`EpollEventManager`] implements [`SocketEventManager`] over a level-
//! triggered epoll instance. One registry entry per fd tracks up to two
//! callbacks (read, write) and the interest mask currently armed in the
//! kernel; registration changes translate to `EPOLL_CTL_ADD`/`MOD`/`DEL`.
//!
//! # Re-entrancy
//!
//! Dispatched callbacks may register and deregister freely, including
//! against the fd currently being dispatched. Two rules make that safe:
//!
//! - Callbacks are looked up (and cloned out) per ready condition, right
//!   before invocation, so a deregistration by an earlier callback in
//!   the same dispatch suppresses later invocations.
//! - While the ready list is being walked, kernel-side `epoll_ctl` sync
//!   is deferred: affected fds are queued and flushed after the walk.
//!   The logical registry updates immediately either way.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::EventManagerError;
use crate::event_manager::{InterruptMode, SocketCallback, SocketEvent, SocketEventManager};

/// Ready-list capacity per `epoll_wait` call. Readiness beyond this is
/// picked up by the next dispatch (level-triggered).
const MAX_READY: usize = 64;

const READ_BITS: u32 =
    (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
const WRITE_BITS: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Lifetime counters for one [`EpollEventManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpollStats {
    /// `dispatch()` calls that reached `epoll_wait`.
    pub dispatches: u64,
    /// Callbacks invoked across all dispatches.
    pub callbacks_invoked: u64,
    /// `epoll_wait` calls interrupted by a signal.
    pub interrupts: u64,
    /// Successful callback registrations (including replacements).
    pub registrations: u64,
    /// Callback deregistrations.
    pub deregistrations: u64,
}

struct Interest {
    read: Option<SocketCallback>,
    write: Option<SocketCallback>,
    /// Interest mask currently armed in the kernel (0 = not added).
    armed: u32,
}

impl Interest {
    fn wanted(&self) -> u32 {
        let mut mask = 0;
        if self.read.is_some() {
            mask |= libc::EPOLLIN as u32;
        }
        if self.write.is_some() {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    fn count(&self) -> usize {
        usize::from(self.read.is_some()) + usize::from(self.write.is_some())
    }
}

struct State {
    interests: HashMap<RawFd, Interest>,
    num_events: usize,
    /// True while dispatch() walks a ready list; epoll_ctl sync is
    /// deferred to `pending_sync` for the duration.
    in_dispatch: bool,
    pending_sync: Vec<RawFd>,
}

struct Counters {
    dispatches: Cell<u64>,
    callbacks_invoked: Cell<u64>,
    interrupts: Cell<u64>,
    registrations: Cell<u64>,
    deregistrations: Cell<u64>,
}

struct ManagerInner {
    epfd: RawFd,
    state: RefCell<State>,
    stats: Counters,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// [`SocketEventManager`] backed by an epoll instance.
///
/// Cheap to clone; clones share the registry and the epoll fd, which is
/// what lets a dispatched callback capture a handle to its own manager.
#[derive(Clone)]
pub struct EpollEventManager {
    inner: Rc<ManagerInner>,
}

impl EpollEventManager {
    /// Create a manager with its own epoll instance.
    pub fn new() -> Result<Self, EventManagerError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(last_os_error());
        }
        Ok(Self {
            inner: Rc::new(ManagerInner {
                epfd,
                state: RefCell::new(State {
                    interests: HashMap::new(),
                    num_events: 0,
                    in_dispatch: false,
                    pending_sync: Vec::new(),
                }),
                stats: Counters {
                    dispatches: Cell::new(0),
                    callbacks_invoked: Cell::new(0),
                    interrupts: Cell::new(0),
                    registrations: Cell::new(0),
                    deregistrations: Cell::new(0),
                },
            }),
        })
    }

    /// Snapshot of lifetime counters.
    pub fn stats(&self) -> EpollStats {
        let stats = &self.inner.stats;
        EpollStats {
            dispatches: stats.dispatches.get(),
            callbacks_invoked: stats.callbacks_invoked.get(),
            interrupts: stats.interrupts.get(),
            registrations: stats.registrations.get(),
            deregistrations: stats.deregistrations.get(),
        }
    }

    /// Bring the kernel registration of `fd` in line with the registry,
    /// or defer that to the end of the dispatch in progress. Drops the
    /// registry entry once it holds no callbacks and is disarmed.
    fn sync_or_defer(&self, fd: RawFd) -> Result<(), EventManagerError> {
        let mut state = self.inner.state.borrow_mut();
        if state.in_dispatch {
            if !state.pending_sync.contains(&fd) {
                state.pending_sync.push(fd);
            }
            return Ok(());
        }
        self.sync_fd(&mut state, fd)
    }

    fn sync_fd(&self, state: &mut State, fd: RawFd) -> Result<(), EventManagerError> {
        let (wanted, armed) = match state.interests.get(&fd) {
            Some(interest) => (interest.wanted(), interest.armed),
            None => return Ok(()),
        };

        let op = if armed == 0 && wanted != 0 {
            libc::EPOLL_CTL_ADD
        } else if armed != 0 && wanted == 0 {
            libc::EPOLL_CTL_DEL
        } else if armed != wanted {
            libc::EPOLL_CTL_MOD
        } else {
            if wanted == 0 {
                state.interests.remove(&fd);
            }
            return Ok(());
        };

        let mut ev = libc::epoll_event {
            events: wanted,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.inner.epfd, op, fd, &mut ev) };
        if rc < 0 {
            // A socket closed while registered disappears from epoll on
            // its own; treat the resulting DEL failure as already done.
            if op != libc::EPOLL_CTL_DEL {
                return Err(last_os_error());
            }
        }
        if wanted == 0 {
            state.interests.remove(&fd);
        } else if let Some(interest) = state.interests.get_mut(&fd) {
            interest.armed = wanted;
        }
        Ok(())
    }

    /// Run one `epoll_wait`, honoring the interrupt mode and the
    /// caller's overall deadline.
    fn wait(
        &self,
        ready: &mut [libc::epoll_event],
        deadline: Option<Instant>,
        mode: InterruptMode,
    ) -> Result<usize, EventManagerError> {
        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    millis_ceil(remaining)
                }
            };
            let n = unsafe {
                libc::epoll_wait(
                    self.inner.epfd,
                    ready.as_mut_ptr(),
                    ready.len() as i32,
                    timeout_ms,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                self.inner.stats.interrupts.set(self.inner.stats.interrupts.get() + 1);
                match mode {
                    InterruptMode::Report => return Err(EventManagerError::Interrupted),
                    InterruptMode::Restart => {
                        if deadline.is_some_and(|d| Instant::now() >= d) {
                            return Ok(0);
                        }
                        continue;
                    }
                }
            }
            return Err(EventManagerError::Os(err.raw_os_error().unwrap_or(0)));
        }
    }

    /// Look up and clone out the callback for one ready condition. A
    /// fresh borrow per lookup, so deregistrations made by callbacks
    /// earlier in this dispatch are honored.
    fn callback_for(&self, fd: RawFd, event: SocketEvent) -> Option<SocketCallback> {
        let state = self.inner.state.borrow();
        let interest = state.interests.get(&fd)?;
        match event {
            SocketEvent::Read => interest.read.clone(),
            SocketEvent::Write => interest.write.clone(),
        }
    }
}

impl SocketEventManager for EpollEventManager {
    fn register_socket_event(
        &self,
        fd: RawFd,
        event: SocketEvent,
        callback: SocketCallback,
    ) -> Result<(), EventManagerError> {
        {
            let mut state = self.inner.state.borrow_mut();
            let interest = state.interests.entry(fd).or_insert(Interest {
                read: None,
                write: None,
                armed: 0,
            });
            let slot = match event {
                SocketEvent::Read => &mut interest.read,
                SocketEvent::Write => &mut interest.write,
            };
            if slot.replace(callback).is_none() {
                state.num_events += 1;
            }
        }

        if let Err(e) = self.sync_or_defer(fd) {
            // Roll the registry back so a failed registration leaves no
            // trace (e.g. fd is not pollable, EPERM on a regular file).
            let mut state = self.inner.state.borrow_mut();
            let remove = if let Some(interest) = state.interests.get_mut(&fd) {
                match event {
                    SocketEvent::Read => interest.read = None,
                    SocketEvent::Write => interest.write = None,
                }
                Some(interest.count() == 0 && interest.armed == 0)
            } else {
                None
            };
            if let Some(remove) = remove {
                state.num_events -= 1;
                if remove {
                    state.interests.remove(&fd);
                }
            }
            return Err(e);
        }

        self.inner.stats.registrations.set(self.inner.stats.registrations.get() + 1);
        Ok(())
    }

    fn deregister_socket_event(&self, fd: RawFd, event: SocketEvent) -> bool {
        let removed = {
            let mut state = self.inner.state.borrow_mut();
            let Some(interest) = state.interests.get_mut(&fd) else {
                return false;
            };
            let slot = match event {
                SocketEvent::Read => &mut interest.read,
                SocketEvent::Write => &mut interest.write,
            };
            let removed = slot.take().is_some();
            if removed {
                state.num_events -= 1;
            }
            removed
        };
        if removed {
            if let Err(e) = self.sync_or_defer(fd) {
                warn!(fd, error = %e, "failed to sync epoll interest after deregistration");
            }
            self.inner.stats.deregistrations.set(self.inner.stats.deregistrations.get() + 1);
        }
        removed
    }

    fn deregister_socket(&self, fd: RawFd) -> usize {
        let removed = {
            let mut state = self.inner.state.borrow_mut();
            let Some(interest) = state.interests.get_mut(&fd) else {
                return 0;
            };
            let removed = interest.count();
            interest.read = None;
            interest.write = None;
            state.num_events -= removed;
            removed
        };
        if removed > 0 {
            if let Err(e) = self.sync_or_defer(fd) {
                warn!(fd, error = %e, "failed to sync epoll interest after deregistration");
            }
            self.inner.stats.deregistrations.set(
                self.inner.stats.deregistrations.get() + removed as u64,
            );
        }
        removed
    }

    fn deregister_all(&self) {
        let fds: Vec<RawFd> = {
            let state = self.inner.state.borrow();
            state.interests.keys().copied().collect()
        };
        for fd in fds {
            self.deregister_socket(fd);
        }
    }

    fn is_registered(&self, fd: RawFd, event: SocketEvent) -> bool {
        let state = self.inner.state.borrow();
        state.interests.get(&fd).is_some_and(|interest| match event {
            SocketEvent::Read => interest.read.is_some(),
            SocketEvent::Write => interest.write.is_some(),
        })
    }

    fn num_events(&self) -> usize {
        self.inner.state.borrow().num_events
    }

    fn num_socket_events(&self, fd: RawFd) -> usize {
        let state = self.inner.state.borrow();
        state.interests.get(&fd).map_or(0, Interest::count)
    }

    fn dispatch(
        &self,
        timeout: Option<Duration>,
        mode: InterruptMode,
    ) -> Result<usize, EventManagerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ready = [libc::epoll_event { events: 0, u64: 0 }; MAX_READY];

        self.inner.stats.dispatches.set(self.inner.stats.dispatches.get() + 1);
        let n = self.wait(&mut ready, deadline, mode)?;

        self.inner.state.borrow_mut().in_dispatch = true;
        // The guard ends the walk even if a callback panics; otherwise
        // every later registration change would defer its epoll_ctl sync
        // forever and the kernel interest set would diverge.
        let walk = WalkGuard { manager: self };
        let mut invoked = 0;
        for entry in &ready[..n] {
            let fd = entry.u64 as RawFd;
            if entry.events & READ_BITS != 0 {
                if let Some(callback) = self.callback_for(fd, SocketEvent::Read) {
                    callback();
                    invoked += 1;
                }
            }
            if entry.events & WRITE_BITS != 0 {
                if let Some(callback) = self.callback_for(fd, SocketEvent::Write) {
                    callback();
                    invoked += 1;
                }
            }
        }
        drop(walk);

        self.inner.stats.callbacks_invoked.set(
            self.inner.stats.callbacks_invoked.get() + invoked as u64,
        );
        Ok(invoked)
    }
}

/// Marks the end of a ready-list walk: clears `in_dispatch` and flushes
/// the kernel-side changes callbacks deferred onto `pending_sync`. Runs
/// on unwind too, so no borrow of the state may be live across callback
/// invocation (none is; callbacks are cloned out before the call).
struct WalkGuard<'a> {
    manager: &'a EpollEventManager,
}

impl Drop for WalkGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.inner.state.borrow_mut();
        state.in_dispatch = false;
        while let Some(fd) = state.pending_sync.pop() {
            if let Err(e) = self.manager.sync_fd(&mut state, fd) {
                warn!(fd, error = %e, "failed to sync deferred epoll interest");
            }
        }
    }
}

fn last_os_error() -> EventManagerError {
    EventManagerError::Os(io::Error::last_os_error().raw_os_error().unwrap_or(0))
}

/// Duration to epoll timeout millis, rounding up so a short remainder
/// does not degenerate into a busy loop.
fn millis_ceil(d: Duration) -> i32 {
    if d.is_zero() {
        return 0;
    }
    let ms = d.as_millis();
    let ms = if Duration::from_millis(ms as u64) < d { ms + 1 } else { ms };
    ms.min(i32::MAX as u128) as i32
}
