//! Socket readiness protocol
//!
//! [`SocketEventManager`] is the contract for per-socket readiness
//! callback registries. Implementations are caller-driven: nothing
//! happens until the owner calls [`dispatch`](SocketEventManager::dispatch),
//! which polls the OS once and invokes the callbacks of every ready
//! registration on the calling thread.
//!
//! Managers are single-threaded by design (callbacks are `Rc`, not
//! `Arc`); the owner drives one manager from one thread, typically its
//! event loop.

use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::error::EventManagerError;

/// A readiness condition on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEvent {
    /// The socket is readable (data, EOF, or a pending accept).
    Read,
    /// The socket is writable (or a pending connect has resolved).
    Write,
}

/// A readiness callback. Cloned out of the registry before invocation,
/// so a callback may freely re-enter the manager.
pub type SocketCallback = Rc<dyn Fn()>;

/// What [`SocketEventManager::dispatch`] does when the underlying OS
/// wait is interrupted by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    /// Re-enter the wait with the remaining timeout. The interruption is
    /// invisible to the caller.
    #[default]
    Restart,
    /// Return [`EventManagerError::Interrupted`] so the caller can run
    /// its own signal handling before dispatching again.
    Report,
}

/// Registry of per-socket readiness callbacks with caller-driven dispatch.
pub trait SocketEventManager {
    /// Register `callback` to be invoked whenever `fd` is ready for
    /// `event`. Registering the same `(fd, event)` pair again replaces
    /// the previous callback.
    fn register_socket_event(
        &self,
        fd: RawFd,
        event: SocketEvent,
        callback: SocketCallback,
    ) -> Result<(), EventManagerError>;

    /// Remove the callback for `(fd, event)`. Returns `true` if one was
    /// registered. Safe to call from inside a dispatched callback: a
    /// deregistered callback is never invoked later in the same
    /// dispatch, and no callback is invoked twice per dispatch.
    fn deregister_socket_event(&self, fd: RawFd, event: SocketEvent) -> bool;

    /// Remove every callback registered for `fd`, returning how many
    /// were removed.
    fn deregister_socket(&self, fd: RawFd) -> usize;

    /// Remove every registration.
    fn deregister_all(&self);

    /// True if a callback is registered for `(fd, event)`.
    fn is_registered(&self, fd: RawFd, event: SocketEvent) -> bool;

    /// Total registered callbacks across all sockets.
    fn num_events(&self) -> usize;

    /// Registered callbacks for one socket (0, 1, or 2).
    fn num_socket_events(&self, fd: RawFd) -> usize;

    /// Wait up to `timeout` (`None` = indefinitely) for readiness and
    /// invoke the callbacks of every ready registration, in the order
    /// the OS reported them. Returns the number of callbacks invoked;
    /// `Ok(0)` means the timeout expired.
    fn dispatch(
        &self,
        timeout: Option<Duration>,
        mode: InterruptMode,
    ) -> Result<usize, EventManagerError>;

    /// True if the implementation caps how many sockets can be
    /// registered (e.g. a fixed-size `select()` set). Callers that pool
    /// managers use this to decide when to spill to a fresh one.
    fn has_limited_socket_capacity(&self) -> bool {
        false
    }
}
