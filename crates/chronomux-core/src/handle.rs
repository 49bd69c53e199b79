//! Queue handles and event keys
//!
//! A [`TqHandle`] identifies one live entry in a [`crate::TimeQueue`]. It
//! packs the entry's slot index together with the slot's generation
//! counter, so a handle kept past the entry's removal goes stale instead
//! of silently aliasing whatever entry reuses the slot.
//!
//! An [`EventKey`] is a second, caller-supplied identity token stored
//! alongside the entry. Cancellation and reschedule must present the
//! matching key; a recycled handle with the wrong key is rejected.

/// Handle to one live entry in a time queue.
///
/// Layout: low 32 bits slot index, high 32 bits slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TqHandle(u64);

impl TqHandle {
    #[inline]
    pub(crate) fn pack(index: u32, generation: u32) -> Self {
        TqHandle(u64::from(index) | (u64::from(generation) << 32))
    }

    #[inline]
    pub(crate) fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw handle value (for debugging/logging, or compact storage).
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from [`raw`](Self::raw). A fabricated value is
    /// harmless: it simply fails to resolve.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        TqHandle(raw)
    }
}

/// Caller-supplied identity token stored with a queue entry.
///
/// Guards against a recycled handle being mistaken for a different
/// logical event: operations that take a handle also take the key the
/// entry was registered with, and fail on mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventKey(pub u64);

impl EventKey {
    /// The default key, for callers that do not track per-event identity.
    pub const NONE: EventKey = EventKey(0);
}
