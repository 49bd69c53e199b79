//! Handle-indexed deadline queue
//!
//! A [`TimeQueue`] holds entries keyed by absolute deadline and hands back
//! a stable [`TqHandle`] per entry, so callers can update or remove an
//! entry in place. [`HeapTimeQueue`] is the provided implementation.
//!
//! # Implementation
//!
//! A slab of slots (free list + per-slot generation) owns the entry data;
//! a `BinaryHeap` of `(deadline, sequence, handle)` provides ordering.
//! Removal and update are lazy with respect to the heap: `update` bumps
//! the entry's sequence number and pushes a fresh heap node, `remove`
//! frees the slot, and superseded or dead heap nodes are discarded when
//! they surface at the top.
//!
//! # Complexity
//!
//! - Add / update: O(log n)
//! - Remove: O(1) (heap node discarded lazily)
//! - Pop due: O(k log n) for k popped entries
//!
//! The queue is a plain container, not a synchronized one. Callers that
//! share it across threads guard it externally; the scheduler keeps both
//! of its queues under one mutex.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::QueueError;
use crate::handle::{EventKey, TqHandle};
use crate::time::TimePoint;

/// One entry drained from a [`TimeQueue`].
#[derive(Debug)]
pub struct TqItem<D> {
    /// The deadline the entry was scheduled at.
    pub time: TimePoint,
    /// The handle the entry was registered under (now dead).
    pub handle: TqHandle,
    /// The caller-supplied identity key.
    pub key: EventKey,
    /// The payload.
    pub data: D,
}

/// Result of a [`TimeQueue::pop_due`] drain.
#[derive(Debug, Clone, Copy)]
pub struct PopOutcome {
    /// Live entries still in the queue after the drain.
    pub remaining: usize,
    /// Deadline of the earliest remaining entry, if any.
    pub next_deadline: Option<TimePoint>,
}

/// The deadline-queue contract consumed by the scheduler.
///
/// All mutators take `&mut self`; thread safety is the caller's concern.
pub trait TimeQueue<D> {
    /// Insert an entry. Fails with [`QueueError::Full`] if the handle
    /// space is exhausted.
    fn add(&mut self, time: TimePoint, key: EventKey, data: D) -> Result<TqHandle, QueueError>;

    /// Move an existing entry to a new deadline. The stored key must
    /// match or the update is rejected with [`QueueError::Stale`].
    fn update(
        &mut self,
        handle: TqHandle,
        key: EventKey,
        new_time: TimePoint,
    ) -> Result<(), QueueError>;

    /// Remove an entry, returning it. [`QueueError::Stale`] means the
    /// entry had already been popped or removed, or the key mismatched.
    fn remove(&mut self, handle: TqHandle, key: EventKey) -> Result<TqItem<D>, QueueError>;

    /// Drain every live entry into `out`, in no particular order.
    /// Returns the number drained.
    fn remove_all(&mut self, out: &mut Vec<TqItem<D>>) -> usize;

    /// Atomically drain entries with deadline ≤ `now`, up to `max`, in
    /// ascending deadline order, and report what remains.
    fn pop_due(&mut self, now: TimePoint, max: usize, out: &mut Vec<TqItem<D>>) -> PopOutcome;

    /// Deadline of the earliest live entry, if any.
    fn next_deadline(&mut self) -> Option<TimePoint>;

    /// Number of live entries.
    fn len(&self) -> usize;

    /// True if no entries are live.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Heap node. Min-ordered by deadline, tie-broken by insertion sequence
/// for deterministic pop order of equal deadlines.
struct HeapEntry {
    deadline: TimePoint,
    seq: u64,
    handle: TqHandle,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct Live<D> {
    deadline: TimePoint,
    key: EventKey,
    /// Bumped on every update; heap nodes carrying an older sequence are
    /// superseded and discarded when they surface.
    seq: u64,
    data: D,
}

struct Slot<D> {
    generation: u32,
    live: Option<Live<D>>,
}

/// Binary-heap [`TimeQueue`] implementation with slab-backed handles.
pub struct HeapTimeQueue<D> {
    slots: Vec<Slot<D>>,
    free: Vec<u32>,
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    len: usize,
    capacity: Option<usize>,
}

impl<D> HeapTimeQueue<D> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity_hint(64)
    }

    /// Create an unbounded queue, pre-sizing internal storage.
    pub fn with_capacity_hint(hint: usize) -> Self {
        Self {
            slots: Vec::with_capacity(hint),
            free: Vec::new(),
            heap: BinaryHeap::with_capacity(hint),
            next_seq: 0,
            len: 0,
            capacity: None,
        }
    }

    /// Create a queue that refuses entries beyond `limit` live entries.
    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            capacity: Some(limit),
            ..Self::with_capacity_hint(limit.min(4096))
        }
    }

    fn live_ref(&self, handle: TqHandle) -> Option<&Live<D>> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.live.as_ref()
    }

    fn live_mut(&mut self, handle: TqHandle, key: EventKey) -> Option<&mut Live<D>> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        match slot.live.as_mut() {
            Some(live) if live.key == key => Some(live),
            _ => None,
        }
    }

    /// Free a slot, bumping its generation so outstanding handles go stale.
    fn free_slot(&mut self, index: u32) -> Live<D> {
        let slot = &mut self.slots[index as usize];
        let live = slot.live.take().expect("freeing a dead slot");
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        live
    }

    /// True if the heap node still names the current incarnation of a
    /// live entry.
    fn is_current(&self, entry: &HeapEntry) -> bool {
        matches!(self.live_ref(entry.handle), Some(live) if live.seq == entry.seq)
    }

    /// Discard superseded/dead nodes from the heap top, then peek.
    fn prune_top(&mut self) -> Option<&HeapEntry> {
        while let Some(top) = self.heap.peek() {
            if self.is_current(top) {
                break;
            }
            self.heap.pop();
        }
        self.heap.peek()
    }

    fn alloc_slot(&mut self) -> Result<u32, QueueError> {
        if let Some(cap) = self.capacity {
            if self.len >= cap {
                return Err(QueueError::Full);
            }
        }
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        if self.slots.len() > u32::MAX as usize {
            return Err(QueueError::Full);
        }
        self.slots.push(Slot {
            generation: 0,
            live: None,
        });
        Ok((self.slots.len() - 1) as u32)
    }
}

impl<D> Default for HeapTimeQueue<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> TimeQueue<D> for HeapTimeQueue<D> {
    fn add(&mut self, time: TimePoint, key: EventKey, data: D) -> Result<TqHandle, QueueError> {
        let index = self.alloc_slot()?;
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = &mut self.slots[index as usize];
        slot.live = Some(Live {
            deadline: time,
            key,
            seq,
            data,
        });
        let handle = TqHandle::pack(index, slot.generation);
        self.heap.push(HeapEntry {
            deadline: time,
            seq,
            handle,
        });
        self.len += 1;
        Ok(handle)
    }

    fn update(
        &mut self,
        handle: TqHandle,
        key: EventKey,
        new_time: TimePoint,
    ) -> Result<(), QueueError> {
        let seq = self.next_seq;
        let live = self.live_mut(handle, key).ok_or(QueueError::Stale)?;
        live.deadline = new_time;
        live.seq = seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            deadline: new_time,
            seq,
            handle,
        });
        Ok(())
    }

    fn remove(&mut self, handle: TqHandle, key: EventKey) -> Result<TqItem<D>, QueueError> {
        if self.live_mut(handle, key).is_none() {
            return Err(QueueError::Stale);
        }
        let live = self.free_slot(handle.index());
        Ok(TqItem {
            time: live.deadline,
            handle,
            key: live.key,
            data: live.data,
        })
    }

    fn remove_all(&mut self, out: &mut Vec<TqItem<D>>) -> usize {
        let mut drained = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].live.is_none() {
                continue;
            }
            let generation = self.slots[index].generation;
            let live = self.free_slot(index as u32);
            out.push(TqItem {
                time: live.deadline,
                handle: TqHandle::pack(index as u32, generation),
                key: live.key,
                data: live.data,
            });
            drained += 1;
        }
        self.heap.clear();
        drained
    }

    fn pop_due(&mut self, now: TimePoint, max: usize, out: &mut Vec<TqItem<D>>) -> PopOutcome {
        let mut popped = 0;
        while popped < max {
            let Some(top) = self.prune_top() else { break };
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry vanished");
            let live = self.free_slot(entry.handle.index());
            out.push(TqItem {
                time: entry.deadline,
                handle: entry.handle,
                key: live.key,
                data: live.data,
            });
            popped += 1;
        }
        let next_deadline = self.prune_top().map(|e| e.deadline);
        PopOutcome {
            remaining: self.len,
            next_deadline,
        }
    }

    fn next_deadline(&mut self) -> Option<TimePoint> {
        self.prune_top().map(|e| e.deadline)
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tp(ms: u64) -> TimePoint {
        TimePoint::from_epoch(Duration::from_millis(ms))
    }

    fn drain_all(q: &mut HeapTimeQueue<u32>, now: TimePoint) -> Vec<u32> {
        let mut out = Vec::new();
        q.pop_due(now, usize::MAX, &mut out);
        out.into_iter().map(|i| i.data).collect()
    }

    #[test]
    fn test_add_and_pop_ordering() {
        let mut q = HeapTimeQueue::new();

        // Insert in reverse order
        q.add(tp(30), EventKey::NONE, 3u32).unwrap();
        q.add(tp(10), EventKey::NONE, 1u32).unwrap();
        q.add(tp(20), EventKey::NONE, 2u32).unwrap();

        assert_eq!(drain_all(&mut q, tp(50)), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_equal_deadlines_pop_in_insertion_order() {
        let mut q = HeapTimeQueue::new();
        for i in 0..5u32 {
            q.add(tp(10), EventKey::NONE, i).unwrap();
        }
        assert_eq!(drain_all(&mut q, tp(10)), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_pop_due_respects_now_and_max() {
        let mut q = HeapTimeQueue::new();
        q.add(tp(10), EventKey::NONE, 1u32).unwrap();
        q.add(tp(20), EventKey::NONE, 2u32).unwrap();
        q.add(tp(30), EventKey::NONE, 3u32).unwrap();

        let mut out = Vec::new();
        let outcome = q.pop_due(tp(20), 1, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, 1);
        assert_eq!(outcome.remaining, 2);
        // Entry 2 is due but was beyond the batch bound
        assert_eq!(outcome.next_deadline, Some(tp(20)));

        let mut out = Vec::new();
        let outcome = q.pop_due(tp(20), 16, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, 2);
        assert_eq!(outcome.remaining, 1);
        assert_eq!(outcome.next_deadline, Some(tp(30)));
    }

    #[test]
    fn test_remove() {
        let mut q = HeapTimeQueue::new();
        let h = q.add(tp(10), EventKey(7), 1u32).unwrap();

        let item = q.remove(h, EventKey(7)).unwrap();
        assert_eq!(item.data, 1);
        assert_eq!(item.time, tp(10));
        assert!(q.is_empty());

        // Second removal is stale
        assert!(matches!(q.remove(h, EventKey(7)), Err(QueueError::Stale)));
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let mut q = HeapTimeQueue::new();
        let h = q.add(tp(10), EventKey(1), 1u32).unwrap();

        assert!(q.remove(h, EventKey(2)).is_err());
        assert!(q.update(h, EventKey(2), tp(99)).is_err());

        // Entry untouched
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_deadline(), Some(tp(10)));
    }

    #[test]
    fn test_recycled_slot_stales_old_handle() {
        let mut q = HeapTimeQueue::new();
        let h1 = q.add(tp(10), EventKey::NONE, 1u32).unwrap();
        q.remove(h1, EventKey::NONE).unwrap();

        // Reuses the slot with a bumped generation
        let h2 = q.add(tp(20), EventKey::NONE, 2u32).unwrap();
        assert_ne!(h1, h2);
        assert!(q.remove(h1, EventKey::NONE).is_err());
        assert_eq!(q.remove(h2, EventKey::NONE).unwrap().data, 2);
    }

    #[test]
    fn test_update_moves_deadline() {
        let mut q = HeapTimeQueue::new();
        let h1 = q.add(tp(10), EventKey::NONE, 1u32).unwrap();
        q.add(tp(20), EventKey::NONE, 2u32).unwrap();

        // Push entry 1 past entry 2
        q.update(h1, EventKey::NONE, tp(30)).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.next_deadline(), Some(tp(20)));
        assert_eq!(drain_all(&mut q, tp(50)), vec![2, 1]);
    }

    #[test]
    fn test_update_earlier_deadline() {
        let mut q = HeapTimeQueue::new();
        q.add(tp(10), EventKey::NONE, 1u32).unwrap();
        let h2 = q.add(tp(20), EventKey::NONE, 2u32).unwrap();

        q.update(h2, EventKey::NONE, tp(5)).unwrap();
        assert_eq!(q.next_deadline(), Some(tp(5)));
        assert_eq!(drain_all(&mut q, tp(50)), vec![2, 1]);
    }

    #[test]
    fn test_remove_all() {
        let mut q = HeapTimeQueue::new();
        for i in 0..10u32 {
            q.add(tp(10 + u64::from(i)), EventKey::NONE, i).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(q.remove_all(&mut out), 10);
        assert_eq!(out.len(), 10);
        assert!(q.is_empty());
        assert_eq!(q.next_deadline(), None);

        // Queue is reusable afterwards
        q.add(tp(1), EventKey::NONE, 99).unwrap();
        assert_eq!(drain_all(&mut q, tp(1)), vec![99]);
    }

    #[test]
    fn test_capacity_limit() {
        let mut q = HeapTimeQueue::with_capacity_limit(2);
        let h = q.add(tp(1), EventKey::NONE, 1u32).unwrap();
        q.add(tp(2), EventKey::NONE, 2u32).unwrap();
        assert_eq!(q.add(tp(3), EventKey::NONE, 3u32), Err(QueueError::Full));

        // Removing frees capacity
        q.remove(h, EventKey::NONE).unwrap();
        assert!(q.add(tp(3), EventKey::NONE, 3u32).is_ok());
    }

    #[test]
    fn test_pop_skips_removed_entries() {
        let mut q = HeapTimeQueue::new();
        q.add(tp(10), EventKey::NONE, 1u32).unwrap();
        let h2 = q.add(tp(20), EventKey::NONE, 2u32).unwrap();
        q.add(tp(30), EventKey::NONE, 3u32).unwrap();
        q.remove(h2, EventKey::NONE).unwrap();

        assert_eq!(drain_all(&mut q, tp(50)), vec![1, 3]);
    }

    #[test]
    fn test_past_deadline_pops_immediately() {
        let mut q = HeapTimeQueue::new();
        q.add(tp(0), EventKey::NONE, 1u32).unwrap();
        assert_eq!(drain_all(&mut q, tp(0)), vec![1]);
    }
}
