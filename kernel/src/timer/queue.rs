//! Delta-encoded timeout queue.
//!
//! Entries are ordered by absolute deadline, but each one stores only
//! `dticks`, its distance from the entry before it (the head's distance is
//! from the tick count at the last reconciliation). Summing `dticks` over
//! any prefix therefore gives that entry's deadline, expiring entries only
//! touches the head, and no stored value ever needs more than the largest
//! single gap.
//!
//! Storage is a fixed arena of slots addressed by index, with `prev`/`next`
//! indices forming the doubly linked order and unallocated slots threaded
//! on a free list. Allocation happens only in [`TimeoutQueue::allocate`];
//! insert, remove and pop never allocate.
//!
//! The queue itself is not synchronized: [`TimerSystem`] keeps it inside
//! its spinlock.
//!
//! [`TimerSystem`]: super::TimerSystem

use alloc::vec::Vec;
use core::fmt;

use super::timeout::{Ticks, TimeoutId};

type Index = u32;

struct Slot<T> {
    generation: u32,
    allocated: bool,
    linked: bool,
    dticks: Ticks,
    prev: Option<Index>,
    /// Queue successor while linked, free-list successor while free.
    next: Option<Index>,
    payload: Option<T>,
}

/// Ordered, delta-encoded set of pending timeouts.
pub struct TimeoutQueue<T> {
    slots: Vec<Slot<T>>,
    free: Option<Index>,
    head: Option<Index>,
    tail: Option<Index>,
    linked: usize,
    allocated: usize,
}

impl<T> TimeoutQueue<T> {
    /// Create a queue with `capacity` slots, all free.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity <= Index::MAX as usize, "timeout capacity too large");

        let slots = (0..capacity)
            .map(|i| Slot {
                generation: 0,
                allocated: false,
                linked: false,
                dticks: 0,
                prev: None,
                next: (i + 1 < capacity).then(|| (i + 1) as Index),
                payload: None,
            })
            .collect();

        Self {
            slots,
            free: (capacity > 0).then_some(0),
            head: None,
            tail: None,
            linked: 0,
            allocated: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of queued (linked) entries.
    pub fn len(&self) -> usize {
        self.linked
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of allocated entries, queued or not.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    // -----------------------------------------------------------------------
    // Entry lifecycle
    // -----------------------------------------------------------------------

    /// Claim a free slot for a new, unlinked entry.
    pub fn allocate(&mut self, payload: T) -> Option<TimeoutId> {
        let index = self.free?;
        let slot = &mut self.slots[index as usize];
        self.free = slot.next.take();
        slot.allocated = true;
        slot.linked = false;
        slot.dticks = 0;
        slot.prev = None;
        slot.payload = Some(payload);
        self.allocated += 1;

        Some(TimeoutId {
            index,
            generation: slot.generation,
        })
    }

    /// Return an entry's slot to the free list, handing back its payload.
    ///
    /// Returns `None` for a stale handle. Releasing a queued entry is a
    /// contract violation and panics.
    pub fn release(&mut self, id: TimeoutId) -> Option<Option<T>> {
        let index = self.index_of(id)?;
        let free = self.free;
        let slot = &mut self.slots[index as usize];
        assert!(!slot.linked, "released {} while still queued", id);

        slot.allocated = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next = free;
        self.free = Some(index);
        self.allocated -= 1;

        Some(slot.payload.take())
    }

    /// Whether `id` names a currently allocated entry.
    pub fn contains(&self, id: TimeoutId) -> bool {
        self.index_of(id).is_some()
    }

    /// Whether `id` is currently queued. Stale handles are never queued.
    pub fn is_linked(&self, id: TimeoutId) -> bool {
        self.index_of(id)
            .is_some_and(|index| self.slots[index as usize].linked)
    }

    /// Mutable access to an entry's payload cell.
    pub fn payload_mut(&mut self, id: TimeoutId) -> Option<&mut Option<T>> {
        let index = self.index_of(id)?;
        Some(&mut self.slots[index as usize].payload)
    }

    /// Stored delta of a queued entry.
    pub fn delta(&self, id: TimeoutId) -> Option<Ticks> {
        let index = self.index_of(id)?;
        let slot = &self.slots[index as usize];
        slot.linked.then_some(slot.dticks)
    }

    fn index_of(&self, id: TimeoutId) -> Option<Index> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.allocated && slot.generation == id.generation).then_some(id.index)
    }

    fn id_at(&self, index: Index) -> TimeoutId {
        TimeoutId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    /// Queue `id` to expire `dticks` ticks after the reconciliation point.
    ///
    /// Walks from the head consuming deltas until it reaches the first
    /// entry that expires strictly later, and links in front of it after
    /// taking the new entry's remaining delta out of that entry's delta.
    /// Entries with equal deadlines therefore keep submission order.
    ///
    /// Panics if `id` is stale or already queued.
    pub fn insert(&mut self, id: TimeoutId, dticks: Ticks) {
        let new = match self.index_of(id) {
            Some(index) => index,
            None => panic!("inserted stale timeout handle {}", id),
        };
        assert!(!self.slots[new as usize].linked, "{} is already queued", id);
        debug_assert!(dticks >= 0);

        let mut remaining = dticks;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.dticks >= 0, "negative delta in queue");
            if slot.dticks > remaining {
                slot.dticks -= remaining;
                break;
            }
            remaining -= slot.dticks;
            cursor = slot.next;
        }

        self.slots[new as usize].dticks = remaining;
        match cursor {
            Some(before) => self.link_before(new, before),
            None => self.link_back(new),
        }
    }

    /// Unlink `id`, folding its delta into its successor so every later
    /// deadline is unchanged. Returns `false` if it was not queued.
    pub fn remove(&mut self, id: TimeoutId) -> bool {
        match self.index_of(id) {
            Some(index) if self.slots[index as usize].linked => {
                self.unlink(index);
                true
            }
            _ => false,
        }
    }

    /// Head of the queue: the earliest deadline.
    pub fn first(&self) -> Option<TimeoutId> {
        self.head.map(|index| self.id_at(index))
    }

    /// Delta of the head entry.
    pub fn first_delta(&self) -> Option<Ticks> {
        self.head.map(|index| self.slots[index as usize].dticks)
    }

    /// Mutable delta of the head entry, for charging partial progress.
    pub fn first_delta_mut(&mut self) -> Option<&mut Ticks> {
        let index = self.head?;
        Some(&mut self.slots[index as usize].dticks)
    }

    /// Unlink the head, returning it with the delta it carried. The
    /// successor keeps its own delta: the head's share has been consumed.
    pub fn pop_first(&mut self) -> Option<(TimeoutId, Ticks)> {
        let index = self.head?;
        let id = self.id_at(index);
        let slot = &mut self.slots[index as usize];
        let dticks = slot.dticks;
        slot.dticks = 0;
        self.unlink(index);
        Some((id, dticks))
    }

    /// Ticks from the reconciliation point to `id`'s deadline, or `None` if
    /// it is not queued.
    pub fn end_offset(&self, id: TimeoutId) -> Option<Ticks> {
        let target = self.index_of(id)?;
        if !self.slots[target as usize].linked {
            return None;
        }

        let mut sum = 0;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &self.slots[index as usize];
            sum += slot.dticks;
            if index == target {
                return Some(sum);
            }
            cursor = slot.next;
        }
        None
    }

    /// Queued entries in expiry order with their stored deltas.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    // -----------------------------------------------------------------------
    // Link maintenance
    // -----------------------------------------------------------------------

    fn link_before(&mut self, new: Index, before: Index) {
        let prev = self.slots[before as usize].prev;
        {
            let slot = &mut self.slots[new as usize];
            slot.prev = prev;
            slot.next = Some(before);
            slot.linked = true;
        }
        self.slots[before as usize].prev = Some(new);
        match prev {
            Some(p) => self.slots[p as usize].next = Some(new),
            None => self.head = Some(new),
        }
        self.linked += 1;
    }

    fn link_back(&mut self, new: Index) {
        let tail = self.tail;
        {
            let slot = &mut self.slots[new as usize];
            slot.prev = tail;
            slot.next = None;
            slot.linked = true;
        }
        match tail {
            Some(t) => self.slots[t as usize].next = Some(new),
            None => self.head = Some(new),
        }
        self.tail = Some(new);
        self.linked += 1;
    }

    fn unlink(&mut self, index: Index) {
        let (prev, next, dticks) = {
            let slot = &mut self.slots[index as usize];
            let links = (slot.prev.take(), slot.next.take(), slot.dticks);
            slot.linked = false;
            links
        };

        match next {
            Some(n) => {
                let successor = &mut self.slots[n as usize];
                successor.dticks += dticks;
                successor.prev = prev;
            }
            None => self.tail = prev,
        }
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        self.linked -= 1;
    }
}

impl<T> fmt::Debug for TimeoutQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over queued entries, head first.
pub struct Iter<'a, T> {
    queue: &'a TimeoutQueue<T>,
    cursor: Option<Index>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = (TimeoutId, Ticks);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.queue.slots[index as usize];
        self.cursor = slot.next;
        Some((self.queue.id_at(index), slot.dticks))
    }
}
