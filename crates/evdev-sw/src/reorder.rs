//! Reorder Buffer
//!
//! Restores dispatch order for ordered queues. Every event dispatched from an
//! ordered queue takes a slot; whatever the worker produces for it (zero or
//! more fragments) is parked in that slot until every older slot has been
//! flushed.
//!
//! ```text
//!             reorder_index
//!                  │
//!   ┌───────┬──────▼─┬────────┬────────┬────────┐
//!   │ Empty │Filling │ Ready  │Filling │ Empty  │ ...
//!   └───────┴────────┴────────┴────────┴────────┘
//!                 blocks ──► nothing flushes until the head is Ready
//! ```
//!
//! Slot lifecycle: `Empty → Filling → Ready → flushed (back to Empty, index
//! returned to the freelist)`.

use evdev_common::{Event, EventDevError, EventDevResult};

use crate::iq::InternalQueue;
use crate::{FRAGMENTS_MAX, REORDER_WINDOW_MAX};

/// Slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// On the freelist
    #[default]
    Empty,
    /// Allocated to a dispatched event, collecting fragments
    Filling,
    /// Group complete, waiting for older slots
    Ready,
}

#[derive(Debug, Clone, Default)]
struct RobSlot {
    state: SlotState,
    fragments: Vec<Event>,
    /// First fragment not yet flushed
    fragment_index: usize,
}

/// Per-queue reorder window
#[derive(Debug, Clone)]
pub struct ReorderBuffer {
    slots: Box<[RobSlot]>,
    freelist: InternalQueue<u16>,
    /// Oldest unresolved slot
    reorder_index: usize,
    mask: usize,
}

impl ReorderBuffer {
    /// Create a window of `window` slots (rounded up to a power of two)
    pub fn new(window: u32) -> Self {
        let size = window.clamp(1, REORDER_WINDOW_MAX).next_power_of_two() as usize;
        let mut freelist = InternalQueue::new(size);
        for i in 0..size {
            freelist.enqueue(i as u16);
        }
        Self {
            slots: vec![RobSlot::default(); size].into_boxed_slice(),
            freelist,
            reorder_index: 0,
            mask: size - 1,
        }
    }

    /// Window size
    #[inline]
    pub fn window_size(&self) -> usize {
        self.slots.len()
    }

    /// Slots available for new groups
    #[inline]
    pub fn available(&self) -> usize {
        self.freelist.len()
    }

    /// Slots allocated and not yet flushed
    #[inline]
    pub fn in_use(&self) -> usize {
        self.window_size() - self.available()
    }

    /// Index of the oldest unresolved slot
    #[inline]
    pub fn reorder_index(&self) -> usize {
        self.reorder_index
    }

    /// State of a slot
    #[inline]
    pub fn state(&self, slot: u16) -> SlotState {
        self.slots[slot as usize].state
    }

    /// Take a slot for a newly dispatched event. `Ok(None)` when the window is full.
    pub fn allocate(&mut self) -> EventDevResult<Option<u16>> {
        let Some(idx) = self.freelist.dequeue() else {
            return Ok(None);
        };
        let slot = &mut self.slots[idx as usize];
        if slot.state != SlotState::Empty {
            return Err(EventDevError::Invariant(format!(
                "reorder slot {idx} reused while {:?}",
                slot.state
            )));
        }
        slot.state = SlotState::Filling;
        slot.fragments.clear();
        slot.fragment_index = 0;
        Ok(Some(idx))
    }

    /// Park one fragment of a group
    pub fn add_fragment(&mut self, slot: u16, ev: Event) -> EventDevResult<()> {
        let entry = self.slot_mut(slot)?;
        if entry.fragments.len() >= FRAGMENTS_MAX {
            return Err(EventDevError::Invariant(format!(
                "reorder slot {slot} exceeds {FRAGMENTS_MAX} fragments"
            )));
        }
        entry.fragments.push(ev);
        Ok(())
    }

    /// Mark a group complete
    pub fn complete(&mut self, slot: u16) -> EventDevResult<()> {
        self.slot_mut(slot)?.state = SlotState::Ready;
        Ok(())
    }

    fn slot_mut(&mut self, slot: u16) -> EventDevResult<&mut RobSlot> {
        let entry = self
            .slots
            .get_mut(slot as usize)
            .ok_or_else(|| EventDevError::Invariant(format!("reorder slot {slot} out of range")))?;
        if entry.state != SlotState::Filling {
            return Err(EventDevError::Invariant(format!(
                "reorder slot {slot} is {:?}, expected Filling",
                entry.state
            )));
        }
        Ok(entry)
    }

    /// Flush ready groups in order.
    ///
    /// `sink` receives each fragment and returns false if it cannot take it
    /// (destination full); flushing then stops at that fragment and resumes on
    /// the next call. Returns the number of fragments flushed.
    pub fn drain_ready<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(&Event) -> bool,
    {
        let mut flushed = 0;
        loop {
            let idx = self.reorder_index;
            let slot = &mut self.slots[idx];
            if slot.state != SlotState::Ready {
                return flushed;
            }

            while slot.fragment_index < slot.fragments.len() {
                if !sink(&slot.fragments[slot.fragment_index]) {
                    return flushed;
                }
                slot.fragment_index += 1;
                flushed += 1;
            }

            slot.state = SlotState::Empty;
            slot.fragments.clear();
            slot.fragment_index = 0;
            self.freelist.enqueue(idx as u16);
            self.reorder_index = (idx + 1) & self.mask;
        }
    }

    /// Fragments parked and not yet flushed downstream
    pub fn parked(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.fragments.len() - s.fragment_index)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(n: u64) -> Event {
        Event::new(1, 0, n)
    }

    fn drain_all(rob: &mut ReorderBuffer) -> Vec<u64> {
        let mut out = Vec::new();
        rob.drain_ready(|e| {
            out.push(e.payload);
            true
        });
        out
    }

    #[test]
    fn test_window_rounding() {
        assert_eq!(ReorderBuffer::new(6).window_size(), 8);
        assert_eq!(ReorderBuffer::new(0).window_size(), 1);
        assert_eq!(ReorderBuffer::new(8).available(), 8);
    }

    #[test]
    fn test_out_of_order_completion_flushes_in_order() {
        let mut rob = ReorderBuffer::new(4);
        let slots: Vec<u16> = (0..4).map(|_| rob.allocate().unwrap().unwrap()).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert_eq!(rob.available(), 0);

        rob.add_fragment(slots[2], ev(2)).unwrap();
        rob.complete(slots[2]).unwrap();
        rob.add_fragment(slots[1], ev(1)).unwrap();
        rob.complete(slots[1]).unwrap();
        assert!(drain_all(&mut rob).is_empty());

        rob.add_fragment(slots[0], ev(0)).unwrap();
        rob.complete(slots[0]).unwrap();
        assert_eq!(drain_all(&mut rob), vec![0, 1, 2]);
        assert_eq!(rob.reorder_index(), 3);
        assert_eq!(rob.available(), 3);

        rob.add_fragment(slots[3], ev(3)).unwrap();
        rob.complete(slots[3]).unwrap();
        assert_eq!(drain_all(&mut rob), vec![3]);
        assert_eq!(rob.reorder_index(), 0);
        assert_eq!(rob.in_use(), 0);
    }

    #[test]
    fn test_window_exhaustion() {
        let mut rob = ReorderBuffer::new(2);
        assert!(rob.allocate().unwrap().is_some());
        assert!(rob.allocate().unwrap().is_some());
        assert_eq!(rob.allocate().unwrap(), None);
    }

    #[test]
    fn test_released_group_keeps_its_place() {
        let mut rob = ReorderBuffer::new(4);
        let a = rob.allocate().unwrap().unwrap();
        let b = rob.allocate().unwrap().unwrap();
        rob.add_fragment(b, ev(10)).unwrap();
        rob.complete(b).unwrap();
        // Released without fragments
        rob.complete(a).unwrap();
        assert_eq!(drain_all(&mut rob), vec![10]);
        assert_eq!(rob.in_use(), 0);
    }

    #[test]
    fn test_fragments_flush_in_group_order() {
        let mut rob = ReorderBuffer::new(4);
        let a = rob.allocate().unwrap().unwrap();
        for n in 0..3 {
            rob.add_fragment(a, ev(n)).unwrap();
        }
        assert!(drain_all(&mut rob).is_empty());
        rob.complete(a).unwrap();
        assert_eq!(drain_all(&mut rob), vec![0, 1, 2]);
    }

    #[test]
    fn test_sink_backpressure_resumes_mid_group() {
        let mut rob = ReorderBuffer::new(4);
        let a = rob.allocate().unwrap().unwrap();
        let b = rob.allocate().unwrap().unwrap();
        for n in 0..3 {
            rob.add_fragment(a, ev(n)).unwrap();
        }
        rob.add_fragment(b, ev(3)).unwrap();
        rob.complete(a).unwrap();
        rob.complete(b).unwrap();

        let mut budget = 2;
        let mut out = Vec::new();
        let n = rob.drain_ready(|e| {
            if budget == 0 {
                return false;
            }
            budget -= 1;
            out.push(e.payload);
            true
        });
        assert_eq!(n, 2);
        assert_eq!(out, vec![0, 1]);
        assert_eq!(rob.state(a), SlotState::Ready);

        assert_eq!(drain_all(&mut rob), vec![2, 3]);
        assert_eq!(rob.state(a), SlotState::Empty);
    }

    #[test]
    fn test_fragment_limit() {
        let mut rob = ReorderBuffer::new(1);
        let a = rob.allocate().unwrap().unwrap();
        for n in 0..FRAGMENTS_MAX as u64 {
            rob.add_fragment(a, ev(n)).unwrap();
        }
        assert!(matches!(rob.add_fragment(a, ev(99)), Err(EventDevError::Invariant(_))));
    }

    #[test]
    fn test_misuse_is_invariant_violation() {
        let mut rob = ReorderBuffer::new(2);
        // Not allocated
        assert!(rob.complete(0).is_err());
        assert!(rob.add_fragment(1, ev(0)).is_err());

        let a = rob.allocate().unwrap().unwrap();
        rob.complete(a).unwrap();
        // Already Ready
        assert!(rob.add_fragment(a, ev(0)).is_err());
        assert!(rob.complete(7).is_err());
    }

    #[test]
    fn test_parked_counts_unflushed_fragments() {
        let mut rob = ReorderBuffer::new(4);
        let a = rob.allocate().unwrap().unwrap();
        let b = rob.allocate().unwrap().unwrap();
        rob.add_fragment(a, ev(0)).unwrap();
        rob.add_fragment(a, ev(1)).unwrap();
        rob.add_fragment(b, ev(2)).unwrap();
        rob.complete(a).unwrap();
        assert_eq!(rob.parked(), 3);

        // Sink takes one fragment, then pushes back
        let mut room = 1;
        rob.drain_ready(|_| {
            room -= 1;
            room >= 0
        });
        assert_eq!(rob.parked(), 2);
        assert_eq!(drain_all(&mut rob), vec![1]);
        assert_eq!(rob.parked(), 1);
    }
}
