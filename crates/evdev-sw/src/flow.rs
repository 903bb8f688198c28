//! Atomic Flow Table
//!
//! Pins every flow of an atomic queue to at most one port while any of its
//! events are in flight.
//!
//! # Design
//!
//! - Direct-mapped array, no probing and no resizing
//! - Size rounded up to a power of two, indexed by `hash(flow_id) & mask`
//! - Distinct flow ids that land on the same slot share the pin, so they are
//!   serialized onto one port. That is coarser than necessary but never wrong.

use evdev_common::{EventDevError, EventDevResult};

use crate::FLOWS_MAX;

/// Per-slot pin state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowEntry {
    /// Port currently holding the flow, `None` when unpinned
    pub pinned_port: Option<u8>,
    /// Events of this slot dispatched but not yet completed
    pub pending: u32,
}

/// Direct-mapped flow → port table
#[derive(Debug, Clone)]
pub struct FlowTable {
    entries: Box<[FlowEntry]>,
    mask: u32,
    pinned: usize,
}

impl FlowTable {
    /// Create a table with room for `nb_flows` slots (rounded up to a power of two)
    pub fn new(nb_flows: u32) -> Self {
        let size = nb_flows.clamp(1, FLOWS_MAX).next_power_of_two();
        Self {
            entries: vec![FlowEntry::default(); size as usize].into_boxed_slice(),
            mask: size - 1,
            pinned: 0,
        }
    }

    /// Number of slots
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Slot for a flow id
    #[inline(always)]
    pub fn slot(&self, flow_id: u32) -> u32 {
        (flow_id ^ (flow_id >> 10)) & self.mask
    }

    /// Slot state
    #[inline(always)]
    pub fn entry(&self, slot: u32) -> FlowEntry {
        self.entries[slot as usize]
    }

    /// Port a slot is pinned to
    #[inline(always)]
    pub fn pinned_port(&self, slot: u32) -> Option<u8> {
        self.entries[slot as usize].pinned_port
    }

    /// Number of slots currently pinned
    #[inline]
    pub fn pinned_count(&self) -> usize {
        self.pinned
    }

    /// Record one event of `slot` dispatched to `port`, pinning the slot if needed
    #[inline]
    pub fn dispatch(&mut self, slot: u32, port: u8) -> EventDevResult<()> {
        let entry = &mut self.entries[slot as usize];
        match entry.pinned_port {
            None => {
                entry.pinned_port = Some(port);
                entry.pending = 1;
                self.pinned += 1;
                Ok(())
            }
            Some(p) if p == port => {
                entry.pending += 1;
                Ok(())
            }
            Some(p) => Err(EventDevError::Invariant(format!(
                "flow slot {slot} pinned to port {p}, dispatched to port {port}"
            ))),
        }
    }

    /// Record completion of one event of `slot` on `port`.
    ///
    /// Returns true when this was the last pending event and the slot is now unpinned.
    #[inline]
    pub fn complete(&mut self, slot: u32, port: u8) -> EventDevResult<bool> {
        let entry = &mut self.entries[slot as usize];
        match entry.pinned_port {
            Some(p) if p == port && entry.pending > 0 => {
                entry.pending -= 1;
                if entry.pending == 0 {
                    entry.pinned_port = None;
                    self.pinned -= 1;
                    return Ok(true);
                }
                Ok(false)
            }
            other => Err(EventDevError::Invariant(format!(
                "completion for flow slot {slot} on port {port}, slot state {other:?}/{}",
                entry.pending
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_table_sizing() {
        assert_eq!(FlowTable::new(1000).capacity(), 1024);
        assert_eq!(FlowTable::new(0).capacity(), 1);
        assert_eq!(FlowTable::new(u32::MAX).capacity(), FLOWS_MAX as usize);
    }

    #[test]
    fn test_pin_and_release() {
        let mut table = FlowTable::new(16);
        let slot = table.slot(5);
        assert_eq!(table.pinned_port(slot), None);

        table.dispatch(slot, 2).unwrap();
        table.dispatch(slot, 2).unwrap();
        assert_eq!(table.entry(slot), FlowEntry { pinned_port: Some(2), pending: 2 });
        assert_eq!(table.pinned_count(), 1);

        assert!(!table.complete(slot, 2).unwrap());
        assert!(table.complete(slot, 2).unwrap());
        assert_eq!(table.pinned_port(slot), None);
        assert_eq!(table.pinned_count(), 0);

        // Unpinned slot can move to another port
        table.dispatch(slot, 3).unwrap();
        assert_eq!(table.pinned_port(slot), Some(3));
    }

    #[test]
    fn test_double_pin_is_invariant_violation() {
        let mut table = FlowTable::new(16);
        let slot = table.slot(1);
        table.dispatch(slot, 0).unwrap();
        assert!(matches!(table.dispatch(slot, 1), Err(EventDevError::Invariant(_))));
        // State unchanged by the rejected dispatch
        assert_eq!(table.entry(slot), FlowEntry { pinned_port: Some(0), pending: 1 });
    }

    #[test]
    fn test_spurious_completion_rejected() {
        let mut table = FlowTable::new(16);
        let slot = table.slot(9);
        assert!(table.complete(slot, 0).is_err());

        table.dispatch(slot, 0).unwrap();
        assert!(table.complete(slot, 1).is_err());
    }

    #[test]
    fn test_colliding_flows_share_pin() {
        let mut table = FlowTable::new(4);
        // 1 and 5 alias in a 4-slot table
        let a = table.slot(1);
        let b = table.slot(5);
        assert_eq!(a, b);

        table.dispatch(a, 0).unwrap();
        assert_eq!(table.pinned_port(b), Some(0));
        assert!(table.dispatch(b, 1).is_err());
        table.dispatch(b, 0).unwrap();
        assert_eq!(table.entry(a).pending, 2);
    }

    #[test]
    fn test_hash_folds_high_bits() {
        let table = FlowTable::new(1024);
        assert_ne!(table.slot(0), table.slot(1 << 10));
        assert_eq!(table.slot(3), 3);
    }
}
