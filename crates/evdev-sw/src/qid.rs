//! Queues (QIDs)
//!
//! A queue owns one internal queue per priority band, plus the ordering state
//! its scheduling type needs: a flow table for atomic queues and a reorder
//! buffer for ordered ones.

use evdev_common::{Event, SchedType};

use crate::config::QueueConf;
use crate::flow::FlowTable;
use crate::iq::InternalQueue;
use crate::reorder::ReorderBuffer;
use crate::{IQS_MAX, PORTS_MAX};

/// Internal queue index for an event priority (0 is the highest band)
#[inline(always)]
pub fn iq_index(priority: u8) -> usize {
    (priority >> 6) as usize
}

/// Scheduler-owned queue counters
#[derive(Debug, Clone, Default)]
pub struct QidStats {
    /// Events accepted into the internal queues
    pub rx_pkts: u64,
    /// Events dispatched to ports
    pub tx_pkts: u64,
    /// Events dispatched, per port
    pub to_port: Vec<u64>,
}

/// One event queue
#[derive(Debug)]
pub struct Qid {
    /// Queue id
    pub id: u8,
    /// Setup parameters
    pub conf: QueueConf,
    /// Scheduling type actually applied
    pub sched_type: SchedType,
    /// One internal queue per priority band
    pub iqs: [InternalQueue<Event>; IQS_MAX],
    /// Bit `n` set when `iqs[n]` is non-empty
    pub iq_pkt_mask: u8,
    /// Atomic queues only
    pub flows: Option<FlowTable>,
    /// Ordered queues only
    pub rob: Option<ReorderBuffer>,
    /// Linked ports, in link order
    pub cq_map: Vec<u8>,
    /// Round-robin cursor into `cq_map`
    pub cq_next: usize,
    /// Counters
    pub stats: QidStats,
}

impl Qid {
    /// Build a queue from validated configuration
    pub fn new(id: u8, conf: QueueConf, iq_depth: u32) -> Self {
        let sched_type = conf.effective_type();
        let flows = (sched_type == SchedType::Atomic).then(|| FlowTable::new(conf.nb_atomic_flows));
        let rob = (sched_type == SchedType::Ordered)
            .then(|| ReorderBuffer::new(conf.nb_atomic_order_sequences));
        Self {
            id,
            conf,
            sched_type,
            iqs: std::array::from_fn(|_| InternalQueue::new(iq_depth as usize)),
            iq_pkt_mask: 0,
            flows,
            rob,
            cq_map: Vec::with_capacity(PORTS_MAX),
            cq_next: 0,
            stats: QidStats {
                to_port: vec![0; PORTS_MAX],
                ..Default::default()
            },
        }
    }

    /// Queue priority
    #[inline]
    pub fn priority(&self) -> u8 {
        self.conf.priority
    }

    /// Append an event to its priority band. Returns false when that band is full.
    #[inline]
    pub fn enqueue(&mut self, ev: Event) -> bool {
        let idx = iq_index(ev.priority);
        if !self.iqs[idx].enqueue(ev) {
            return false;
        }
        self.iq_pkt_mask |= 1 << idx;
        self.stats.rx_pkts += 1;
        true
    }

    /// Refresh the occupancy bit of one band
    #[inline]
    pub fn update_mask(&mut self, idx: usize) {
        if self.iqs[idx].is_empty() {
            self.iq_pkt_mask &= !(1 << idx);
        } else {
            self.iq_pkt_mask |= 1 << idx;
        }
    }

    /// Events waiting in all bands
    pub fn iq_len(&self) -> usize {
        self.iqs.iter().map(InternalQueue::len).sum()
    }

    /// Whether `port` is linked
    #[inline]
    pub fn is_linked(&self, port: u8) -> bool {
        self.cq_map.contains(&port)
    }

    /// Add a port to the link map; no-op when already linked
    pub fn link(&mut self, port: u8) {
        if !self.is_linked(port) {
            self.cq_map.push(port);
        }
    }

    /// Remove a port from the link map, returns whether it was linked
    pub fn unlink(&mut self, port: u8) -> bool {
        let Some(pos) = self.cq_map.iter().position(|&p| p == port) else {
            return false;
        };
        self.cq_map.remove(pos);
        if pos < self.cq_next {
            self.cq_next -= 1;
        }
        if self.cq_next >= self.cq_map.len() {
            self.cq_next = 0;
        }
        true
    }

    /// Whether the queue holds any state that would be lost on release
    pub fn is_busy(&self) -> bool {
        self.iq_pkt_mask != 0
            || self.flows.as_ref().is_some_and(|f| f.pinned_count() > 0)
            || self.rob.as_ref().is_some_and(|r| r.in_use() > 0)
    }
}
