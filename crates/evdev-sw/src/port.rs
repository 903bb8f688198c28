//! Ports
//!
//! A port is split three ways:
//!
//! ```text
//!            worker thread                         scheduler thread
//!   ┌──────────────────────────┐          ┌──────────────────────────────┐
//!   │ PortHandle               │          │ SchedPort                    │
//!   │  outstanding tokens      │          │  history list                │
//!   │  implicit release list   │          │  egress staging (cq_buf)     │
//!   └──────┬───────────▲───────┘          │  ingress shadow (pp_buf)     │
//!          │           │                  └──────▲───────────────┬───────┘
//!          │   ┌───────┴──────────────────────────┴───────────┐  │
//!          │   │ PortShared (Arc)                             │  │
//!          └──►│  rx_ring  ───────────────────────────────────┼──┘
//!              │  cq_ring  ◄──────────────────────────────────┼──── flush
//!              │  local credits, claim flag, worker counters  │
//!              └──────────────────────────────────────────────┘
//! ```
//!
//! Every event dispatched to a port gets a history token, stamped into
//! [`Event::opaque`]. Completions (`Forward`, `Release`) and fragments
//! (`Partial`) name the event they belong to by that token, so a worker may
//! complete its events in any order.

use evdev_common::{Event, EventDevError, EventDevResult, EventOp, Timestamp};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PortConf;
use crate::credit::CreditPool;
use crate::ring::EventRing;
use crate::stats::PortWorkerStats;
use crate::{DEQUEUE_DEPTH_MAX, ENQUEUE_MAX_BURST, FRAGMENTS_MAX, PORT_HIST_LIST};

const HIST_MASK: u32 = PORT_HIST_LIST as u32 - 1;

// ============================================================================
// Shared half
// ============================================================================

/// State shared between a worker handle and the scheduler
#[derive(Debug)]
pub struct PortShared {
    pub(crate) id: u8,
    pub(crate) conf: PortConf,
    /// Worker → scheduler
    pub(crate) rx_ring: EventRing<Event>,
    /// Scheduler → worker
    pub(crate) cq_ring: EventRing<Event>,
    pub(crate) pool: Arc<CreditPool>,
    /// Credits borrowed from the pool and not yet spent. Written only by the
    /// claiming worker, or by the control plane while unclaimed.
    pub(crate) credits: AtomicU32,
    pub(crate) stats: PortWorkerStats,
    nb_queues: u8,
    dequeue_timeout: Duration,
    claimed: AtomicBool,
    /// Worker state parked while no handle is claimed
    parked: Mutex<Option<WorkerState>>,
}

impl PortShared {
    pub(crate) fn new(
        id: u8,
        conf: PortConf,
        pool: Arc<CreditPool>,
        nb_queues: u8,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            id,
            rx_ring: EventRing::new(conf.enqueue_depth as usize),
            cq_ring: EventRing::new(conf.dequeue_depth as usize),
            conf,
            pool,
            credits: AtomicU32::new(0),
            stats: PortWorkerStats::default(),
            nb_queues,
            dequeue_timeout,
            claimed: AtomicBool::new(false),
            parked: Mutex::new(Some(WorkerState::new())),
        }
    }

    /// Whether a worker handle currently owns the port
    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Local credits
    #[inline]
    pub fn credits(&self) -> u32 {
        self.credits.load(Ordering::Acquire)
    }

    /// Hand out the worker handle, failing with `PortBusy` if one is live
    pub(crate) fn claim(self: &Arc<Self>) -> EventDevResult<PortHandle> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EventDevError::PortBusy(self.id));
        }
        let state = self.parked.lock().take().unwrap_or_else(WorkerState::new);
        Ok(PortHandle {
            shared: self.clone(),
            state,
        })
    }

    /// Push to ingress, bounded by the configured depth rather than the
    /// ring's power-of-two capacity. Only the claiming worker pushes, so the
    /// length can only shrink between the check and the push.
    #[inline]
    fn push_ingress(&self, ev: Event) -> bool {
        self.rx_ring.len() < self.conf.enqueue_depth as usize && self.rx_ring.try_push(ev).is_ok()
    }
}

// ============================================================================
// Worker half
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Outstanding {
    token: u32,
    live: bool,
    fragments: u8,
}

/// Per-worker bookkeeping, travels with the handle
#[derive(Debug)]
struct WorkerState {
    /// Dequeued events not yet completed, indexed by `token & HIST_MASK`
    outstanding: Box<[Outstanding]>,
    /// Tokens in dequeue order, released on the next dequeue when implicit
    /// release is on
    held: VecDeque<u32>,
    /// Time and size of the last non-empty dequeue
    last_dequeue: Option<(Timestamp, usize)>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            outstanding: vec![Outstanding::default(); PORT_HIST_LIST].into_boxed_slice(),
            held: VecDeque::new(),
            last_dequeue: None,
        }
    }

    fn empty() -> Self {
        Self {
            outstanding: Box::default(),
            held: VecDeque::new(),
            last_dequeue: None,
        }
    }

    #[inline]
    fn lookup(&mut self, token: u32) -> Option<&mut Outstanding> {
        let entry = self.outstanding.get_mut((token & HIST_MASK) as usize)?;
        (entry.live && entry.token == token).then_some(entry)
    }
}

/// Worker-facing data-plane endpoint of one port.
///
/// At most one handle exists per port. Dropping it parks its bookkeeping so
/// the port can be claimed again later.
#[derive(Debug)]
pub struct PortHandle {
    shared: Arc<PortShared>,
    state: WorkerState,
}

impl PortHandle {
    /// Port id
    #[inline]
    pub fn id(&self) -> u8 {
        self.shared.id
    }

    /// Local credits held by this port
    #[inline]
    pub fn credits(&self) -> u32 {
        self.shared.credits()
    }

    /// Events dequeued and not yet completed
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.iter().filter(|o| o.live).count()
    }

    /// Events waiting in the egress ring
    #[inline]
    pub fn pending_dequeue(&self) -> usize {
        self.shared.cq_ring.len()
    }

    /// Enqueue a burst of events, in order.
    ///
    /// Stops at the first event that cannot be accepted (no credit, device
    /// over the port's new-event threshold, ingress ring full, unknown queue
    /// or token) and returns the number accepted. At most
    /// [`ENQUEUE_MAX_BURST`] events are considered per call.
    pub fn enqueue_burst(&mut self, events: &[Event]) -> usize {
        self.enqueue_with(events, None)
    }

    /// Enqueue a burst of `New` events; the op field of each event is ignored
    pub fn enqueue_new_burst(&mut self, events: &[Event]) -> usize {
        self.enqueue_with(events, Some(EventOp::New))
    }

    /// Enqueue a burst of `Forward` completions; the op field of each event is ignored
    pub fn enqueue_forward_burst(&mut self, events: &[Event]) -> usize {
        self.enqueue_with(events, Some(EventOp::Forward))
    }

    /// Release one dequeued event without forwarding it
    pub fn release(&mut self, ev: &Event) -> bool {
        self.enqueue_with(std::slice::from_ref(ev), Some(EventOp::Release)) == 1
    }

    fn enqueue_with(&mut self, events: &[Event], op: Option<EventOp>) -> usize {
        self.record_latency();

        let burst = &events[..events.len().min(ENQUEUE_MAX_BURST)];
        let mut accepted = 0;
        for ev in burst {
            let mut ev = *ev;
            if let Some(op) = op {
                ev.op = op;
            }
            if !self.submit(ev) {
                break;
            }
            accepted += 1;
        }

        self.return_surplus();
        let stats = &self.shared.stats;
        stats.enqueued.add(accepted as u64);
        if accepted < burst.len() {
            stats.enqueue_refused.add((burst.len() - accepted) as u64);
        }
        accepted
    }

    /// Admit one event: check, push, then commit bookkeeping
    fn submit(&mut self, ev: Event) -> bool {
        let shared = &*self.shared;
        if ev.op.is_valid() && ev.queue_id >= shared.nb_queues {
            return false;
        }

        if ev.op.needs_token() && self.state.lookup(ev.opaque).is_none() {
            return false;
        }

        match ev.op {
            EventOp::New => {
                if shared.pool.inflights() > shared.conf.new_event_threshold
                    || !self.ensure_credit()
                {
                    shared.stats.new_throttled.inc();
                    return false;
                }
                if !shared.push_ingress(ev) {
                    return false;
                }
                shared.credits.fetch_sub(1, Ordering::AcqRel);
            }
            EventOp::Partial => {
                let fragments = self.state.lookup(ev.opaque).map_or(0, |o| o.fragments);
                if fragments as usize >= FRAGMENTS_MAX - 1
                    || !self.ensure_credit()
                    || !self.shared.push_ingress(ev)
                {
                    return false;
                }
                self.shared.credits.fetch_sub(1, Ordering::AcqRel);
                if let Some(o) = self.state.lookup(ev.opaque) {
                    o.fragments += 1;
                }
            }
            EventOp::Forward | EventOp::Release => {
                if !shared.push_ingress(ev) {
                    return false;
                }
                if ev.op == EventOp::Release {
                    shared.credits.fetch_add(1, Ordering::AcqRel);
                }
                if let Some(o) = self.state.lookup(ev.opaque) {
                    o.live = false;
                }
            }
        }
        true
    }

    /// Make sure at least one local credit is available, borrowing a quantum if not
    fn ensure_credit(&self) -> bool {
        let shared = &*self.shared;
        let local = shared.credits.load(Ordering::Acquire);
        if local > 0 {
            return true;
        }
        let granted = shared.pool.acquire(shared.pool.quanta());
        if granted == 0 {
            return false;
        }
        shared.credits.fetch_add(granted, Ordering::AcqRel);
        true
    }

    /// Hand credit back to the pool: a quantum once two are held locally, or
    /// everything held once the pool can no longer grant a full quantum
    fn return_surplus(&self) {
        let shared = &*self.shared;
        let pool = &*shared.pool;
        let quanta = pool.quanta();
        let local = shared.credits.load(Ordering::Acquire);
        let give = if pool.available() < quanta {
            local
        } else if local >= 2 * quanta {
            quanta
        } else {
            0
        };
        if give > 0 {
            shared.credits.fetch_sub(give, Ordering::AcqRel);
            pool.release(give);
        }
    }

    /// Fold the time since the last dequeue into the per-event latency average
    fn record_latency(&mut self) {
        if let Some((at, n)) = self.state.last_dequeue.take() {
            self.shared.stats.record_latency(at.elapsed_nanos(), n);
        }
    }

    /// Send a `Release` for every event from earlier dequeues that the worker
    /// has not completed. Stops, keeping the rest, if the ingress ring fills.
    fn implicit_release(&mut self) {
        let shared = &*self.shared;
        let mut released = 0;
        while let Some(&token) = self.state.held.front() {
            let Some(o) = self.state.lookup(token) else {
                self.state.held.pop_front();
                continue;
            };
            let ev = Event {
                opaque: token,
                op: EventOp::Release,
                ..Event::default()
            };
            if !shared.push_ingress(ev) {
                break;
            }
            o.live = false;
            self.state.held.pop_front();
            released += 1;
        }
        if released > 0 {
            shared.credits.fetch_add(released, Ordering::AcqRel);
            shared.stats.implicit_releases.add(released as u64);
            self.return_surplus();
        }
    }

    fn dequeue_inner(&mut self, out: &mut [Event]) -> usize {
        let max = out.len().min(DEQUEUE_DEPTH_MAX as usize);
        let n = self.shared.cq_ring.dequeue_burst(&mut out[..max]);
        let implicit = self.shared.conf.implicit_release;
        for ev in &out[..n] {
            let token = ev.opaque;
            if let Some(slot) = self.state.outstanding.get_mut((token & HIST_MASK) as usize) {
                *slot = Outstanding {
                    token,
                    live: true,
                    fragments: 0,
                };
            }
            if implicit {
                self.state.held.push_back(token);
            }
        }
        n
    }

    fn finish_poll(&mut self, n: usize) -> usize {
        self.shared.stats.record_poll(n);
        if n > 0 {
            self.state.last_dequeue = Some((Timestamp::now(), n));
        }
        n
    }

    /// Dequeue up to `out.len()` events without waiting.
    ///
    /// With implicit release on, events from earlier dequeues that were not
    /// forwarded or released are released first.
    pub fn dequeue_burst(&mut self, out: &mut [Event]) -> usize {
        if self.shared.conf.implicit_release {
            self.implicit_release();
        }
        let n = self.dequeue_inner(out);
        self.finish_poll(n)
    }

    /// Dequeue, busy-polling for up to `timeout` until at least one event arrives
    pub fn dequeue_burst_timeout(&mut self, out: &mut [Event], timeout: Duration) -> usize {
        if self.shared.conf.implicit_release {
            self.implicit_release();
        }
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.dequeue_inner(out);
            if n > 0 || Instant::now() >= deadline {
                return self.finish_poll(n);
            }
            std::hint::spin_loop();
        }
    }

    /// Dequeue with the device's configured dequeue timeout
    pub fn dequeue_wait(&mut self, out: &mut [Event]) -> usize {
        let timeout = self.shared.dequeue_timeout;
        self.dequeue_burst_timeout(out, timeout)
    }
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        let state = std::mem::replace(&mut self.state, WorkerState::empty());
        *self.shared.parked.lock() = Some(state);
        self.shared.claimed.store(false, Ordering::Release);
    }
}

// ============================================================================
// Scheduler half
// ============================================================================

/// History of one dispatched event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HistEntry {
    pub token: u32,
    pub qid: u8,
    /// Flow table slot, atomic queues
    pub flow_slot: Option<u32>,
    /// Reorder slot, ordered queues
    pub rob_slot: Option<u16>,
    live: bool,
}

/// Dispatched-but-unconfirmed events of one port.
///
/// Tokens are handed out sequentially; the window `[tail, head)` never spans
/// more than `PORT_HIST_LIST` tokens, so `token & mask` addresses a unique
/// entry. Entries retire out of order; the tail only moves past retired ones.
#[derive(Debug)]
pub(crate) struct HistoryList {
    entries: Box<[HistEntry]>,
    head: u32,
    tail: u32,
    live: usize,
}

impl HistoryList {
    pub fn new() -> Self {
        Self {
            entries: vec![HistEntry::default(); PORT_HIST_LIST].into_boxed_slice(),
            head: 0,
            tail: 0,
            live: 0,
        }
    }

    #[inline]
    fn window(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.window() as usize >= PORT_HIST_LIST
    }

    #[inline]
    pub fn free(&self) -> usize {
        PORT_HIST_LIST - self.window() as usize
    }

    /// Events awaiting completion
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.live
    }

    /// Record a dispatch, returns its token
    pub fn push(&mut self, qid: u8, flow_slot: Option<u32>, rob_slot: Option<u16>) -> u32 {
        let token = self.head;
        self.entries[(token & HIST_MASK) as usize] = HistEntry {
            token,
            qid,
            flow_slot,
            rob_slot,
            live: true,
        };
        self.head = self.head.wrapping_add(1);
        self.live += 1;
        token
    }

    /// Entry for a live token
    pub fn get(&self, token: u32) -> Option<HistEntry> {
        if token.wrapping_sub(self.tail) >= self.window() {
            return None;
        }
        let entry = self.entries[(token & HIST_MASK) as usize];
        (entry.live && entry.token == token).then_some(entry)
    }

    /// Retire a live token, returns its entry
    pub fn retire(&mut self, token: u32) -> Option<HistEntry> {
        let entry = self.get(token)?;
        self.entries[(token & HIST_MASK) as usize].live = false;
        self.live -= 1;
        while self.tail != self.head && !self.entries[(self.tail & HIST_MASK) as usize].live {
            self.tail = self.tail.wrapping_add(1);
        }
        Some(entry)
    }

    /// Retire everything, returning the live entries oldest first
    pub fn drain(&mut self) -> Vec<HistEntry> {
        let mut live = Vec::with_capacity(self.live);
        let mut pos = self.tail;
        while pos != self.head {
            let entry = self.entries[(pos & HIST_MASK) as usize];
            if entry.live {
                live.push(entry);
            }
            pos = pos.wrapping_add(1);
        }
        self.entries.fill(HistEntry::default());
        self.tail = self.head;
        self.live = 0;
        live
    }
}

/// Scheduler-owned port counters
#[derive(Debug, Clone, Default)]
pub struct SchedPortStats {
    /// Events pulled from the ingress ring and applied
    pub rx_pkts: u64,
    /// Events dispatched to this port
    pub tx_pkts: u64,
    /// Forward and release completions applied
    pub completions: u64,
    /// Events discarded at teardown or addressed to a released queue
    pub discarded: u64,
}

/// Scheduler-side state of a port
#[derive(Debug)]
pub(crate) struct SchedPort {
    pub shared: Arc<PortShared>,
    pub hist: HistoryList,
    /// Events staged for the egress ring
    pub cq_buf: Vec<Event>,
    /// Egress slots still free after staging
    pub cq_ring_space: usize,
    /// Events pulled from the ingress ring, not yet applied
    pub pp_buf: VecDeque<Event>,
    /// Linked queues with their link priority
    pub links: Vec<(u8, u8)>,
    pub is_directed: bool,
    pub num_ordered_qids: u32,
    pub unlinks_in_progress: u32,
    pub stats: SchedPortStats,
}

impl SchedPort {
    pub fn new(shared: Arc<PortShared>) -> Self {
        let depth = shared.conf.dequeue_depth as usize;
        Self {
            shared,
            hist: HistoryList::new(),
            cq_buf: Vec::with_capacity(depth),
            cq_ring_space: depth,
            pp_buf: VecDeque::new(),
            links: Vec::new(),
            is_directed: false,
            num_ordered_qids: 0,
            unlinks_in_progress: 0,
            stats: SchedPortStats::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.shared.id
    }

    /// Events this port can take right now
    #[inline]
    pub fn space(&self) -> usize {
        self.cq_ring_space.min(self.hist.free())
    }

    #[inline]
    pub fn can_accept(&self) -> bool {
        self.cq_ring_space > 0 && !self.hist.is_full()
    }

    /// Stage an event for the egress ring
    #[inline]
    pub fn stage(&mut self, ev: Event) {
        self.cq_buf.push(ev);
        self.cq_ring_space = self.cq_ring_space.saturating_sub(1);
        self.stats.tx_pkts += 1;
    }

    /// Recompute egress space from the ring and the staging buffer
    pub fn refresh_space(&mut self) {
        let depth = self.shared.conf.dequeue_depth as usize;
        self.cq_ring_space = depth
            .saturating_sub(self.shared.cq_ring.len())
            .saturating_sub(self.cq_buf.len());
    }

    /// Push staged events to the egress ring once `min_burst` are waiting
    pub fn flush(&mut self, min_burst: usize) -> usize {
        let mut pushed = 0;
        if !self.cq_buf.is_empty() && self.cq_buf.len() >= min_burst {
            pushed = self.shared.cq_ring.enqueue_burst(&self.cq_buf);
            self.cq_buf.drain(..pushed);
        }
        self.refresh_space();
        pushed
    }

    /// Linked queue ids
    pub fn linked_qids(&self) -> impl Iterator<Item = u8> + '_ {
        self.links.iter().map(|&(q, _)| q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(conf: PortConf, limit: u32, quanta: u32) -> Arc<PortShared> {
        Arc::new(PortShared::new(
            0,
            conf,
            Arc::new(CreditPool::new(limit, quanta)),
            4,
            Duration::from_millis(1),
        ))
    }

    /// Move everything from ingress to egress, stamping tokens like the scheduler
    fn loopback(port: &mut SchedPort) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Some(mut ev) = port.shared.rx_ring.try_pop() {
            seen.push(ev);
            if ev.op == EventOp::New {
                ev.opaque = port.hist.push(ev.queue_id, None, None);
                port.stage(ev);
            }
        }
        port.flush(1);
        seen
    }

    #[test]
    fn test_claim_is_exclusive() {
        let sh = shared(PortConf::default(), 64, 8);
        let handle = sh.claim().unwrap();
        assert!(sh.is_claimed());
        assert_eq!(sh.claim().unwrap_err(), EventDevError::PortBusy(0));
        drop(handle);
        assert!(!sh.is_claimed());
        assert!(sh.claim().is_ok());
    }

    #[test]
    fn test_new_events_borrow_credit_quanta() {
        let sh = shared(PortConf::default(), 64, 8);
        let mut h = sh.claim().unwrap();
        let evs = [Event::new(0, 1, 1); 3];
        assert_eq!(h.enqueue_burst(&evs), 3);
        assert_eq!(sh.pool.inflights(), 8);
        assert_eq!(h.credits(), 5);
        assert_eq!(sh.rx_ring.len(), 3);
    }

    #[test]
    fn test_limit_below_quanta() {
        let conf = PortConf { new_event_threshold: 4, ..Default::default() };
        let sh = shared(conf, 4, 32);
        let mut h = sh.claim().unwrap();
        assert_eq!(h.enqueue_new_burst(&[Event::new(0, 0, 0); 10]), 4);
        assert_eq!(sh.pool.inflights(), 4);
        assert_eq!(h.credits(), 0);
        assert_eq!(sh.stats.new_throttled.get(), 1);
    }

    #[test]
    fn test_unknown_queue_and_token_rejected() {
        let sh = shared(PortConf::default(), 64, 8);
        let mut h = sh.claim().unwrap();
        assert_eq!(h.enqueue_burst(&[Event::new(4, 0, 0)]), 0);
        // Never dequeued
        assert_eq!(h.enqueue_burst(&[Event::new(0, 0, 0).forward(1)]), 0);
        assert!(!h.release(&Event::new(0, 0, 0)));
        assert!(sh.rx_ring.is_empty());
    }

    #[test]
    fn test_burst_stops_at_full_ring() {
        let conf = PortConf { enqueue_depth: 4, ..Default::default() };
        let sh = shared(conf, 64, 8);
        let mut h = sh.claim().unwrap();
        assert_eq!(h.enqueue_burst(&[Event::new(0, 0, 0); 6]), 4);
        // Credit for the refused event stays local
        assert_eq!(h.credits(), 4);
        assert_eq!(sh.pool.inflights(), 8);
    }

    #[test]
    fn test_ingress_honours_configured_depth() {
        let conf = PortConf { enqueue_depth: 100, ..Default::default() };
        let sh = shared(conf, 4096, 32);
        let mut h = sh.claim().unwrap();
        let evs = [Event::new(0, 0, 0); ENQUEUE_MAX_BURST];
        assert_eq!(h.enqueue_burst(&evs), ENQUEUE_MAX_BURST);
        assert_eq!(h.enqueue_burst(&evs), 100 - ENQUEUE_MAX_BURST);
        assert_eq!(h.enqueue_burst(&evs), 0);
        assert_eq!(sh.rx_ring.len(), 100);
    }

    #[test]
    fn test_released_credit_returns_when_pool_is_dry() {
        let sh = shared(PortConf { implicit_release: false, ..Default::default() }, 8, 32);
        let mut sp = SchedPort::new(sh.clone());
        let mut h = sh.claim().unwrap();
        assert_eq!(h.enqueue_burst(&[Event::new(0, 0, 0); 8]), 8);
        assert_eq!(sh.pool.available(), 0);
        loopback(&mut sp);

        let mut out = [Event::default(); 8];
        assert_eq!(h.dequeue_burst(&mut out), 8);
        assert!(h.release(&out[0]));
        // Below one quantum in the pool: nothing is kept locally
        assert_eq!(h.credits(), 0);
        assert_eq!(sh.pool.available(), 1);
        for ev in &out[1..] {
            assert!(h.release(ev));
        }
        assert_eq!(sh.pool.available(), 8);
        assert_eq!(sh.pool.inflights(), 0);
    }

    #[test]
    fn test_completion_by_token() {
        let sh = shared(PortConf { implicit_release: false, ..Default::default() }, 64, 8);
        let mut sp = SchedPort::new(sh.clone());
        let mut h = sh.claim().unwrap();

        h.enqueue_burst(&[Event::new(0, 0, 10), Event::new(0, 0, 11)]);
        loopback(&mut sp);
        let mut out = [Event::default(); 4];
        assert_eq!(h.dequeue_burst(&mut out), 2);
        assert_eq!(h.outstanding(), 2);

        // Complete the second one first
        assert_eq!(h.enqueue_forward_burst(&[out[1].forward(1)]), 1);
        assert!(h.release(&out[0]));
        assert_eq!(h.outstanding(), 0);
        // A token completes once
        assert!(!h.release(&out[0]));

        let seen = loopback(&mut sp);
        assert_eq!(seen[0].op, EventOp::Forward);
        assert_eq!(seen[0].opaque, out[1].opaque);
        assert_eq!(seen[1].op, EventOp::Release);
        // Release hands the credit back locally
        assert_eq!(h.credits(), 7);
    }

    #[test]
    fn test_partial_consumes_credit_and_is_bounded() {
        let sh = shared(PortConf::default(), 64, 32);
        let mut sp = SchedPort::new(sh.clone());
        let mut h = sh.claim().unwrap();
        h.enqueue_burst(&[Event::new(0, 0, 0)]);
        loopback(&mut sp);
        let mut out = [Event::default(); 1];
        assert_eq!(h.dequeue_burst(&mut out), 1);

        let frags = [out[0].partial(1); 20];
        assert_eq!(h.enqueue_burst(&frags), FRAGMENTS_MAX - 1);
        assert_eq!(h.credits(), 31 - (FRAGMENTS_MAX as u32 - 1));
        assert_eq!(h.enqueue_forward_burst(&[out[0].forward(1)]), 1);
    }

    #[test]
    fn test_implicit_release_on_next_dequeue() {
        let sh = shared(PortConf::default(), 64, 8);
        let mut sp = SchedPort::new(sh.clone());
        let mut h = sh.claim().unwrap();
        h.enqueue_burst(&[Event::new(0, 0, 0); 3]);
        loopback(&mut sp);

        let mut out = [Event::default(); 4];
        assert_eq!(h.dequeue_burst(&mut out), 3);
        h.enqueue_forward_burst(&[out[0].forward(1)]);

        assert_eq!(h.dequeue_burst(&mut out), 0);
        assert_eq!(h.outstanding(), 0);
        assert_eq!(sh.stats.implicit_releases.get(), 2);
        let ops: Vec<_> = loopback(&mut sp).iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![EventOp::Forward, EventOp::Release, EventOp::Release]);
    }

    #[test]
    fn test_surplus_credit_returned() {
        let sh = shared(PortConf { dequeue_depth: 32, ..Default::default() }, 64, 4);
        let mut sp = SchedPort::new(sh.clone());
        let mut h = sh.claim().unwrap();
        h.enqueue_burst(&[Event::new(0, 0, 0); 8]);
        assert_eq!(sh.pool.inflights(), 8);
        loopback(&mut sp);

        let mut out = [Event::default(); 8];
        assert_eq!(h.dequeue_burst(&mut out), 8);
        for ev in &out {
            assert!(h.release(ev));
        }
        // The eighth release reached 2 * quanta, so one quantum went back
        assert_eq!(h.credits(), 4);
        assert_eq!(sh.pool.inflights(), 4);
    }

    #[test]
    fn test_parked_state_survives_reclaim() {
        let sh = shared(PortConf { implicit_release: false, ..Default::default() }, 64, 8);
        let mut sp = SchedPort::new(sh.clone());
        let mut out = [Event::default(); 1];
        {
            let mut h = sh.claim().unwrap();
            h.enqueue_burst(&[Event::new(0, 0, 0)]);
            loopback(&mut sp);
            assert_eq!(h.dequeue_burst(&mut out), 1);
        }
        let mut h = sh.claim().unwrap();
        assert_eq!(h.outstanding(), 1);
        assert!(h.release(&out[0]));
    }

    #[test]
    fn test_dequeue_timeout_expires() {
        let sh = shared(PortConf::default(), 64, 8);
        let mut h = sh.claim().unwrap();
        let mut out = [Event::default(); 4];
        let start = Instant::now();
        assert_eq!(h.dequeue_wait(&mut out), 0);
        assert!(start.elapsed() >= Duration::from_millis(1));
        assert_eq!(sh.stats.polls.get(), 1);
        assert_eq!(sh.stats.zero_polls.get(), 1);
    }

    #[test]
    fn test_history_out_of_order_retire() {
        let mut hist = HistoryList::new();
        let a = hist.push(0, Some(1), None);
        let b = hist.push(0, None, Some(3));
        let c = hist.push(1, None, None);
        assert_eq!(hist.outstanding(), 3);

        assert_eq!(hist.retire(b).map(|e| e.rob_slot), Some(Some(3)));
        assert!(hist.get(b).is_none());
        assert_eq!(hist.free(), PORT_HIST_LIST - 3);

        assert_eq!(hist.retire(a).map(|e| e.flow_slot), Some(Some(1)));
        assert_eq!(hist.free(), PORT_HIST_LIST - 1);
        assert!(hist.retire(a).is_none());

        let live = hist.drain();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].token, c);
        assert_eq!(hist.free(), PORT_HIST_LIST);
    }

    #[test]
    fn test_history_fills() {
        let mut hist = HistoryList::new();
        for _ in 0..PORT_HIST_LIST {
            hist.push(0, None, None);
        }
        assert!(hist.is_full());
        assert!(hist.retire(1).is_some());
        // Oldest entry still pins the window
        assert!(hist.is_full());
        assert!(hist.retire(0).is_some());
        assert_eq!(hist.free(), 2);
    }

    #[test]
    fn test_sched_port_space_accounting() {
        let sh = shared(PortConf { dequeue_depth: 4, ..Default::default() }, 64, 8);
        let mut sp = SchedPort::new(sh.clone());
        assert_eq!(sp.space(), 4);
        for n in 0..3 {
            sp.stage(Event::new(0, 0, n));
        }
        assert_eq!(sp.space(), 1);
        assert_eq!(sp.flush(4), 0);
        assert_eq!(sp.space(), 1);
        assert_eq!(sp.flush(1), 3);
        assert_eq!(sp.space(), 1);
        sh.cq_ring.try_pop();
        sp.refresh_space();
        assert_eq!(sp.space(), 2);
    }
}
