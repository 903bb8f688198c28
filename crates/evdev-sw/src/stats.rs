//! Device Statistics
//!
//! Worker-side counters are lock-free and cache-line aligned; scheduler-side
//! counters are plain integers owned by the scheduling thread. Both are read
//! through serializable snapshots, flat xstats lists, a text dump, or pushed
//! to the `metrics` facade.

use evdev_common::{AtomicCounter, EventDevError, EventDevResult, SchedType};
use serde::Serialize;
use std::fmt::Write;

use crate::device::{DevState, EventDev};
use crate::{DEQUEUE_DEPTH_MAX, IQS_MAX};

/// Dequeue sizes sharing one histogram bucket, as a shift
pub const POLL_BUCKET_SHIFT: usize = 2;
/// Dequeue burst-size histogram buckets
pub const POLL_BUCKETS: usize = DEQUEUE_DEPTH_MAX as usize >> POLL_BUCKET_SHIFT;
/// Weight of the per-event latency moving average
const LATENCY_SAMPLES: u64 = 64;

/// Per-port worker counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug)]
pub struct PortWorkerStats {
    /// Events accepted into the ingress ring
    pub enqueued: AtomicCounter,
    /// Events refused by enqueue calls
    pub enqueue_refused: AtomicCounter,
    /// `New` events refused for lack of credit or over threshold
    pub new_throttled: AtomicCounter,
    /// Events dequeued
    pub dequeued: AtomicCounter,
    /// Dequeue calls
    pub polls: AtomicCounter,
    /// Dequeue calls that returned nothing
    pub zero_polls: AtomicCounter,
    /// Releases generated by implicit release
    pub implicit_releases: AtomicCounter,
    /// Dequeue burst sizes, bucket `n` covers `4n+1..=4n+4`
    pub poll_buckets: [AtomicCounter; POLL_BUCKETS],
    /// Moving average of worker time per event, nanoseconds
    pub avg_pkt_ns: AtomicCounter,
}

impl Default for PortWorkerStats {
    fn default() -> Self {
        Self {
            enqueued: AtomicCounter::new(0),
            enqueue_refused: AtomicCounter::new(0),
            new_throttled: AtomicCounter::new(0),
            dequeued: AtomicCounter::new(0),
            polls: AtomicCounter::new(0),
            zero_polls: AtomicCounter::new(0),
            implicit_releases: AtomicCounter::new(0),
            poll_buckets: std::array::from_fn(|_| AtomicCounter::new(0)),
            avg_pkt_ns: AtomicCounter::new(0),
        }
    }
}

impl PortWorkerStats {
    #[inline(always)]
    pub(crate) fn record_poll(&self, n: usize) {
        self.polls.inc();
        if n == 0 {
            self.zero_polls.inc();
            return;
        }
        self.dequeued.add(n as u64);
        let bucket = ((n - 1) >> POLL_BUCKET_SHIFT).min(POLL_BUCKETS - 1);
        self.poll_buckets[bucket].inc();
    }

    #[inline]
    pub(crate) fn record_latency(&self, burst_ns: u64, n: usize) {
        if n == 0 {
            return;
        }
        let sample = burst_ns / n as u64;
        let avg = self.avg_pkt_ns.get();
        self.avg_pkt_ns
            .set(avg - avg / LATENCY_SAMPLES + sample / LATENCY_SAMPLES);
    }

    fn reset(&self) {
        for c in [
            &self.enqueued,
            &self.enqueue_refused,
            &self.new_throttled,
            &self.dequeued,
            &self.polls,
            &self.zero_polls,
            &self.implicit_releases,
            &self.avg_pkt_ns,
        ] {
            c.set(0);
        }
        for c in &self.poll_buckets {
            c.set(0);
        }
    }
}

/// Scheduler-owned device counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DevStats {
    /// Events applied from ingress rings
    pub rx_pkts: u64,
    /// Events dispatched to ports
    pub tx_pkts: u64,
    /// Scheduling passes
    pub sched_calls: u64,
    /// Passes that applied no ingress event
    pub sched_no_iq_enq: u64,
    /// Passes that dispatched nothing
    pub sched_no_cq_enq: u64,
    /// Events discarded by port teardown
    pub port_discards: u64,
}

/// Where the device's credits are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditSnapshot {
    /// Total credits
    pub limit: u32,
    /// Credits in the pool
    pub available: u32,
    /// Credits held locally by ports
    pub port_local: u32,
    /// Credits carried by live events
    pub in_flight: u32,
}

/// Device-level snapshot
#[derive(Debug, Clone, Serialize)]
pub struct DevStatsSnapshot {
    /// Device name
    pub name: String,
    /// Lifecycle state
    pub state: DevState,
    /// Fault message, if halted
    pub fault: Option<String>,
    /// Counters
    pub counters: DevStats,
    /// Credit distribution
    pub credits: CreditSnapshot,
}

/// Port snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PortStatsSnapshot {
    /// Port id
    pub id: u8,
    /// Events applied from this port's ingress
    pub rx_pkts: u64,
    /// Events dispatched to this port
    pub tx_pkts: u64,
    /// Completions applied
    pub completions: u64,
    /// Events discarded
    pub discarded: u64,
    /// Events accepted by enqueue
    pub enqueued: u64,
    /// Events refused by enqueue
    pub enqueue_refused: u64,
    /// `New` events throttled
    pub new_throttled: u64,
    /// Events dequeued
    pub dequeued: u64,
    /// Dequeue calls
    pub polls: u64,
    /// Empty dequeue calls
    pub zero_polls: u64,
    /// Implicit releases
    pub implicit_releases: u64,
    /// Dequeue burst-size histogram
    pub poll_buckets: Vec<u64>,
    /// Average worker time per event, nanoseconds
    pub avg_pkt_ns: u64,
    /// Local credits
    pub credits: u32,
    /// Dispatched events awaiting completion
    pub outstanding: usize,
    /// Ingress ring occupancy
    pub rx_ring_used: usize,
    /// Egress ring occupancy
    pub cq_ring_used: usize,
    /// Events staged for the egress ring
    pub cq_staged: usize,
    /// Linked queues
    pub links: Vec<u8>,
    /// Unacknowledged unlinks
    pub unlinks_in_progress: u32,
    /// Linked to a single-link queue
    pub is_directed: bool,
    /// Linked ordered queues
    pub num_ordered_qids: u32,
}

impl PortStatsSnapshot {
    fn xstats(&self, out: &mut Vec<(String, u64)>) {
        let p = format!("port_{}", self.id);
        for (name, value) in [
            ("rx", self.rx_pkts),
            ("tx", self.tx_pkts),
            ("completions", self.completions),
            ("discarded", self.discarded),
            ("enqueued", self.enqueued),
            ("enqueue_refused", self.enqueue_refused),
            ("new_throttled", self.new_throttled),
            ("dequeued", self.dequeued),
            ("polls", self.polls),
            ("zero_polls", self.zero_polls),
            ("implicit_releases", self.implicit_releases),
            ("avg_pkt_ns", self.avg_pkt_ns),
            ("credits", self.credits as u64),
            ("outstanding", self.outstanding as u64),
            ("rx_ring_used", self.rx_ring_used as u64),
            ("cq_ring_used", self.cq_ring_used as u64),
        ] {
            out.push((format!("{p}_{name}"), value));
        }
        for (i, &count) in self.poll_buckets.iter().enumerate() {
            let lo = (i << POLL_BUCKET_SHIFT) + 1;
            let hi = (i + 1) << POLL_BUCKET_SHIFT;
            out.push((format!("{p}_dequeues_bucket_{lo}-{hi}"), count));
        }
    }
}

/// Queue snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsSnapshot {
    /// Queue id
    pub id: u8,
    /// Scheduling type
    pub sched_type: SchedType,
    /// Queue priority
    pub priority: u8,
    /// Events accepted into the internal queues
    pub rx_pkts: u64,
    /// Events dispatched
    pub tx_pkts: u64,
    /// Occupancy per priority band
    pub iq_used: [usize; IQS_MAX],
    /// Flow slots pinned (atomic)
    pub pinned_flows: usize,
    /// Reorder slots in use (ordered)
    pub reorder_in_use: usize,
    /// Fragments parked in the reorder window (ordered)
    pub reorder_parked: usize,
    /// Reorder window (ordered)
    pub reorder_window: usize,
    /// Linked ports
    pub linked_ports: Vec<u8>,
    /// Events dispatched per port, ports with none omitted
    pub to_port: Vec<(u8, u64)>,
}

impl QueueStatsSnapshot {
    fn xstats(&self, out: &mut Vec<(String, u64)>) {
        let q = format!("qid_{}", self.id);
        out.push((format!("{q}_rx"), self.rx_pkts));
        out.push((format!("{q}_tx"), self.tx_pkts));
        for (i, used) in self.iq_used.iter().enumerate() {
            out.push((format!("{q}_iq_{i}_used"), *used as u64));
        }
        out.push((format!("{q}_pinned_flows"), self.pinned_flows as u64));
        out.push((format!("{q}_reorder_in_use"), self.reorder_in_use as u64));
        out.push((format!("{q}_reorder_parked"), self.reorder_parked as u64));
        for &(port, count) in &self.to_port {
            out.push((format!("{q}_port_{port}_tx"), count));
        }
    }
}

/// Full device snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Device level
    pub dev: DevStatsSnapshot,
    /// Set-up ports
    pub ports: Vec<PortStatsSnapshot>,
    /// Set-up queues
    pub queues: Vec<QueueStatsSnapshot>,
}

/// Scope of an xstats query or reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XstatsMode {
    /// Device counters
    Device,
    /// One port
    Port(u8),
    /// One queue
    Queue(u8),
}

impl EventDev {
    /// Credit distribution across pool, ports and live events
    pub fn credits(&self) -> CreditSnapshot {
        let port_local: u32 = self.ports.iter().flatten().map(|p| p.shared.credits()).sum();
        let inflights = self.pool.inflights();
        CreditSnapshot {
            limit: self.pool.limit(),
            available: self.pool.available(),
            port_local,
            in_flight: inflights.saturating_sub(port_local),
        }
    }

    /// Device-level snapshot
    pub fn dev_stats(&self) -> DevStatsSnapshot {
        DevStatsSnapshot {
            name: self.name.clone(),
            state: self.state,
            fault: self.fault.clone(),
            counters: self.stats.clone(),
            credits: self.credits(),
        }
    }

    /// Snapshot of one port
    pub fn port_stats(&self, port: u8) -> EventDevResult<PortStatsSnapshot> {
        let sp = self.check_port(port)?;
        let w = &sp.shared.stats;
        Ok(PortStatsSnapshot {
            id: port,
            rx_pkts: sp.stats.rx_pkts,
            tx_pkts: sp.stats.tx_pkts,
            completions: sp.stats.completions,
            discarded: sp.stats.discarded,
            enqueued: w.enqueued.get(),
            enqueue_refused: w.enqueue_refused.get(),
            new_throttled: w.new_throttled.get(),
            dequeued: w.dequeued.get(),
            polls: w.polls.get(),
            zero_polls: w.zero_polls.get(),
            implicit_releases: w.implicit_releases.get(),
            poll_buckets: w.poll_buckets.iter().map(AtomicCounter::get).collect(),
            avg_pkt_ns: w.avg_pkt_ns.get(),
            credits: sp.shared.credits(),
            outstanding: sp.hist.outstanding(),
            rx_ring_used: sp.shared.rx_ring.len() + sp.pp_buf.len(),
            cq_ring_used: sp.shared.cq_ring.len(),
            cq_staged: sp.cq_buf.len(),
            links: sp.linked_qids().collect(),
            unlinks_in_progress: sp.unlinks_in_progress,
            is_directed: sp.is_directed,
            num_ordered_qids: sp.num_ordered_qids,
        })
    }

    /// Snapshot of one queue
    pub fn queue_stats(&self, queue: u8) -> EventDevResult<QueueStatsSnapshot> {
        let qid = self.check_queue(queue)?;
        Ok(QueueStatsSnapshot {
            id: queue,
            sched_type: qid.sched_type,
            priority: qid.priority(),
            rx_pkts: qid.stats.rx_pkts,
            tx_pkts: qid.stats.tx_pkts,
            iq_used: std::array::from_fn(|i| qid.iqs[i].len()),
            pinned_flows: qid.flows.as_ref().map_or(0, |f| f.pinned_count()),
            reorder_in_use: qid.rob.as_ref().map_or(0, |r| r.in_use()),
            reorder_parked: qid.rob.as_ref().map_or(0, |r| r.parked()),
            reorder_window: qid.rob.as_ref().map_or(0, |r| r.window_size()),
            linked_ports: qid.cq_map.clone(),
            to_port: qid
                .stats
                .to_port
                .iter()
                .enumerate()
                .filter(|(_, &n)| n > 0)
                .map(|(p, &n)| (p as u8, n))
                .collect(),
        })
    }

    /// Snapshot of the whole device
    pub fn stats(&self) -> StatsSnapshot {
        let ports = (0..self.ports.len() as u8)
            .filter_map(|p| self.port_stats(p).ok())
            .collect();
        let queues = (0..self.qids.len() as u8)
            .filter_map(|q| self.queue_stats(q).ok())
            .collect();
        StatsSnapshot {
            dev: self.dev_stats(),
            ports,
            queues,
        }
    }

    /// Flat name/value statistics for one scope
    pub fn xstats(&self, mode: XstatsMode) -> EventDevResult<Vec<(String, u64)>> {
        let mut out = Vec::new();
        match mode {
            XstatsMode::Device => {
                let s = &self.stats;
                let c = self.credits();
                for (name, value) in [
                    ("dev_rx", s.rx_pkts),
                    ("dev_tx", s.tx_pkts),
                    ("dev_sched_calls", s.sched_calls),
                    ("dev_sched_no_iq_enq", s.sched_no_iq_enq),
                    ("dev_sched_no_cq_enq", s.sched_no_cq_enq),
                    ("dev_port_discards", s.port_discards),
                    ("dev_credits_available", c.available as u64),
                    ("dev_credits_port_local", c.port_local as u64),
                    ("dev_inflight", c.in_flight as u64),
                ] {
                    out.push((name.to_string(), value));
                }
            }
            XstatsMode::Port(p) => self.port_stats(p)?.xstats(&mut out),
            XstatsMode::Queue(q) => self.queue_stats(q)?.xstats(&mut out),
        }
        Ok(out)
    }

    /// Look up one xstat by name
    pub fn xstat_by_name(&self, name: &str) -> Option<u64> {
        let mode = if name.starts_with("dev_") {
            XstatsMode::Device
        } else {
            let mut parts = name.splitn(3, '_');
            let scope = parts.next()?;
            let id: u8 = parts.next()?.parse().ok()?;
            match scope {
                "port" => XstatsMode::Port(id),
                "qid" => XstatsMode::Queue(id),
                _ => return None,
            }
        };
        self.xstats(mode)
            .ok()?
            .into_iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }

    /// Zero the counters of one scope. Gauges (occupancy, credits) are unaffected.
    pub fn xstats_reset(&mut self, mode: XstatsMode) -> EventDevResult<()> {
        match mode {
            XstatsMode::Device => self.stats = DevStats::default(),
            XstatsMode::Port(p) => {
                let sp = self.port_mut(p)?;
                sp.stats = Default::default();
                sp.shared.stats.reset();
            }
            XstatsMode::Queue(q) => {
                let qid = self
                    .qids
                    .get_mut(q as usize)
                    .ok_or(EventDevError::QueueOutOfRange(q))?
                    .as_mut()
                    .ok_or(EventDevError::QueueNotSetup(q))?;
                qid.stats.rx_pkts = 0;
                qid.stats.tx_pkts = 0;
                qid.stats.to_port.fill(0);
            }
        }
        Ok(())
    }

    /// Human-readable state dump
    pub fn dump(&self) -> String {
        let snap = self.stats();
        let mut out = String::new();
        let d = &snap.dev;
        let _ = writeln!(out, "EventDev {} ({:?})", d.name, d.state);
        if let Some(fault) = &d.fault {
            let _ = writeln!(out, "  FAULT: {fault}");
        }
        let _ = writeln!(
            out,
            "  rx {}  tx {}  sched calls {}  no-iq {}  no-cq {}  discards {}",
            d.counters.rx_pkts,
            d.counters.tx_pkts,
            d.counters.sched_calls,
            d.counters.sched_no_iq_enq,
            d.counters.sched_no_cq_enq,
            d.counters.port_discards
        );
        let _ = writeln!(
            out,
            "  credits: limit {}  available {}  port-local {}  in flight {}",
            d.credits.limit, d.credits.available, d.credits.port_local, d.credits.in_flight
        );

        for p in &snap.ports {
            let _ = writeln!(
                out,
                "  Port {}{}: rx {} tx {} done {} | enq {} refused {} deq {} polls {} ({} empty) | credits {} outstanding {} | ring {}/{} staged {} | avg {} ns | links {:?}",
                p.id,
                if p.is_directed { " [directed]" } else { "" },
                p.rx_pkts,
                p.tx_pkts,
                p.completions,
                p.enqueued,
                p.enqueue_refused,
                p.dequeued,
                p.polls,
                p.zero_polls,
                p.credits,
                p.outstanding,
                p.rx_ring_used,
                p.cq_ring_used,
                p.cq_staged,
                p.avg_pkt_ns,
                p.links
            );
        }

        for q in &snap.queues {
            let _ = write!(
                out,
                "  Queue {} ({}, prio {}): rx {} tx {} iqs {:?} ports {:?}",
                q.id, q.sched_type, q.priority, q.rx_pkts, q.tx_pkts, q.iq_used, q.linked_ports
            );
            match q.sched_type {
                SchedType::Atomic => {
                    let _ = write!(out, " pinned {}", q.pinned_flows);
                }
                SchedType::Ordered => {
                    let _ = write!(out, " reorder {}/{}", q.reorder_in_use, q.reorder_window);
                }
                _ => {}
            }
            out.push('\n');
        }
        out
    }

    /// Push current counters and gauges to the installed `metrics` recorder
    pub fn publish_metrics(&self) {
        let snap = self.stats();
        let dev = snap.dev.name.clone();
        let c = &snap.dev.counters;

        metrics::counter!("evdev_rx_events_total", "dev" => dev.clone()).absolute(c.rx_pkts);
        metrics::counter!("evdev_tx_events_total", "dev" => dev.clone()).absolute(c.tx_pkts);
        metrics::counter!("evdev_sched_calls_total", "dev" => dev.clone()).absolute(c.sched_calls);
        metrics::counter!("evdev_port_discards_total", "dev" => dev.clone()).absolute(c.port_discards);
        metrics::gauge!("evdev_credits_available", "dev" => dev.clone())
            .set(snap.dev.credits.available as f64);
        metrics::gauge!("evdev_credits_in_flight", "dev" => dev.clone())
            .set(snap.dev.credits.in_flight as f64);

        for p in &snap.ports {
            let port = p.id.to_string();
            metrics::counter!("evdev_port_enqueued_total", "dev" => dev.clone(), "port" => port.clone())
                .absolute(p.enqueued);
            metrics::counter!("evdev_port_dequeued_total", "dev" => dev.clone(), "port" => port.clone())
                .absolute(p.dequeued);
            metrics::counter!("evdev_port_zero_polls_total", "dev" => dev.clone(), "port" => port.clone())
                .absolute(p.zero_polls);
            metrics::gauge!("evdev_port_outstanding", "dev" => dev.clone(), "port" => port.clone())
                .set(p.outstanding as f64);
            metrics::gauge!("evdev_port_avg_event_ns", "dev" => dev.clone(), "port" => port)
                .set(p.avg_pkt_ns as f64);
        }

        for q in &snap.queues {
            let queue = q.id.to_string();
            metrics::counter!("evdev_queue_tx_total", "dev" => dev.clone(), "queue" => queue.clone())
                .absolute(q.tx_pkts);
            metrics::gauge!("evdev_queue_depth", "dev" => dev.clone(), "queue" => queue)
                .set(q.iq_used.iter().sum::<usize>() as f64);
        }
    }
}
