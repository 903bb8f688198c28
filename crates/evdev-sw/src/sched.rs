//! Scheduler core loop
//!
//! One call to [`EventDev::schedule`] runs one pass:
//!
//! 1. Pull: apply events waiting in every port's ingress ring. New events go
//!    to their queue; completions retire history entries, unpin flows and
//!    ready reorder slots. Ready reorder slots are flushed after each round.
//! 2. Dispatch: for each queue in priority order, move events from its
//!    internal queues (highest band first) to linked ports.
//! 3. Flush: push staged events to the egress rings.
//!
//! The pass never blocks; anything that does not fit is retried next pass.

use evdev_common::{Event, EventDevError, EventDevResult, EventOp, SchedType};

use crate::credit::CreditPool;
use crate::device::{DevState, EventDev};
use crate::port::{HistEntry, SchedPort};
use crate::qid::Qid;
use crate::reorder::ReorderBuffer;
use crate::IQS_MAX;

/// Passes without an egress flush before `min_burst` drops to 1
const SCHED_NO_ENQ_CYCLE_FLUSH: u32 = 256;
/// A pull round moving this many events or fewer ends the pull phase
const PULL_REPEAT_MIN: usize = 4;

impl EventDev {
    /// Run one scheduling pass, returns the number of events moved.
    ///
    /// Does nothing while the device is not started. An invariant violation
    /// halts the device: the error is returned once and every later call
    /// fails with [`EventDevError::Faulted`].
    pub fn schedule(&mut self) -> EventDevResult<usize> {
        if let Some(reason) = &self.fault {
            return Err(EventDevError::Faulted(reason.clone()));
        }
        if self.state != DevState::Running {
            return Ok(0);
        }

        match self.run_pass() {
            Ok(moved) => Ok(moved),
            Err(e) => {
                tracing::error!(dev = %self.name, error = %e, "scheduler halted");
                self.fault = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn run_pass(&mut self) -> EventDevResult<usize> {
        self.stats.sched_calls += 1;

        for port in self.ports.iter_mut().flatten() {
            port.unlinks_in_progress = 0;
        }

        let (pulled, reordered) = self.pull_all()?;
        let dispatched = self.dispatch_all()?;
        self.flush_ports();

        self.stats.rx_pkts += pulled as u64;
        self.stats.tx_pkts += dispatched as u64;
        if pulled == 0 {
            self.stats.sched_no_iq_enq += 1;
        }
        if dispatched == 0 {
            self.stats.sched_no_cq_enq += 1;
        }
        Ok(pulled + reordered + dispatched)
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    fn pull_all(&mut self) -> EventDevResult<(usize, usize)> {
        let quanta = self.params.sched_quanta as usize;
        let deq_burst = self.params.deq_burst as usize;
        let mut pulled = 0;
        let mut reordered = 0;

        loop {
            let mut round = 0;
            for port in self.ports.iter_mut().flatten() {
                round += pull_port(port, &mut self.qids, &self.pool, deq_burst)?;
            }
            reordered += self.flush_reorder();
            pulled += round;

            if self.params.refill_once || round <= PULL_REPEAT_MIN || pulled >= quanta {
                break;
            }
        }
        Ok((pulled, reordered))
    }

    /// Flush ready reorder slots of every ordered queue, returns fragments moved
    fn flush_reorder(&mut self) -> usize {
        let mut moved = 0;
        for i in 0..self.qids.len() {
            let Some(mut rob) = self.qids[i].as_mut().and_then(|q| q.rob.take()) else {
                continue;
            };
            let qids = &mut self.qids;
            let pool = &*self.pool;
            moved += rob.drain_ready(|ev| deliver(qids, *ev, pool).is_some());
            if let Some(qid) = self.qids[i].as_mut() {
                qid.rob = Some(rob);
            }
        }
        moved
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch_all(&mut self) -> EventDevResult<usize> {
        let budget = self.params.sched_quanta as usize;
        let mut total = 0;
        for i in 0..self.qids_prioritized.len() {
            let qid = self.qids_prioritized[i] as usize;
            total += self.schedule_qid(qid, budget)?;
        }
        Ok(total)
    }

    fn schedule_qid(&mut self, idx: usize, budget: usize) -> EventDevResult<usize> {
        let EventDev {
            qids,
            ports,
            scratch,
            blocked,
            ..
        } = self;
        let Some(qid) = qids.get_mut(idx).and_then(Option::as_mut) else {
            return Ok(0);
        };

        let mut sent = 0;
        for iq in 0..IQS_MAX {
            if sent >= budget {
                break;
            }
            if qid.iq_pkt_mask & (1 << iq) == 0 {
                continue;
            }
            sent += match qid.sched_type {
                SchedType::Atomic => {
                    schedule_atomic(qid, iq, ports, scratch, blocked, budget - sent)?
                }
                SchedType::Ordered | SchedType::Parallel => {
                    schedule_parallel(qid, iq, ports, budget - sent)?
                }
                SchedType::Direct => schedule_direct(qid, iq, ports, budget - sent),
            };
            qid.update_mask(iq);
        }
        qid.stats.tx_pkts += sent as u64;
        Ok(sent)
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    fn flush_ports(&mut self) -> usize {
        let configured = self.params.min_burst as usize;
        let min_burst = if self.sched_flush_count > SCHED_NO_ENQ_CYCLE_FLUSH {
            1
        } else {
            configured
        };

        let pushed: usize = self
            .ports
            .iter_mut()
            .flatten()
            .map(|port| port.flush(min_burst))
            .sum();

        if pushed == 0 {
            self.sched_flush_count = self.sched_flush_count.saturating_add(1);
        } else {
            self.sched_flush_count = 0;
        }
        pushed
    }
}

// ============================================================================
// Pull helpers
// ============================================================================

/// Put an event into its destination queue.
///
/// Returns `None` when the destination band is full. An event addressed to a
/// queue that is not set up is dropped and its credit returned; that counts as
/// delivered (`Some(false)`).
fn deliver(qids: &mut [Option<Qid>], ev: Event, pool: &CreditPool) -> Option<bool> {
    match qids.get_mut(ev.queue_id as usize).and_then(Option::as_mut) {
        Some(qid) => qid.enqueue(ev).then_some(true),
        None => {
            pool.release(1);
            tracing::warn!(queue = ev.queue_id, "event for unconfigured queue dropped");
            Some(false)
        }
    }
}

fn missing_token(port: u8, ev: &Event) -> EventDevError {
    EventDevError::Invariant(format!(
        "port {port}: {:?} for unknown history token {}",
        ev.op, ev.opaque
    ))
}

fn reorder_of(qids: &mut [Option<Qid>], qid: u8) -> EventDevResult<&mut ReorderBuffer> {
    qids.get_mut(qid as usize)
        .and_then(Option::as_mut)
        .and_then(|q| q.rob.as_mut())
        .ok_or_else(|| EventDevError::Invariant(format!("queue {qid} has no reorder buffer")))
}

/// Apply the completion of a dispatched event: unpin its flow, ready its reorder slot
pub(crate) fn complete_entry(
    qids: &mut [Option<Qid>],
    port: u8,
    entry: &HistEntry,
) -> EventDevResult<()> {
    if let Some(slot) = entry.flow_slot {
        qids.get_mut(entry.qid as usize)
            .and_then(Option::as_mut)
            .and_then(|q| q.flows.as_mut())
            .ok_or_else(|| {
                EventDevError::Invariant(format!("queue {} has no flow table", entry.qid))
            })?
            .complete(slot, port)?;
    }
    if let Some(slot) = entry.rob_slot {
        reorder_of(qids, entry.qid)?.complete(slot)?;
    }
    Ok(())
}

/// Apply events from one port's ingress, returns the number applied
fn pull_port(
    port: &mut SchedPort,
    qids: &mut [Option<Qid>],
    pool: &CreditPool,
    deq_burst: usize,
) -> EventDevResult<usize> {
    if port.pp_buf.len() < deq_burst {
        let want = deq_burst - port.pp_buf.len();
        port.shared.rx_ring.dequeue_into(&mut port.pp_buf, want);
    }

    let pid = port.id();
    let mut applied = 0;
    while let Some(&ev) = port.pp_buf.front() {
        match ev.op {
            EventOp::New => match deliver(qids, ev, pool) {
                None => break,
                Some(false) => port.stats.discarded += 1,
                Some(true) => {}
            },
            EventOp::Forward => {
                let entry = port.hist.get(ev.opaque).ok_or_else(|| missing_token(pid, &ev))?;
                if let Some(slot) = entry.rob_slot {
                    reorder_of(qids, entry.qid)?.add_fragment(slot, ev)?;
                } else {
                    match deliver(qids, ev, pool) {
                        None => break,
                        Some(false) => port.stats.discarded += 1,
                        Some(true) => {}
                    }
                }
                complete_entry(qids, pid, &entry)?;
                port.hist.retire(ev.opaque);
                port.stats.completions += 1;
            }
            EventOp::Partial => {
                let entry = port.hist.get(ev.opaque).ok_or_else(|| missing_token(pid, &ev))?;
                if let Some(slot) = entry.rob_slot {
                    reorder_of(qids, entry.qid)?.add_fragment(slot, ev)?;
                } else {
                    match deliver(qids, ev, pool) {
                        None => break,
                        Some(false) => port.stats.discarded += 1,
                        Some(true) => {}
                    }
                }
            }
            EventOp::Release => {
                let entry = port
                    .hist
                    .retire(ev.opaque)
                    .ok_or_else(|| missing_token(pid, &ev))?;
                complete_entry(qids, pid, &entry)?;
                port.stats.completions += 1;
            }
        }
        port.pp_buf.pop_front();
        applied += 1;
    }
    port.stats.rx_pkts += applied as u64;
    Ok(applied)
}

// ============================================================================
// Dispatch helpers
// ============================================================================

#[inline]
fn port_mut(ports: &mut [Option<SchedPort>], id: u8) -> Option<&mut SchedPort> {
    ports.get_mut(id as usize).and_then(Option::as_mut)
}

#[inline]
fn port_space(ports: &[Option<SchedPort>], id: u8) -> usize {
    ports
        .get(id as usize)
        .and_then(Option::as_ref)
        .map_or(0, SchedPort::space)
}

/// Stamp an event for `port` and stage it for the egress ring
#[inline]
fn send(
    port: &mut SchedPort,
    qid: &mut Qid,
    mut ev: Event,
    flow_slot: Option<u32>,
    rob_slot: Option<u16>,
) {
    ev.sched_type = qid.sched_type;
    ev.opaque = port.hist.push(qid.id, flow_slot, rob_slot);
    qid.stats.to_port[port.id() as usize] += 1;
    port.stage(ev);
}

/// Next linked port with room, round-robin
fn pick_rr(cq_map: &[u8], cq_next: &mut usize, ports: &[Option<SchedPort>]) -> Option<u8> {
    let n = cq_map.len();
    (0..n)
        .map(|i| (*cq_next + i) % n)
        .find(|&i| port_space(ports, cq_map[i]) > 0)
        .map(|i| {
            *cq_next = (i + 1) % n;
            cq_map[i]
        })
}

/// Port for a newly pinned flow: the linked port with the most room, ties
/// broken in favour of the round-robin candidate
fn pick_atomic(cq_map: &[u8], cq_next: &mut usize, ports: &[Option<SchedPort>]) -> Option<u8> {
    let n = cq_map.len();
    if n == 0 {
        return None;
    }
    let start = *cq_next % n;
    let mut best: Option<(u8, usize)> = None;
    for i in 0..n {
        let p = cq_map[(start + i) % n];
        let space = port_space(ports, p);
        if space > best.map_or(0, |(_, s)| s) {
            best = Some((p, space));
        }
    }
    if best.is_some() {
        *cq_next = (start + 1) % n;
    }
    best.map(|(p, _)| p)
}

fn schedule_atomic(
    qid: &mut Qid,
    iq: usize,
    ports: &mut [Option<SchedPort>],
    scratch: &mut Vec<Event>,
    blocked: &mut Vec<Event>,
    budget: usize,
) -> EventDevResult<usize> {
    scratch.clear();
    blocked.clear();
    qid.iqs[iq].dequeue_burst(scratch, budget);

    let mut sent = 0;
    for &ev in scratch.iter() {
        let flows = qid
            .flows
            .as_mut()
            .ok_or_else(|| EventDevError::Invariant(format!("atomic queue {} has no flow table", qid.id)))?;
        let slot = flows.slot(ev.flow_id);
        let target = match flows.pinned_port(slot) {
            // A pinned flow goes to its port, linked or not
            Some(p) => port_mut(ports, p).is_some_and(|port| port.can_accept()).then_some(p),
            None => pick_atomic(&qid.cq_map, &mut qid.cq_next, ports),
        };
        let Some(p) = target else {
            blocked.push(ev);
            continue;
        };

        flows.dispatch(slot, p)?;
        let port = port_mut(ports, p)
            .ok_or_else(|| EventDevError::Invariant(format!("flow pinned to missing port {p}")))?;
        send(port, qid, ev, Some(slot), None);
        sent += 1;
    }

    if !qid.iqs[iq].put_back(blocked) {
        return Err(EventDevError::Invariant(format!(
            "queue {} band {iq}: no room to put back {} blocked events",
            qid.id,
            blocked.len()
        )));
    }
    Ok(sent)
}

fn schedule_parallel(
    qid: &mut Qid,
    iq: usize,
    ports: &mut [Option<SchedPort>],
    budget: usize,
) -> EventDevResult<usize> {
    let mut sent = 0;
    while sent < budget {
        let Some(&ev) = qid.iqs[iq].peek() else {
            break;
        };
        let Some(p) = pick_rr(&qid.cq_map, &mut qid.cq_next, ports) else {
            break;
        };
        let rob_slot = match qid.rob.as_mut() {
            Some(rob) => match rob.allocate()? {
                Some(slot) => Some(slot),
                // Window exhausted, the event waits in its band
                None => break,
            },
            None => None,
        };
        qid.iqs[iq].dequeue();
        if let Some(port) = port_mut(ports, p) {
            send(port, qid, ev, None, rob_slot);
        }
        sent += 1;
    }
    Ok(sent)
}

fn schedule_direct(
    qid: &mut Qid,
    iq: usize,
    ports: &mut [Option<SchedPort>],
    budget: usize,
) -> usize {
    let Some(&p) = qid.cq_map.first() else {
        return 0;
    };
    let Some(port) = port_mut(ports, p) else {
        return 0;
    };
    let mut sent = 0;
    while sent < budget && port.can_accept() {
        let Some(ev) = qid.iqs[iq].dequeue() else {
            break;
        };
        send(port, qid, ev, None, None);
        sent += 1;
    }
    sent
}
