//! Event device control plane
//!
//! [`EventDev`] is the explicit scheduler context: it owns the queues, the
//! scheduler half of every port and the credit pool. Configuration, setup and
//! link changes go through `&mut EventDev`, so they are serialized with the
//! scheduling passes by ownership alone.

use evdev_common::{Event, EventDevError, EventDevResult, SchedType, PRIORITY_NORMAL};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DevConfig, DevInfo, PortConf, QueueConf, RuntimeParams};
use crate::credit::CreditPool;
use crate::port::{HistEntry, PortHandle, PortShared, SchedPort};
use crate::qid::Qid;
use crate::sched::complete_entry;
use crate::stats::DevStats;
use crate::{ENQUEUE_MAX_BURST, MAX_CQS_PER_QID};

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevState {
    /// Created, `configure` not called yet
    Unconfigured,
    /// Configured and stopped
    Configured,
    /// Started; `schedule` does work
    Running,
}

/// Software event device
#[derive(Debug)]
pub struct EventDev {
    pub(crate) name: String,
    pub(crate) params: RuntimeParams,
    pub(crate) conf: Option<DevConfig>,
    pub(crate) state: DevState,
    pub(crate) pool: Arc<CreditPool>,
    pub(crate) qids: Vec<Option<Qid>>,
    pub(crate) ports: Vec<Option<SchedPort>>,
    /// Set-up queues ordered by (priority, id)
    pub(crate) qids_prioritized: Vec<u8>,
    /// Latched invariant violation
    pub(crate) fault: Option<String>,
    pub(crate) stats: DevStats,
    /// Consecutive passes without an egress flush
    pub(crate) sched_flush_count: u32,
    pub(crate) scratch: Vec<Event>,
    pub(crate) blocked: Vec<Event>,
}

impl EventDev {
    /// Create an unconfigured device
    pub fn new(name: impl Into<String>, params: RuntimeParams) -> EventDevResult<Self> {
        params.validate()?;
        let name = name.into();
        tracing::info!(dev = %name, ?params, "event device created");
        Ok(Self {
            name,
            pool: Arc::new(CreditPool::new(0, params.credit_quanta)),
            params,
            conf: None,
            state: DevState::Unconfigured,
            qids: Vec::new(),
            ports: Vec::new(),
            qids_prioritized: Vec::new(),
            fault: None,
            stats: DevStats::default(),
            sched_flush_count: 0,
            scratch: Vec::with_capacity(ENQUEUE_MAX_BURST),
            blocked: Vec::with_capacity(ENQUEUE_MAX_BURST),
        })
    }

    /// Create a device from a `key=value,key=value` runtime parameter string
    pub fn with_params(name: impl Into<String>, args: &str) -> EventDevResult<Self> {
        Self::new(name, args.parse()?)
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime parameters
    pub fn params(&self) -> &RuntimeParams {
        &self.params
    }

    /// Current configuration
    pub fn config(&self) -> Option<&DevConfig> {
        self.conf.as_ref()
    }

    /// Lifecycle state
    pub fn state(&self) -> DevState {
        self.state
    }

    /// Check if started
    pub fn is_running(&self) -> bool {
        self.state == DevState::Running
    }

    /// Invariant violation that halted the scheduler, if any
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Limits and capabilities
    pub fn info(&self) -> DevInfo {
        DevInfo::default()
    }

    // ------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------

    fn require_stopped(&self, op: &str) -> EventDevResult<&DevConfig> {
        if self.state == DevState::Running {
            return Err(EventDevError::InvalidState(format!("{op} requires a stopped device")));
        }
        self.conf
            .as_ref()
            .ok_or_else(|| EventDevError::InvalidState(format!("{op} requires a configured device")))
    }

    pub(crate) fn check_queue(&self, queue: u8) -> EventDevResult<&Qid> {
        self.qids
            .get(queue as usize)
            .ok_or(EventDevError::QueueOutOfRange(queue))?
            .as_ref()
            .ok_or(EventDevError::QueueNotSetup(queue))
    }

    pub(crate) fn check_port(&self, port: u8) -> EventDevResult<&SchedPort> {
        self.ports
            .get(port as usize)
            .ok_or(EventDevError::PortOutOfRange(port))?
            .as_ref()
            .ok_or(EventDevError::PortNotSetup(port))
    }

    pub(crate) fn port_mut(&mut self, port: u8) -> EventDevResult<&mut SchedPort> {
        self.ports
            .get_mut(port as usize)
            .ok_or(EventDevError::PortOutOfRange(port))?
            .as_mut()
            .ok_or(EventDevError::PortNotSetup(port))
    }

    fn ensure_unclaimed(&self) -> EventDevResult<()> {
        match self.ports.iter().flatten().find(|p| p.shared.is_claimed()) {
            Some(p) => Err(EventDevError::PortBusy(p.id())),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Device lifecycle
    // ------------------------------------------------------------------

    /// Configure queue and port counts and the credit total.
    ///
    /// Reconfiguring discards every queue and port.
    pub fn configure(&mut self, conf: DevConfig) -> EventDevResult<()> {
        if self.state == DevState::Running {
            return Err(EventDevError::InvalidState("configure requires a stopped device".into()));
        }
        conf.validate()?;
        self.ensure_unclaimed()?;

        self.pool = Arc::new(CreditPool::new(conf.nb_events_limit, self.params.credit_quanta));
        self.qids = (0..conf.nb_event_queues).map(|_| None).collect();
        self.ports = (0..conf.nb_event_ports).map(|_| None).collect();
        self.qids_prioritized.clear();
        self.fault = None;
        self.sched_flush_count = 0;
        self.state = DevState::Configured;

        tracing::info!(
            dev = %self.name,
            queues = conf.nb_event_queues,
            ports = conf.nb_event_ports,
            limit = conf.nb_events_limit,
            "event device configured"
        );
        self.conf = Some(conf);
        Ok(())
    }

    /// Start scheduling. Every configured queue and port must be set up.
    pub fn start(&mut self) -> EventDevResult<()> {
        match self.state {
            DevState::Unconfigured => {
                return Err(EventDevError::InvalidState("start requires a configured device".into()))
            }
            DevState::Running => {
                return Err(EventDevError::InvalidState("device already started".into()))
            }
            DevState::Configured => {}
        }
        if let Some(reason) = &self.fault {
            return Err(EventDevError::Faulted(reason.clone()));
        }
        if let Some(q) = self.qids.iter().position(Option::is_none) {
            return Err(EventDevError::QueueNotSetup(q as u8));
        }
        if let Some(p) = self.ports.iter().position(Option::is_none) {
            return Err(EventDevError::PortNotSetup(p as u8));
        }
        for qid in self.qids.iter().flatten() {
            if qid.cq_map.is_empty() {
                tracing::warn!(dev = %self.name, queue = qid.id, "queue has no linked ports");
            }
        }

        self.state = DevState::Running;
        tracing::info!(dev = %self.name, "event device started");
        Ok(())
    }

    /// Stop scheduling. Queued events stay where they are.
    pub fn stop(&mut self) {
        if self.state == DevState::Running {
            self.state = DevState::Configured;
            tracing::info!(dev = %self.name, "event device stopped");
        }
    }

    /// Release every port and queue and return to the unconfigured state
    pub fn close(&mut self) -> EventDevResult<()> {
        if self.state == DevState::Running {
            return Err(EventDevError::InvalidState("close requires a stopped device".into()));
        }
        self.ensure_unclaimed()?;

        // Corruption found here is logged by the teardown and cleared below
        for id in 0..self.ports.len() as u8 {
            let _ = self.teardown_port(id);
        }
        self.qids.clear();
        self.ports.clear();
        self.qids_prioritized.clear();
        self.conf = None;
        self.fault = None;
        self.state = DevState::Unconfigured;
        tracing::info!(dev = %self.name, "event device closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Set up (or re-set up) a queue. Links survive re-setup.
    pub fn queue_setup(&mut self, queue: u8, conf: QueueConf) -> EventDevResult<()> {
        self.require_stopped("queue_setup")?;
        let slot = self
            .qids
            .get(queue as usize)
            .ok_or(EventDevError::QueueOutOfRange(queue))?;
        conf.validate()?;

        let mut cq_map = Vec::new();
        if let Some(old) = slot {
            if old.is_busy() {
                return Err(EventDevError::InvalidState(format!(
                    "queue {queue} still holds events"
                )));
            }
            if conf.effective_type() == SchedType::Direct && old.cq_map.len() > 1 {
                return Err(EventDevError::InvalidConfig(format!(
                    "queue {queue} has {} links, single-link allows one",
                    old.cq_map.len()
                )));
            }
            cq_map = old.cq_map.clone();
        }

        let mut qid = Qid::new(queue, conf, self.params.iq_depth);
        tracing::debug!(
            dev = %self.name,
            queue,
            sched_type = %qid.sched_type,
            priority = qid.priority(),
            "queue set up"
        );
        qid.cq_map = cq_map;
        let linked = qid.cq_map.clone();
        self.qids[queue as usize] = Some(qid);

        for port in linked {
            self.refresh_port_flags(port);
        }
        self.rebuild_priorities();
        Ok(())
    }

    /// Release a queue, unlinking it from every port
    pub fn queue_release(&mut self, queue: u8) -> EventDevResult<()> {
        self.require_stopped("queue_release")?;
        let qid = self.check_queue(queue)?;
        if qid.is_busy() {
            return Err(EventDevError::InvalidState(format!(
                "queue {queue} still holds events"
            )));
        }
        let linked = qid.cq_map.clone();
        self.qids[queue as usize] = None;
        for port in linked {
            if let Ok(p) = self.port_mut(port) {
                p.links.retain(|&(q, _)| q != queue);
            }
            self.refresh_port_flags(port);
        }
        self.rebuild_priorities();
        tracing::debug!(dev = %self.name, queue, "queue released");
        Ok(())
    }

    fn rebuild_priorities(&mut self) {
        let mut order: Vec<(u8, u8)> = self
            .qids
            .iter()
            .flatten()
            .map(|q| (q.priority(), q.id))
            .collect();
        order.sort_unstable();
        self.qids_prioritized = order.into_iter().map(|(_, id)| id).collect();
    }

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    /// Set up (or re-set up) a port.
    ///
    /// Re-setup returns every credit the old port held and keeps its links.
    pub fn port_setup(&mut self, port: u8, conf: PortConf) -> EventDevResult<()> {
        let dev_conf = self.require_stopped("port_setup")?;
        let limit = dev_conf.nb_events_limit;
        let nb_queues = dev_conf.nb_event_queues;
        let timeout = Duration::from_nanos(dev_conf.dequeue_timeout_ns);

        let slot = self
            .ports
            .get(port as usize)
            .ok_or(EventDevError::PortOutOfRange(port))?;
        conf.validate(limit)?;
        if slot.as_ref().is_some_and(|p| p.shared.is_claimed()) {
            return Err(EventDevError::PortBusy(port));
        }

        let links = self.teardown_port(port)?.unwrap_or_default();

        let shared = Arc::new(PortShared::new(port, conf, self.pool.clone(), nb_queues, timeout));
        let mut sp = SchedPort::new(shared);
        sp.links = links;
        tracing::debug!(
            dev = %self.name,
            port,
            dequeue_depth = sp.shared.conf.dequeue_depth,
            enqueue_depth = sp.shared.conf.enqueue_depth,
            links = sp.links.len(),
            "port set up"
        );
        self.ports[port as usize] = Some(sp);
        self.refresh_port_flags(port);
        Ok(())
    }

    /// Release a port, unlinking it and returning its credits
    pub fn port_release(&mut self, port: u8) -> EventDevResult<()> {
        self.require_stopped("port_release")?;
        if self.check_port(port)?.shared.is_claimed() {
            return Err(EventDevError::PortBusy(port));
        }
        if let Some(links) = self.teardown_port(port)? {
            for (q, _) in links {
                if let Some(qid) = self.qids.get_mut(q as usize).and_then(Option::as_mut) {
                    qid.unlink(port);
                }
            }
        }
        tracing::debug!(dev = %self.name, port, "port released");
        Ok(())
    }

    /// Claim the worker handle of a port
    pub fn port(&self, port: u8) -> EventDevResult<PortHandle> {
        self.check_port(port)?.shared.claim()
    }

    /// Take a port down, returning exactly the credits it holds.
    ///
    /// Events in its ingress path are discarded, events dispatched to it are
    /// completed so no flow or reorder slot stays blocked on it. Returns the
    /// port's links, `None` if it was not set up.
    fn teardown_port(&mut self, port: u8) -> EventDevResult<Option<Vec<(u8, u8)>>> {
        let Some(mut sp) = self.ports.get_mut(port as usize).and_then(Option::take) else {
            return Ok(None);
        };
        let shared = sp.shared.clone();
        let mut credits = 0u32;
        let mut discarded = 0u64;

        let mut ingress: Vec<Event> = sp.pp_buf.drain(..).collect();
        shared.rx_ring.dequeue_into(&mut ingress, usize::MAX);
        // A fault does not stop the accounting: credits go back first
        let mut fault = None;
        for ev in ingress {
            if ev.op.is_complete() {
                if let Some(entry) = sp.hist.retire(ev.opaque) {
                    if let Err(e) = self.complete_or_fault(port, &entry) {
                        fault.get_or_insert(e);
                    }
                }
            }
            // Release credit already went back to the port on enqueue
            if ev.op.is_valid() {
                credits += 1;
                discarded += 1;
            }
        }

        // Covers events still staged or in the egress ring as well
        for entry in sp.hist.drain() {
            credits += 1;
            if let Err(e) = self.complete_or_fault(port, &entry) {
                fault.get_or_insert(e);
            }
        }
        while shared.cq_ring.try_pop().is_some() {}
        sp.cq_buf.clear();

        credits += shared.credits.swap(0, Ordering::AcqRel);
        self.pool.release(credits);
        self.stats.port_discards += discarded;

        if discarded > 0 {
            tracing::warn!(dev = %self.name, port, discarded, "events discarded on port teardown");
        }
        tracing::debug!(dev = %self.name, port, credits, "port credits returned");
        match fault {
            Some(e) => Err(e),
            None => Ok(Some(sp.links)),
        }
    }

    fn complete_or_fault(&mut self, port: u8, entry: &HistEntry) -> EventDevResult<()> {
        complete_entry(&mut self.qids, port, entry).inspect_err(|e| {
            tracing::error!(dev = %self.name, port, error = %e, "teardown found corrupted state");
            self.fault.get_or_insert_with(|| e.to_string());
        })
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Link a port to queues, returns the number linked.
    ///
    /// An empty `queues` links every set-up queue. `priorities` is either
    /// empty (normal priority) or one entry per queue. The whole batch is
    /// validated before anything changes.
    ///
    /// Link priorities are advisory: they are validated, stored and reported
    /// by [`port_links`](Self::port_links), but dispatch picks among linked
    /// ports by space and round-robin only.
    pub fn port_link(&mut self, port: u8, queues: &[u8], priorities: &[u8]) -> EventDevResult<usize> {
        let sp = self.check_port(port)?;
        let queues: Vec<u8> = if queues.is_empty() {
            self.qids.iter().flatten().map(|q| q.id).collect()
        } else {
            queues.to_vec()
        };
        if !priorities.is_empty() && priorities.len() != queues.len() {
            return Err(EventDevError::InvalidParam(format!(
                "{} priorities for {} queues",
                priorities.len(),
                queues.len()
            )));
        }

        let reject = |reason: String| EventDevError::LinkRejected { port, reason };
        for &q in &queues {
            let qid = self.check_queue(q)?;
            let already = qid.is_linked(port);
            if qid.sched_type == SchedType::Direct {
                if queues.len() > 1 {
                    return Err(reject(format!("single-link queue {q} in a multi-queue batch")));
                }
                if let Some(&other) = qid.cq_map.iter().find(|&&p| p != port) {
                    return Err(reject(format!("single-link queue {q} already linked to port {other}")));
                }
                if sp.linked_qids().any(|l| l != q) {
                    return Err(reject(format!("port already linked, cannot take single-link queue {q}")));
                }
            } else if sp.is_directed && !already {
                return Err(reject(format!("directed port cannot link queue {q}")));
            }
            if !already && qid.cq_map.len() >= MAX_CQS_PER_QID {
                return Err(reject(format!("queue {q} has {MAX_CQS_PER_QID} links")));
            }
        }

        for (i, &q) in queues.iter().enumerate() {
            let priority = priorities.get(i).copied().unwrap_or(PRIORITY_NORMAL);
            if let Some(qid) = self.qids.get_mut(q as usize).and_then(Option::as_mut) {
                qid.link(port);
            }
            let sp = self.port_mut(port)?;
            match sp.links.iter_mut().find(|(l, _)| *l == q) {
                Some(link) => link.1 = priority,
                None => sp.links.push((q, priority)),
            }
        }
        self.refresh_port_flags(port);
        tracing::debug!(dev = %self.name, port, ?queues, "port linked");
        Ok(queues.len())
    }

    /// Unlink a port from queues, returns the number unlinked.
    ///
    /// An empty `queues` unlinks everything. Flows already pinned to the port
    /// keep going to it until they complete.
    pub fn port_unlink(&mut self, port: u8, queues: &[u8]) -> EventDevResult<usize> {
        let sp = self.check_port(port)?;
        let queues: Vec<u8> = if queues.is_empty() {
            sp.linked_qids().collect()
        } else {
            queues.to_vec()
        };
        if let Some(&q) = queues.iter().find(|&&q| q as usize >= self.qids.len()) {
            return Err(EventDevError::QueueOutOfRange(q));
        }

        let mut unlinked = 0;
        for &q in &queues {
            if let Some(qid) = self.qids.get_mut(q as usize).and_then(Option::as_mut) {
                if qid.unlink(port) {
                    unlinked += 1;
                }
            }
        }
        let sp = self.port_mut(port)?;
        sp.links.retain(|(l, _)| !queues.contains(l));
        sp.unlinks_in_progress += unlinked as u32;
        self.refresh_port_flags(port);
        tracing::debug!(dev = %self.name, port, ?queues, unlinked, "port unlinked");
        Ok(unlinked)
    }

    /// Queues linked to a port with their link priorities
    pub fn port_links(&self, port: u8) -> EventDevResult<Vec<(u8, u8)>> {
        Ok(self.check_port(port)?.links.clone())
    }

    /// Unlinks the scheduler has not yet acknowledged
    pub fn port_unlinks_in_progress(&self, port: u8) -> EventDevResult<u32> {
        Ok(self.check_port(port)?.unlinks_in_progress)
    }

    fn refresh_port_flags(&mut self, port: u8) {
        let Some(sp) = self.ports.get(port as usize).and_then(Option::as_ref) else {
            return;
        };
        let mut directed = false;
        let mut ordered = 0;
        for q in sp.linked_qids() {
            match self.qids.get(q as usize).and_then(Option::as_ref).map(|q| q.sched_type) {
                Some(SchedType::Direct) => directed = true,
                Some(SchedType::Ordered) => ordered += 1,
                _ => {}
            }
        }
        if let Some(sp) = self.ports.get_mut(port as usize).and_then(Option::as_mut) {
            sp.is_directed = directed;
            sp.num_ordered_qids = ordered;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(queues: u8, ports: u8) -> EventDev {
        let mut dev = EventDev::new("test", RuntimeParams::default()).unwrap();
        dev.configure(DevConfig {
            nb_event_queues: queues,
            nb_event_ports: ports,
            ..Default::default()
        })
        .unwrap();
        dev
    }

    #[test]
    fn test_lifecycle() {
        let mut dev = configured(1, 1);
        assert_eq!(dev.state(), DevState::Configured);
        assert_eq!(dev.start(), Err(EventDevError::QueueNotSetup(0)));

        dev.queue_setup(0, QueueConf::atomic()).unwrap();
        assert_eq!(dev.start(), Err(EventDevError::PortNotSetup(0)));
        dev.port_setup(0, PortConf::default()).unwrap();
        dev.start().unwrap();
        assert!(dev.is_running());

        assert!(matches!(dev.start(), Err(EventDevError::InvalidState(_))));
        assert!(matches!(dev.queue_setup(0, QueueConf::parallel()), Err(EventDevError::InvalidState(_))));
        assert!(matches!(dev.close(), Err(EventDevError::InvalidState(_))));

        dev.stop();
        dev.close().unwrap();
        assert_eq!(dev.state(), DevState::Unconfigured);
        assert!(dev.config().is_none());
    }

    #[test]
    fn test_with_params() {
        let dev = EventDev::with_params("p", "sched_quanta=64,credit_quanta=8").unwrap();
        assert_eq!(dev.params().sched_quanta, 64);
        assert!(EventDev::with_params("p", "credit_quanta=0").is_err());
    }

    #[test]
    fn test_setup_ranges() {
        let mut dev = configured(2, 2);
        assert_eq!(dev.queue_setup(2, QueueConf::atomic()), Err(EventDevError::QueueOutOfRange(2)));
        assert_eq!(dev.port_setup(5, PortConf::default()), Err(EventDevError::PortOutOfRange(5)));
        assert_eq!(dev.port_link(0, &[0], &[]), Err(EventDevError::PortNotSetup(0)));
        dev.port_setup(0, PortConf::default()).unwrap();
        assert_eq!(dev.port_link(0, &[1], &[]), Err(EventDevError::QueueNotSetup(1)));
        let bad = PortConf { new_event_threshold: 5000, ..Default::default() };
        assert!(matches!(dev.port_setup(1, bad), Err(EventDevError::InvalidConfig(_))));
    }

    #[test]
    fn test_queue_priority_order() {
        let mut dev = configured(3, 1);
        dev.queue_setup(0, QueueConf::atomic().with_priority(200)).unwrap();
        dev.queue_setup(1, QueueConf::atomic().with_priority(10)).unwrap();
        dev.queue_setup(2, QueueConf::atomic().with_priority(10)).unwrap();
        assert_eq!(dev.qids_prioritized, vec![1, 2, 0]);
        dev.queue_release(1).unwrap();
        assert_eq!(dev.qids_prioritized, vec![2, 0]);
    }

    #[test]
    fn test_link_all_and_unlink() {
        let mut dev = configured(3, 2);
        for q in 0..3 {
            dev.queue_setup(q, QueueConf::parallel()).unwrap();
        }
        dev.port_setup(0, PortConf::default()).unwrap();

        assert_eq!(dev.port_link(0, &[], &[]).unwrap(), 3);
        assert_eq!(dev.port_links(0).unwrap(), vec![(0, 128), (1, 128), (2, 128)]);
        assert_eq!(dev.port_link(0, &[1], &[7]).unwrap(), 1);
        assert_eq!(dev.port_links(0).unwrap()[1], (1, 7));

        assert_eq!(dev.port_unlink(0, &[1, 2]).unwrap(), 2);
        assert_eq!(dev.port_unlinks_in_progress(0).unwrap(), 2);
        assert_eq!(dev.port_unlink(0, &[1]).unwrap(), 0);
        assert_eq!(dev.port_links(0).unwrap(), vec![(0, 128)]);
        assert_eq!(dev.port_unlink(0, &[]).unwrap(), 1);
        assert_eq!(dev.port_unlink(0, &[9]), Err(EventDevError::QueueOutOfRange(9)));
        assert!(matches!(dev.port_link(0, &[0, 1], &[1]), Err(EventDevError::InvalidParam(_))));
    }

    #[test]
    fn test_single_link_rules() {
        let mut dev = configured(3, 2);
        dev.queue_setup(0, QueueConf::single_link()).unwrap();
        dev.queue_setup(1, QueueConf::atomic()).unwrap();
        dev.queue_setup(2, QueueConf::single_link()).unwrap();
        dev.port_setup(0, PortConf::default()).unwrap();
        dev.port_setup(1, PortConf::default()).unwrap();

        // Single-link queue may not ride in a batch
        assert!(matches!(dev.port_link(0, &[0, 1], &[]), Err(EventDevError::LinkRejected { .. })));
        assert!(dev.port_links(0).unwrap().is_empty());

        assert_eq!(dev.port_link(0, &[0], &[]).unwrap(), 1);
        // Relinking the same pair is fine
        assert_eq!(dev.port_link(0, &[0], &[]).unwrap(), 1);
        // Second port on a single-link queue
        assert!(matches!(dev.port_link(1, &[0], &[]), Err(EventDevError::LinkRejected { port: 1, .. })));
        // Directed port takes nothing else
        assert!(matches!(dev.port_link(0, &[1], &[]), Err(EventDevError::LinkRejected { .. })));
        assert!(matches!(dev.port_link(0, &[2], &[]), Err(EventDevError::LinkRejected { .. })));

        // A port with links cannot become directed
        dev.port_link(1, &[1], &[]).unwrap();
        assert!(matches!(dev.port_link(1, &[2], &[]), Err(EventDevError::LinkRejected { .. })));

        dev.port_unlink(0, &[]).unwrap();
        dev.port_link(0, &[1], &[]).unwrap();
    }

    #[test]
    fn test_port_claim_blocks_setup() {
        let mut dev = configured(1, 1);
        dev.queue_setup(0, QueueConf::atomic()).unwrap();
        dev.port_setup(0, PortConf::default()).unwrap();
        let handle = dev.port(0).unwrap();
        assert_eq!(dev.port(0).unwrap_err(), EventDevError::PortBusy(0));
        assert_eq!(dev.port_setup(0, PortConf::default()), Err(EventDevError::PortBusy(0)));
        assert_eq!(dev.port_release(0), Err(EventDevError::PortBusy(0)));
        assert_eq!(dev.close(), Err(EventDevError::PortBusy(0)));
        drop(handle);
        dev.port_release(0).unwrap();
        assert_eq!(dev.port(0).unwrap_err(), EventDevError::PortNotSetup(0));
    }

    #[test]
    fn test_resetup_keeps_links() {
        let mut dev = configured(2, 1);
        dev.queue_setup(0, QueueConf::atomic()).unwrap();
        dev.queue_setup(1, QueueConf::ordered(4)).unwrap();
        dev.port_setup(0, PortConf::default()).unwrap();
        dev.port_link(0, &[0, 1], &[]).unwrap();
        assert_eq!(dev.check_port(0).unwrap().num_ordered_qids, 1);

        dev.port_setup(0, PortConf { dequeue_depth: 64, ..Default::default() }).unwrap();
        assert_eq!(dev.port_links(0).unwrap().len(), 2);
        assert_eq!(dev.check_port(0).unwrap().num_ordered_qids, 1);
        assert!(dev.check_queue(1).unwrap().is_linked(0));

        // Queue re-setup keeps its link map too
        dev.queue_setup(1, QueueConf::parallel()).unwrap();
        assert!(dev.check_queue(1).unwrap().is_linked(0));
        assert_eq!(dev.check_port(0).unwrap().num_ordered_qids, 0);

        dev.port_release(0).unwrap();
        assert!(!dev.check_queue(0).unwrap().is_linked(0));
    }

    #[test]
    fn test_reconfigure_resets() {
        let mut dev = configured(2, 2);
        dev.queue_setup(0, QueueConf::atomic()).unwrap();
        dev.configure(DevConfig { nb_events_limit: 16, ..Default::default() }).unwrap();
        assert_eq!(dev.qids.len(), 1);
        assert!(dev.qids[0].is_none());
        assert_eq!(dev.pool.limit(), 16);
    }
}
