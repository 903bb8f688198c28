//! Device, queue and port configuration
//!
//! Plain structs with defaults. Each one validates itself against the device
//! limits before the control plane applies it.

use evdev_common::{EventDevError, EventDevResult, SchedType, PRIORITY_NORMAL};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{
    DEQUEUE_DEPTH_MAX, ENQUEUE_DEPTH_MAX, FLOWS_MAX, INFLIGHT_EVENTS_MAX, IQS_MAX, PORTS_MAX,
    QIDS_MAX, REORDER_WINDOW_MAX,
};

/// Largest accepted scheduling budget per queue per pass
pub const SCHED_QUANTA_MAX: u32 = 4096;
/// Largest accepted ingress pull burst
pub const DEQ_BURST_MAX: u32 = 256;
/// Largest accepted internal queue depth
pub const IQ_DEPTH_MAX: u32 = 1 << 16;

/// Scheduler tuning parameters, parsed from a `key=value,key=value` string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeParams {
    /// NUMA node hint for allocations (accepted, not acted upon)
    pub numa_node: i32,
    /// Events scheduled per queue per pass
    pub sched_quanta: u32,
    /// Credits borrowed from the device pool at a time
    pub credit_quanta: u32,
    /// Minimum staged events before an egress flush
    pub min_burst: u32,
    /// Events pulled from each ingress ring per round
    pub deq_burst: u32,
    /// Pull each ingress ring only once per pass
    pub refill_once: bool,
    /// Capacity of each internal queue
    pub iq_depth: u32,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            numa_node: -1,
            sched_quanta: 128,
            credit_quanta: 32,
            min_burst: 1,
            deq_burst: 32,
            refill_once: false,
            iq_depth: 1024,
        }
    }
}

impl RuntimeParams {
    /// Check every parameter against its accepted range
    pub fn validate(&self) -> EventDevResult<()> {
        check_range("sched_quanta", self.sched_quanta, 1, SCHED_QUANTA_MAX)?;
        check_range("credit_quanta", self.credit_quanta, 1, INFLIGHT_EVENTS_MAX)?;
        check_range("min_burst", self.min_burst, 1, DEQUEUE_DEPTH_MAX)?;
        check_range("deq_burst", self.deq_burst, 1, DEQ_BURST_MAX)?;
        check_range("iq_depth", self.iq_depth, 1, IQ_DEPTH_MAX)?;
        Ok(())
    }
}

fn check_range(key: &str, value: u32, min: u32, max: u32) -> EventDevResult<()> {
    if value < min || value > max {
        return Err(EventDevError::InvalidParam(format!(
            "{key}={value} outside {min}..={max}"
        )));
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> EventDevResult<T> {
    value
        .parse()
        .map_err(|_| EventDevError::InvalidParam(format!("{key}: cannot parse {value:?}")))
}

impl FromStr for RuntimeParams {
    type Err = EventDevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut params = RuntimeParams::default();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| EventDevError::InvalidParam(format!("expected key=value, got {pair:?}")))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "numa_node" => params.numa_node = parse_value(key, value)?,
                "sched_quanta" => params.sched_quanta = parse_value(key, value)?,
                "credit_quanta" => params.credit_quanta = parse_value(key, value)?,
                "min_burst" => params.min_burst = parse_value(key, value)?,
                "deq_burst" => params.deq_burst = parse_value(key, value)?,
                "refill_once" => {
                    params.refill_once = match value {
                        "1" | "true" => true,
                        "0" | "false" => false,
                        _ => return Err(EventDevError::InvalidParam(format!("{key}: cannot parse {value:?}"))),
                    }
                }
                "iq_depth" => params.iq_depth = parse_value(key, value)?,
                _ => return Err(EventDevError::InvalidParam(format!("unknown key {key:?}"))),
            }
        }
        params.validate()?;
        Ok(params)
    }
}

/// Device-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    /// Queues to configure
    pub nb_event_queues: u8,
    /// Ports to configure
    pub nb_event_ports: u8,
    /// Total credits in the device
    pub nb_events_limit: u32,
    /// Default timeout for [`PortHandle::dequeue_wait`](crate::PortHandle::dequeue_wait)
    pub dequeue_timeout_ns: u64,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            nb_event_queues: 1,
            nb_event_ports: 1,
            nb_events_limit: INFLIGHT_EVENTS_MAX,
            dequeue_timeout_ns: 0,
        }
    }
}

impl DevConfig {
    /// Validate against device limits
    pub fn validate(&self) -> EventDevResult<()> {
        if self.nb_event_queues == 0 || self.nb_event_queues as usize > QIDS_MAX {
            return Err(EventDevError::InvalidConfig(format!(
                "nb_event_queues {} outside 1..={QIDS_MAX}",
                self.nb_event_queues
            )));
        }
        if self.nb_event_ports == 0 || self.nb_event_ports as usize > PORTS_MAX {
            return Err(EventDevError::InvalidConfig(format!(
                "nb_event_ports {} outside 1..={PORTS_MAX}",
                self.nb_event_ports
            )));
        }
        if self.nb_events_limit == 0 || self.nb_events_limit > INFLIGHT_EVENTS_MAX {
            return Err(EventDevError::InvalidConfig(format!(
                "nb_events_limit {} outside 1..={INFLIGHT_EVENTS_MAX}",
                self.nb_events_limit
            )));
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// Queue configuration flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct QueueCfgFlags: u32 {
        /// Queue accepts every scheduling type (not supported)
        const ALL_TYPES = 0x01;
        /// Queue links to exactly one port
        const SINGLE_LINK = 0x02;
    }
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConf {
    /// Scheduling type
    pub schedule_type: SchedType,
    /// Configuration flags
    pub flags: QueueCfgFlags,
    /// Flow table size for atomic queues
    pub nb_atomic_flows: u32,
    /// Reorder window for ordered queues
    pub nb_atomic_order_sequences: u32,
    /// Queue priority, 0 is highest
    pub priority: u8,
}

impl Default for QueueConf {
    fn default() -> Self {
        Self {
            schedule_type: SchedType::Atomic,
            flags: QueueCfgFlags::empty(),
            nb_atomic_flows: FLOWS_MAX,
            nb_atomic_order_sequences: 128,
            priority: PRIORITY_NORMAL,
        }
    }
}

impl QueueConf {
    /// Atomic queue with defaults
    pub fn atomic() -> Self {
        Self::default()
    }

    /// Ordered queue with a reorder window of `window`
    pub fn ordered(window: u32) -> Self {
        Self {
            schedule_type: SchedType::Ordered,
            nb_atomic_order_sequences: window,
            ..Self::default()
        }
    }

    /// Parallel queue
    pub fn parallel() -> Self {
        Self {
            schedule_type: SchedType::Parallel,
            ..Self::default()
        }
    }

    /// Single-link queue
    pub fn single_link() -> Self {
        Self {
            flags: QueueCfgFlags::SINGLE_LINK,
            ..Self::default()
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Scheduling type the queue actually runs with
    pub fn effective_type(&self) -> SchedType {
        if self.flags.contains(QueueCfgFlags::SINGLE_LINK) {
            SchedType::Direct
        } else {
            self.schedule_type
        }
    }

    /// Validate against device limits
    pub fn validate(&self) -> EventDevResult<()> {
        if self.flags.contains(QueueCfgFlags::ALL_TYPES) {
            return Err(EventDevError::InvalidConfig(
                "queues accepting all schedule types are not supported".into(),
            ));
        }
        match self.effective_type() {
            SchedType::Atomic if self.nb_atomic_flows == 0 || self.nb_atomic_flows > FLOWS_MAX => {
                Err(EventDevError::InvalidConfig(format!(
                    "nb_atomic_flows {} outside 1..={FLOWS_MAX}",
                    self.nb_atomic_flows
                )))
            }
            SchedType::Ordered
                if self.nb_atomic_order_sequences == 0
                    || self.nb_atomic_order_sequences > REORDER_WINDOW_MAX =>
            {
                Err(EventDevError::InvalidConfig(format!(
                    "nb_atomic_order_sequences {} outside 1..={REORDER_WINDOW_MAX}",
                    self.nb_atomic_order_sequences
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConf {
    /// Egress ring depth, the most events a worker can have waiting
    pub dequeue_depth: u32,
    /// Ingress depth, the most events a worker can have waiting for the
    /// scheduler. Need not be a power of two.
    pub enqueue_depth: u32,
    /// `New` events are refused while device inflights exceed this
    pub new_event_threshold: u32,
    /// Release the previous burst automatically on the next dequeue
    pub implicit_release: bool,
}

impl Default for PortConf {
    fn default() -> Self {
        Self {
            dequeue_depth: 16,
            enqueue_depth: 128,
            new_event_threshold: 1024,
            implicit_release: true,
        }
    }
}

impl PortConf {
    /// Validate against device limits and the configured credit total
    pub fn validate(&self, nb_events_limit: u32) -> EventDevResult<()> {
        if self.dequeue_depth == 0 || self.dequeue_depth > DEQUEUE_DEPTH_MAX {
            return Err(EventDevError::InvalidConfig(format!(
                "dequeue_depth {} outside 1..={DEQUEUE_DEPTH_MAX}",
                self.dequeue_depth
            )));
        }
        if self.enqueue_depth == 0 || self.enqueue_depth > ENQUEUE_DEPTH_MAX {
            return Err(EventDevError::InvalidConfig(format!(
                "enqueue_depth {} outside 1..={ENQUEUE_DEPTH_MAX}",
                self.enqueue_depth
            )));
        }
        if self.new_event_threshold == 0 || self.new_event_threshold > nb_events_limit {
            return Err(EventDevError::InvalidConfig(format!(
                "new_event_threshold {} outside 1..={nb_events_limit}",
                self.new_event_threshold
            )));
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// Device capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DevCaps: u32 {
        /// Queues have priorities
        const QUEUE_QOS = 1 << 0;
        /// Events have priorities
        const EVENT_QOS = 1 << 1;
        /// Burst enqueue and dequeue
        const BURST_MODE = 1 << 2;
        /// Implicit release can be turned off per port
        const IMPLICIT_RELEASE_DISABLE = 1 << 3;
        /// Links can change while the device runs
        const RUNTIME_PORT_LINK = 1 << 4;
        /// A port can be linked to several queues
        const MULTIPLE_QUEUE_PORT = 1 << 5;
        /// Flow id is carried through unchanged
        const CARRY_FLOW_ID = 1 << 6;
        /// Completions can be split into fragments
        const PARTIAL_COMPLETION = 1 << 7;
    }
}

/// Device limits and capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevInfo {
    /// Driver name
    pub driver_name: String,
    /// Maximum queues
    pub max_event_queues: u8,
    /// Maximum flows per atomic queue
    pub max_event_queue_flows: u32,
    /// Distinct queue priority levels
    pub max_event_queue_priority_levels: u8,
    /// Distinct event priority levels
    pub max_event_priority_levels: u8,
    /// Maximum ports
    pub max_event_ports: u8,
    /// Maximum egress depth
    pub max_event_port_dequeue_depth: u32,
    /// Maximum ingress depth
    pub max_event_port_enqueue_depth: u32,
    /// Maximum device credits
    pub max_num_events: u32,
    /// Maximum fragments per completion
    pub max_fragments: u32,
    /// Capabilities
    pub caps: DevCaps,
}

impl Default for DevInfo {
    fn default() -> Self {
        Self {
            driver_name: "event_sw".into(),
            max_event_queues: QIDS_MAX as u8,
            max_event_queue_flows: FLOWS_MAX,
            max_event_queue_priority_levels: u8::MAX,
            max_event_priority_levels: IQS_MAX as u8,
            max_event_ports: PORTS_MAX as u8,
            max_event_port_dequeue_depth: DEQUEUE_DEPTH_MAX,
            max_event_port_enqueue_depth: ENQUEUE_DEPTH_MAX,
            max_num_events: INFLIGHT_EVENTS_MAX,
            max_fragments: crate::FRAGMENTS_MAX as u32,
            caps: DevCaps::all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_params_parse() {
        let p: RuntimeParams = "sched_quanta=64, credit_quanta=16,refill_once=1,iq_depth=512"
            .parse()
            .unwrap();
        assert_eq!(p.sched_quanta, 64);
        assert_eq!(p.credit_quanta, 16);
        assert!(p.refill_once);
        assert_eq!(p.iq_depth, 512);
        assert_eq!(p.deq_burst, 32);

        assert_eq!("".parse::<RuntimeParams>().unwrap(), RuntimeParams::default());
    }

    #[test]
    fn test_runtime_params_reject() {
        assert!(matches!(
            "bogus=1".parse::<RuntimeParams>(),
            Err(EventDevError::InvalidParam(_))
        ));
        assert!("sched_quanta".parse::<RuntimeParams>().is_err());
        assert!("sched_quanta=abc".parse::<RuntimeParams>().is_err());
        assert!("sched_quanta=0".parse::<RuntimeParams>().is_err());
        assert!("refill_once=maybe".parse::<RuntimeParams>().is_err());
    }

    #[test]
    fn test_dev_config_limits() {
        assert!(DevConfig::default().validate().is_ok());
        let bad = DevConfig { nb_event_queues: 0, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = DevConfig { nb_event_ports: 65, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = DevConfig { nb_events_limit: INFLIGHT_EVENTS_MAX + 1, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_queue_conf() {
        assert_eq!(QueueConf::single_link().effective_type(), SchedType::Direct);
        assert_eq!(QueueConf::ordered(8).effective_type(), SchedType::Ordered);

        let all = QueueConf { flags: QueueCfgFlags::ALL_TYPES, ..Default::default() };
        assert!(all.validate().is_err());

        assert!(QueueConf::ordered(0).validate().is_err());
        assert!(QueueConf::ordered(REORDER_WINDOW_MAX).validate().is_ok());
        let flows = QueueConf { nb_atomic_flows: FLOWS_MAX + 1, ..Default::default() };
        assert!(flows.validate().is_err());
        // Flow count is irrelevant to parallel queues
        let parallel = QueueConf { nb_atomic_flows: 0, ..QueueConf::parallel() };
        assert!(parallel.validate().is_ok());
    }

    #[test]
    fn test_port_conf() {
        assert!(PortConf::default().validate(4096).is_ok());
        assert!(PortConf::default().validate(512).is_err());
        let deep = PortConf { dequeue_depth: DEQUEUE_DEPTH_MAX + 1, ..Default::default() };
        assert!(deep.validate(4096).is_err());
    }

    #[test]
    fn test_config_serde() {
        let conf = QueueConf::single_link().with_priority(3);
        let json = serde_json::to_string(&conf).unwrap();
        let back: QueueConf = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conf);

        let partial: PortConf = serde_json::from_str(r#"{"dequeue_depth": 64}"#).unwrap();
        assert_eq!(partial.dequeue_depth, 64);
        assert!(partial.implicit_release);
    }

    #[test]
    fn test_dev_info() {
        let info = DevInfo::default();
        assert!(info.caps.contains(DevCaps::RUNTIME_PORT_LINK));
        assert_eq!(info.max_event_ports as usize, PORTS_MAX);
    }
}
