//! Software Event Device
//!
//! A centralized event scheduler for multi-core pipelines. Worker threads
//! enqueue events through ports; one scheduler thread spreads them over the
//! linked ports according to each queue's scheduling type.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        EVENT DEVICE                              │
//! │                                                                  │
//! │  Worker 0            Worker 1            Worker N                │
//! │  PortHandle          PortHandle          PortHandle              │
//! │    │      ▲            │      ▲            │      ▲              │
//! │    ▼      │            ▼      │            ▼      │              │
//! │  ┌────┐ ┌────┐       ┌────┐ ┌────┐       ┌────┐ ┌────┐           │
//! │  │ rx │ │ cq │       │ rx │ │ cq │       │ rx │ │ cq │           │
//! │  └─┬──┘ └─▲──┘       └─┬──┘ └─▲──┘       └─┬──┘ └─▲──┘           │
//! │    │      │            │      │            │      │              │
//! │  ┌─▼──────┴────────────▼──────┴────────────▼──────┴───────────┐  │
//! │  │                 SCHEDULER  (EventDev::schedule)            │  │
//! │  │                                                            │  │
//! │  │  pull ──► QID [IQ0..IQ3] ──► atomic / ordered / parallel   │  │
//! │  │   │        flow table          / direct dispatch           │  │
//! │  │   └──► completions ──► unpin flows, reorder buffer flush   │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │                                                                  │
//! │  CreditPool: every event in the device holds one credit          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Scheduling types
//!
//! | Type | Guarantee |
//! |------|-----------|
//! | Atomic | One port per flow while any event of the flow is outstanding |
//! | Ordered | Any port; downstream sees events in original queue order |
//! | Parallel | Any port; no ordering |
//! | Direct | The single linked port |
//!
//! # Example
//!
//! ```
//! use evdev_sw::{DevConfig, Event, EventDev, PortConf, QueueConf, RuntimeParams};
//!
//! let mut dev = EventDev::new("evdev0", RuntimeParams::default()).unwrap();
//! dev.configure(DevConfig { nb_event_queues: 1, nb_event_ports: 1, ..Default::default() }).unwrap();
//! dev.queue_setup(0, QueueConf::atomic()).unwrap();
//! dev.port_setup(0, PortConf::default()).unwrap();
//! dev.port_link(0, &[0], &[]).unwrap();
//! dev.start().unwrap();
//!
//! let mut port = dev.port(0).unwrap();
//! assert_eq!(port.enqueue_new_burst(&[Event::new(0, 7, 42)]), 1);
//! dev.schedule().unwrap();
//!
//! let mut out = [Event::default(); 4];
//! assert_eq!(port.dequeue_burst(&mut out), 1);
//! assert_eq!(out[0].payload, 42);
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod credit;
pub mod device;
pub mod flow;
pub mod iq;
pub mod port;
pub mod qid;
pub mod reorder;
pub mod ring;
mod sched;
pub mod service;
pub mod stats;


pub use config::{
    DevCaps, DevConfig, DevInfo, PortConf, QueueCfgFlags, QueueConf, RuntimeParams,
};
pub use credit::CreditPool;
pub use device::{DevState, EventDev};
pub use port::PortHandle;
pub use service::{SchedulerService, ServiceConfig};
pub use stats::{
    CreditSnapshot, DevStatsSnapshot, PortStatsSnapshot, QueueStatsSnapshot, StatsSnapshot,
    XstatsMode,
};

pub use evdev_common::{Event, EventDevError, EventDevResult, EventOp, SchedType};

/// Maximum event queues per device
pub const QIDS_MAX: usize = 128;

/// Maximum ports per device
pub const PORTS_MAX: usize = 64;

/// Priority bands (internal queues) per event queue
pub const IQS_MAX: usize = 4;

/// Maximum atomic flows per queue
pub const FLOWS_MAX: u32 = 16384;

/// Maximum credits (events in flight) per device
pub const INFLIGHT_EVENTS_MAX: u32 = 4096;

/// Maximum port dequeue depth
pub const DEQUEUE_DEPTH_MAX: u32 = 128;

/// Maximum port ingress ring size
pub const ENQUEUE_DEPTH_MAX: u32 = 4096;

/// Dispatched-but-uncompleted events tracked per port
pub const PORT_HIST_LIST: usize = 4096;

/// Maximum events in one reorder slot
pub const FRAGMENTS_MAX: usize = 16;

/// Maximum reorder window per ordered queue
pub const REORDER_WINDOW_MAX: u32 = 4096;

/// Maximum events accepted by one enqueue call
pub const ENQUEUE_MAX_BURST: usize = 64;

/// Maximum ports linked to one queue
pub const MAX_CQS_PER_QID: usize = PORTS_MAX;
