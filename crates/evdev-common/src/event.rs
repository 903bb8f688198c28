//! Event descriptors
//!
//! An [`Event`] is a 24-byte work descriptor. The scheduler reads the
//! routing fields (`queue_id`, `priority`, `flow_id`, `op`) and carries its
//! own bookkeeping in `opaque`; `payload` is never interpreted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest event or queue priority
pub const PRIORITY_HIGHEST: u8 = 0;
/// Default event or queue priority
pub const PRIORITY_NORMAL: u8 = 128;

/// Scheduling discipline of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchedType {
    /// One port per flow while any event of the flow is in flight
    #[default]
    Atomic = 0,
    /// Completions are forwarded downstream in dispatch order
    Ordered = 1,
    /// Free load balancing, no guarantees
    Parallel = 2,
    /// Single-link pass-through to exactly one port
    Direct = 3,
}

impl fmt::Display for SchedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SchedType::Atomic => "atomic",
            SchedType::Ordered => "ordered",
            SchedType::Parallel => "parallel",
            SchedType::Direct => "direct",
        };
        write!(f, "{label}")
    }
}

/// What an enqueued event asks the scheduler to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventOp {
    /// Inject a new event; consumes one credit
    #[default]
    New = 0,
    /// Complete a dequeued event and send it to the next queue
    Forward = 1,
    /// Complete a dequeued event without forwarding it; returns one credit
    Release = 2,
    /// Emit one fragment of a dequeued event without completing it;
    /// consumes one credit for the extra event
    Partial = 3,
}

impl EventOp {
    /// Whether this op carries an event into a queue
    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        !matches!(self, EventOp::Release)
    }

    /// Whether this op completes a previously dequeued event
    #[inline(always)]
    pub const fn is_complete(self) -> bool {
        matches!(self, EventOp::Forward | EventOp::Release)
    }

    /// Whether this op refers to a previously dequeued event
    #[inline(always)]
    pub const fn needs_token(self) -> bool {
        !matches!(self, EventOp::New)
    }
}

/// Event descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct Event {
    /// Application payload (pointer, index or handle)
    pub payload: u64,
    /// Flow identifier for atomic scheduling
    pub flow_id: u32,
    /// Scheduler bookkeeping; preserve it when forwarding or releasing
    pub opaque: u32,
    /// Destination queue
    pub queue_id: u8,
    /// Event priority, 0 is highest
    pub priority: u8,
    /// Scheduling type the event was last dispatched under
    pub sched_type: SchedType,
    /// Requested operation
    pub op: EventOp,
}

impl Event {
    /// Create a new event for `queue_id`
    #[inline]
    pub const fn new(queue_id: u8, flow_id: u32, payload: u64) -> Self {
        Self {
            payload,
            flow_id,
            opaque: 0,
            queue_id,
            priority: PRIORITY_NORMAL,
            sched_type: SchedType::Atomic,
            op: EventOp::New,
        }
    }

    /// Set priority
    #[inline]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Turn a dequeued event into a forward to `queue_id`
    #[inline]
    pub const fn forward(mut self, queue_id: u8) -> Self {
        self.queue_id = queue_id;
        self.op = EventOp::Forward;
        self
    }

    /// Turn a dequeued event into a fragment for `queue_id`
    #[inline]
    pub const fn partial(mut self, queue_id: u8) -> Self {
        self.queue_id = queue_id;
        self.op = EventOp::Partial;
        self
    }

    /// Turn a dequeued event into a release
    #[inline]
    pub const fn release(mut self) -> Self {
        self.op = EventOp::Release;
        self
    }
}
