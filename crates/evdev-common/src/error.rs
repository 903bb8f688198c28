//! Error types for the event device

use thiserror::Error;

/// Event device error type
///
/// Backpressure (full rings, exhausted credits, saturated reorder windows) is
/// never reported through this type: data-plane calls return the number of
/// events that were accepted or dequeued instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventDevError {
    /// Device, queue or port configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime parameter string could not be parsed
    #[error("invalid runtime parameter: {0}")]
    InvalidParam(String),

    /// Queue id outside the configured range
    #[error("queue {0} out of range")]
    QueueOutOfRange(u8),

    /// Port id outside the configured range
    #[error("port {0} out of range")]
    PortOutOfRange(u8),

    /// Queue has not been set up
    #[error("queue {0} not set up")]
    QueueNotSetup(u8),

    /// Port has not been set up
    #[error("port {0} not set up")]
    PortNotSetup(u8),

    /// Link topology rejected
    #[error("link rejected for port {port}: {reason}")]
    LinkRejected {
        /// Port being linked
        port: u8,
        /// Why the link was refused
        reason: String,
    },

    /// Operation not allowed in the current device state
    #[error("invalid device state: {0}")]
    InvalidState(String),

    /// Port is claimed by a worker handle
    #[error("port {0} is in use by a worker handle")]
    PortBusy(u8),

    /// Scheduler bookkeeping found corrupted flow, history or reorder state
    #[error("scheduler invariant violated: {0}")]
    Invariant(String),

    /// Scheduler refused to run after an earlier invariant violation
    #[error("scheduler halted after fault: {0}")]
    Faulted(String),

    /// Scheduler service thread is no longer running
    #[error("scheduler service stopped")]
    ServiceStopped,

    /// Scheduler service thread could not be spawned
    #[error("failed to spawn scheduler service: {0}")]
    SpawnFailed(String),
}

/// Result type for the event device
pub type EventDevResult<T> = Result<T, EventDevError>;
