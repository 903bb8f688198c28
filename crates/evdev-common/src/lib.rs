//! Event Device Common - Shared types for the software event scheduler
//!
//! This crate provides the value types that cross the boundary between
//! worker threads and the scheduler core:
//! - Events and their scheduling/operation kinds
//! - Error handling for control plane and scheduler faults
//! - Lock-free counters and monotonic timestamps for statistics
//!
//! Events are small `Copy` values. They are moved through bounded rings by
//! value, so no allocation happens on the data path.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event;

pub use error::*;
pub use event::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic nanosecond timestamp, relative to the first use in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(u64);

fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

impl Timestamp {
    /// Get current timestamp
    #[inline(always)]
    pub fn now() -> Self {
        Self(origin().elapsed().as_nanos() as u64)
    }

    /// Get nanoseconds value
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Nanoseconds elapsed since this timestamp
    #[inline(always)]
    pub fn elapsed_nanos(&self) -> u64 {
        Self::now().0.saturating_sub(self.0)
    }
}

/// High-performance counter for lock-free statistics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Overwrite the value (used by statistics reset)
    #[inline(always)]
    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed)
    }
}
