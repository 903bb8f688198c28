//! Global Credit Pool
//!
//! Bounds the number of events alive inside the device. Ports borrow credits
//! in quanta and keep them locally, so the shared counter is touched once per
//! quantum instead of once per event.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU32, Ordering};

/// Device-wide credit counter
#[derive(Debug)]
pub struct CreditPool {
    /// Credits currently borrowed by ports (held locally or carried by events)
    inflights: CachePadded<AtomicU32>,
    limit: u32,
    quanta: u32,
}

impl CreditPool {
    /// Create a pool of `limit` credits handed out `quanta` at a time
    pub fn new(limit: u32, quanta: u32) -> Self {
        Self {
            inflights: CachePadded::new(AtomicU32::new(0)),
            limit,
            quanta: quanta.max(1),
        }
    }

    /// Total credits
    #[inline]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Borrow granularity
    #[inline]
    pub fn quanta(&self) -> u32 {
        self.quanta
    }

    /// Credits currently borrowed
    #[inline]
    pub fn inflights(&self) -> u32 {
        self.inflights.load(Ordering::Acquire)
    }

    /// Credits left in the pool
    #[inline]
    pub fn available(&self) -> u32 {
        self.limit.saturating_sub(self.inflights())
    }

    /// Borrow up to `want` credits in one atomic update, returns the number granted
    pub fn acquire(&self, want: u32) -> u32 {
        let mut current = self.inflights.load(Ordering::Relaxed);
        loop {
            let grant = want.min(self.limit.saturating_sub(current));
            if grant == 0 {
                return 0;
            }
            match self.inflights.compare_exchange_weak(
                current,
                current + grant,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return grant,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return credits to the pool
    #[inline]
    pub fn release(&self, credits: u32) {
        if credits == 0 {
            return;
        }
        let prev = self.inflights.fetch_sub(credits, Ordering::AcqRel);
        debug_assert!(prev >= credits, "credit pool underflow: {prev} < {credits}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_clamps_to_limit() {
        let pool = CreditPool::new(16, 32);
        assert_eq!(pool.acquire(32), 16);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.acquire(1), 0);

        pool.release(4);
        assert_eq!(pool.inflights(), 12);
        assert_eq!(pool.acquire(32), 4);
    }

    #[test]
    fn test_release_restores_availability() {
        let pool = CreditPool::new(100, 10);
        assert_eq!(pool.acquire(10), 10);
        assert_eq!(pool.acquire(25), 25);
        assert_eq!(pool.available(), 65);
        pool.release(35);
        assert_eq!(pool.inflights(), 0);
        pool.release(0);
        assert_eq!(pool.available(), 100);
    }

    #[test]
    fn test_concurrent_borrowers_never_exceed_limit() {
        let pool = Arc::new(CreditPool::new(1000, 7));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let mut held = 0;
                    for _ in 0..500 {
                        held += pool.acquire(7);
                    }
                    held
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1000);
        assert_eq!(pool.inflights(), 1000);
    }
}
