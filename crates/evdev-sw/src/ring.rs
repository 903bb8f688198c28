//! Lock-free bounded event ring
//!
//! Moves events between worker threads and the scheduler core. Each port owns
//! two of these:
//! - the ingress ring, written by workers and read by the scheduler (MPSC)
//! - the egress ring, written by the scheduler and read by workers (SPMC)
//!
//! # Design
//!
//! - Power-of-two slot array addressed through a mask
//! - Per-slot sequence numbers (Lamport style) publish each write only after
//!   the data is in place, and each read only after the data has been copied out
//! - Producers CAS on `head`, consumers CAS on `tail`, so the same ring is safe
//!   for any mix of producers and consumers
//! - `head` and `tail` live on separate cache lines

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

/// One ring slot.
///
/// - sequence == pos: free for the producer claiming `pos`
/// - sequence == pos + 1: written, readable by the consumer claiming `pos`
/// - sequence == pos + capacity: consumed, free for the next lap
struct Slot<T> {
    sequence: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer/multi-consumer ring
pub struct EventRing<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    mask: u64,
    capacity: u64,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for EventRing<T> {}
unsafe impl<T: Send> Sync for EventRing<T> {}

impl<T> EventRing<T> {
    /// Create a ring holding at least `capacity` items (rounded up to a power of two)
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let slots = (0..cap)
            .map(|i| Slot {
                sequence: AtomicU64::new(i as u64),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            mask: (cap - 1) as u64,
            capacity: cap as u64,
            slots,
        }
    }

    /// Ring capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Items currently queued (a snapshot under concurrency)
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity) as usize
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots (a snapshot under concurrency)
    #[inline]
    pub fn free_count(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Try to push one item. Returns it back when the ring is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave us exclusive ownership of this slot
                        // until we publish the new sequence.
                        unsafe {
                            (*slot.data.get()).write(value);
                        }
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Slot still holds last lap's item
                return Err(value);
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to pop one item
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i64;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the producer published this slot (sequence == pos + 1)
                        // and the CAS made us its only reader.
                        let value = unsafe { (*slot.data.get()).assume_init_read() };
                        slot.sequence
                            .store(pos.wrapping_add(self.capacity), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop up to `out.len()` items in FIFO order, returns the count
    pub fn dequeue_burst(&self, out: &mut [T]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.try_pop() {
                Some(v) => {
                    out[n] = v;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Pop up to `max` items, appending them to `out`
    pub fn dequeue_into<E: Extend<T>>(&self, out: &mut E, max: usize) -> usize {
        let mut n = 0;
        out.extend(std::iter::from_fn(|| {
            if n == max {
                return None;
            }
            let v = self.try_pop()?;
            n += 1;
            Some(v)
        }));
        n
    }
}

impl<T: Copy> EventRing<T> {
    /// Push items in order until the ring is full, returns the count pushed
    pub fn enqueue_burst(&self, items: &[T]) -> usize {
        items
            .iter()
            .take_while(|item| self.try_push(**item).is_ok())
            .count()
    }
}

impl<T> std::fmt::Debug for EventRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRing")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Drop for EventRing<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let mut pos = *self.tail.get_mut();
        while pos != head {
            let slot = &mut self.slots[(pos & self.mask) as usize];
            // Only fully published slots hold initialized data
            if *slot.sequence.get_mut() == pos.wrapping_add(1) {
                // SAFETY: exclusive access, sequence confirms the write completed
                unsafe {
                    slot.data.get_mut().assume_init_drop();
                }
            }
            pos = pos.wrapping_add(1);
        }
    }
}
