//! Internal Queues
//!
//! Fixed-capacity FIFO of events for one priority level of one queue.
//! Only the scheduler thread touches an IQ, so there is no synchronization:
//! indices are plain integers and the storage is a power-of-two array.

/// Single-threaded bounded FIFO
#[derive(Debug, Clone)]
pub struct InternalQueue<T> {
    buf: Box<[T]>,
    /// Next slot to read
    head: usize,
    /// Next slot to write
    tail: usize,
    mask: usize,
}

impl<T: Copy + Default> InternalQueue<T> {
    /// Create a queue holding at least `capacity` items (rounded up to a power of two)
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1).next_power_of_two();
        Self {
            buf: vec![T::default(); cap].into_boxed_slice(),
            head: 0,
            tail: 0,
            mask: cap - 1,
        }
    }

    /// Queue capacity
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Items queued
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head)
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Check if full
    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Free slots
    #[inline(always)]
    pub fn free_count(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Append an item. Returns false when full; the caller keeps the item.
    #[inline]
    pub fn enqueue(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.buf[self.tail & self.mask] = item;
        self.tail = self.tail.wrapping_add(1);
        true
    }

    /// Remove the oldest item
    #[inline]
    pub fn dequeue(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.buf[self.head & self.mask];
        self.head = self.head.wrapping_add(1);
        Some(item)
    }

    /// Remove up to `max` items in FIFO order, appending them to `out`
    pub fn dequeue_burst(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let n = max.min(self.len());
        out.reserve(n);
        for _ in 0..n {
            out.push(self.buf[self.head & self.mask]);
            self.head = self.head.wrapping_add(1);
        }
        n
    }

    /// Look at the oldest item
    #[inline]
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            Some(&self.buf[self.head & self.mask])
        }
    }

    /// Return items to the head of the queue so that `items[0]` is dequeued next.
    ///
    /// Used for events that were dequeued but could not be scheduled.
    /// Returns false, leaving the queue untouched, if there is no room.
    pub fn put_back(&mut self, items: &[T]) -> bool {
        if items.len() > self.free_count() {
            return false;
        }
        for item in items.iter().rev() {
            self.head = self.head.wrapping_sub(1);
            self.buf[self.head & self.mask] = *item;
        }
        true
    }

    /// Iterate over queued items, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len()).map(move |i| &self.buf[self.head.wrapping_add(i) & self.mask])
    }

    /// Drop all queued items
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iq_fifo() {
        let mut iq = InternalQueue::new(4);
        assert!(iq.is_empty());
        assert!(iq.enqueue(1u32));
        assert!(iq.enqueue(2));
        assert_eq!(iq.peek(), Some(&1));
        assert_eq!(iq.dequeue(), Some(1));
        assert_eq!(iq.dequeue(), Some(2));
        assert_eq!(iq.dequeue(), None);
    }

    #[test]
    fn test_iq_full_rejects() {
        let mut iq = InternalQueue::new(3);
        assert_eq!(iq.capacity(), 4);
        for i in 0..4u32 {
            assert!(iq.enqueue(i));
        }
        assert!(iq.is_full());
        assert!(!iq.enqueue(4));
        assert_eq!(iq.len(), 4);
    }

    #[test]
    fn test_iq_dequeue_burst_wraps() {
        let mut iq = InternalQueue::new(4);
        for i in 0..3u32 {
            iq.enqueue(i);
        }
        iq.dequeue();
        iq.dequeue();
        for i in 3..6u32 {
            assert!(iq.enqueue(i));
        }

        let mut out = Vec::new();
        assert_eq!(iq.dequeue_burst(&mut out, 10), 4);
        assert_eq!(out, vec![2, 3, 4, 5]);
        assert!(iq.is_empty());
    }

    #[test]
    fn test_iq_put_back_preserves_order() {
        let mut iq = InternalQueue::new(8);
        for i in 0..5u32 {
            iq.enqueue(i);
        }
        let mut taken = Vec::new();
        iq.dequeue_burst(&mut taken, 3);
        assert_eq!(taken, vec![0, 1, 2]);

        // 1 could not be scheduled; 0 and 2 could
        assert!(iq.put_back(&[1]));
        assert_eq!(iq.iter().copied().collect::<Vec<_>>(), vec![1, 3, 4]);

        assert!(iq.put_back(&[7, 8]));
        assert_eq!(iq.iter().copied().collect::<Vec<_>>(), vec![7, 8, 1, 3, 4]);
    }

    #[test]
    fn test_iq_put_back_without_room() {
        let mut iq = InternalQueue::new(2);
        iq.enqueue(1u8);
        iq.enqueue(2);
        assert!(!iq.put_back(&[0]));
        assert_eq!(iq.len(), 2);
        assert_eq!(iq.dequeue(), Some(1));
    }
}
