//! Fixed-capacity circular message buffer.
//!
//! Capacity is rounded up to a power of two so cursors map to slots with a
//! mask. Cursors only grow; `write - read` is the number of buffered items
//! and never exceeds the capacity.

use std::fmt;

use crate::error::{GateError, Result};

pub struct RingBuffer<T> {
    slots: Box<[Option<T>]>,
    mask: u64,
    read: u64,
    write: u64,
}

impl<T> RingBuffer<T> {
    /// Creates a buffer holding at least `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity as u64 - 1,
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Buffered items: `write - read`.
    pub fn count(&self) -> usize {
        (self.write - self.read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.write == self.read
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    /// Appends `item`.
    ///
    /// On a full buffer, `overwrite` drops the oldest item to make room and
    /// returns `Ok(true)`; otherwise the write fails with `RingFull` and the
    /// buffer is unchanged.
    pub fn write(&mut self, item: T, overwrite: bool) -> Result<bool> {
        let mut overwritten = false;
        if self.is_full() {
            if !overwrite {
                return Err(GateError::RingFull);
            }
            let oldest = self.slot(self.read);
            self.slots[oldest] = None;
            self.read += 1;
            overwritten = true;
        }
        let slot = self.slot(self.write);
        self.slots[slot] = Some(item);
        self.write += 1;
        Ok(overwritten)
    }

    /// Pops the oldest item.
    pub fn read(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let slot = self.slot(self.read);
        self.read += 1;
        self.slots[slot].take()
    }

    /// Pops up to `max` items, oldest first.
    pub fn drain(&mut self, max: usize) -> Vec<T> {
        let n = max.min(self.count());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.read() {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    fn slot(&self, cursor: u64) -> usize {
        (cursor & self.mask) as usize
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        assert_eq!(RingBuffer::<u8>::new(0).capacity(), 1);
        assert_eq!(RingBuffer::<u8>::new(1).capacity(), 1);
        assert_eq!(RingBuffer::<u8>::new(5).capacity(), 8);
        assert_eq!(RingBuffer::<u8>::new(1024).capacity(), 1024);
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let mut ring = RingBuffer::<u32>::new(4);
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.read(), None);
    }

    #[test]
    fn test_full_write_rejected_without_overwrite() {
        let mut ring = RingBuffer::new(3);
        let capacity = ring.capacity();
        for i in 0..capacity {
            assert!(!ring.write(i, false).unwrap());
        }
        assert!(matches!(ring.write(capacity, false), Err(GateError::RingFull)));
        assert_eq!(ring.count(), capacity);
        assert_eq!(ring.read(), Some(0));
    }

    #[test]
    fn test_full_write_drops_oldest_with_overwrite() {
        let mut ring = RingBuffer::new(4);
        for i in 0..4 {
            ring.write(i, true).unwrap();
        }
        assert!(ring.write(4, true).unwrap());
        assert_eq!(ring.count(), 4);
        assert_eq!(ring.drain(usize::MAX), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fifo_across_wraparound() {
        let mut ring = RingBuffer::new(2);
        ring.write('a', false).unwrap();
        ring.write('b', false).unwrap();
        assert_eq!(ring.read(), Some('a'));
        ring.write('c', false).unwrap();
        assert_eq!(ring.drain(1), vec!['b']);
        assert_eq!(ring.drain(5), vec!['c']);
        assert!(ring.is_empty());
    }

    proptest! {
        #[test]
        fn prop_count_tracks_cursors(
            capacity in 1usize..17,
            ops in prop::collection::vec((any::<bool>(), any::<bool>()), 0..200),
        ) {
            let mut ring = RingBuffer::new(capacity);
            let mut model = std::collections::VecDeque::new();
            let cap = ring.capacity();

            for (i, (is_write, overwrite)) in ops.into_iter().enumerate() {
                if is_write {
                    match ring.write(i, overwrite) {
                        Ok(dropped) => {
                            prop_assert_eq!(dropped, model.len() == cap);
                            if dropped {
                                model.pop_front();
                            }
                            model.push_back(i);
                        }
                        Err(_) => prop_assert!(!overwrite && model.len() == cap),
                    }
                } else {
                    prop_assert_eq!(ring.read(), model.pop_front());
                }
                prop_assert_eq!(ring.count(), model.len());
                prop_assert!(ring.count() <= cap);
            }
        }
    }
}
