//! Blocking, batch-draining multi-producer queue.
//!
//! [`AtomicBuffer`] is the only structure in recombine built for concurrent
//! multi-writer access. Producers append from any thread; a consumer calls
//! [`AtomicBuffer::drain`], which blocks until something is queued and then
//! takes *everything* queued at that moment. Bursts of concurrent appends
//! are therefore coalesced into one batch.
//!
//! # Guarantees
//!
//! - No element is delivered twice or lost
//! - Elements appended by one producer keep their relative order
//! - Ordering across producers is unspecified
//!
//! The dedicated delivery thread of a [`Store`](crate::Store) drains one of
//! these.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::warn;

struct Slots<T> {
    items: Vec<T>,
    closed: bool,
}

/// Mutex-protected unbounded queue with blocking batch drain.
pub struct AtomicBuffer<T> {
    slots: Mutex<Slots<T>>,
    available: Condvar,
}

impl<T> AtomicBuffer<T> {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                items: Vec::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(|poisoned| {
            warn!("atomic buffer mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Append one element, waking a blocked consumer if the buffer was empty.
    pub fn append(&self, item: T) {
        let mut slots = self.lock();
        let was_empty = slots.items.is_empty();
        slots.items.push(item);
        drop(slots);

        if was_empty {
            self.available.notify_one();
        }
    }

    /// Append several elements atomically, keeping their order.
    pub fn append_all<I: IntoIterator<Item = T>>(&self, items: I) {
        let mut slots = self.lock();
        let was_empty = slots.items.is_empty();
        slots.items.extend(items);
        let is_empty = slots.items.is_empty();
        drop(slots);

        if was_empty && !is_empty {
            self.available.notify_one();
        }
    }

    /// Block until at least one element is queued, then take all of them.
    ///
    /// Returns `None` once the buffer has been closed and fully drained.
    pub fn drain(&self) -> Option<Vec<T>> {
        let mut slots = self.lock();
        loop {
            if !slots.items.is_empty() {
                return Some(std::mem::take(&mut slots.items));
            }
            if slots.closed {
                return None;
            }
            slots = self
                .available
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take everything currently queued without blocking.
    pub fn try_drain(&self) -> Vec<T> {
        std::mem::take(&mut self.lock().items)
    }

    /// Close the buffer, waking every blocked consumer.
    ///
    /// Elements already queued (or appended later) are still drained;
    /// `drain` returns `None` only when the buffer is closed and empty.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

impl<T> Default for AtomicBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for AtomicBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.lock();
        f.debug_struct("AtomicBuffer")
            .field("len", &slots.items.len())
            .field("closed", &slots.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_drain_takes_everything_in_order() {
        let buffer = AtomicBuffer::new();
        buffer.append(1);
        buffer.append(2);
        buffer.append_all([3, 4]);

        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.drain(), Some(vec![1, 2, 3, 4]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_try_drain_does_not_block() {
        let buffer: AtomicBuffer<u8> = AtomicBuffer::new();
        assert!(buffer.try_drain().is_empty());
        buffer.append(9);
        assert_eq!(buffer.try_drain(), vec![9]);
    }

    #[test]
    fn test_drain_blocks_until_append() {
        let buffer = Arc::new(AtomicBuffer::new());
        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.drain())
        };

        thread::sleep(Duration::from_millis(20));
        buffer.append("late");

        assert_eq!(consumer.join().unwrap(), Some(vec!["late"]));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let buffer: Arc<AtomicBuffer<u8>> = Arc::new(AtomicBuffer::new());
        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.drain())
        };

        thread::sleep(Duration::from_millis(20));
        buffer.close();

        assert_eq!(consumer.join().unwrap(), None);
        assert!(buffer.is_closed());
    }

    #[test]
    fn test_closed_buffer_still_drains_leftovers() {
        let buffer = AtomicBuffer::new();
        buffer.append(1);
        buffer.close();
        assert_eq!(buffer.drain(), Some(vec![1]));
        assert_eq!(buffer.drain(), None);
    }

    #[test]
    fn test_single_producer_order_survives_concurrent_producers() {
        let buffer = Arc::new(AtomicBuffer::new());
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for seq in 0..250 {
                        buffer.append((producer, seq));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let drained = buffer.try_drain();
        assert_eq!(drained.len(), 1000);
        for producer in 0..4 {
            let seqs: Vec<_> = drained
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .collect();
            assert_eq!(seqs, (0..250).collect::<Vec<_>>());
        }
    }
}
