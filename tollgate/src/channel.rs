//! Bounded single-producer/single-consumer fragment channel.
//!
//! A wait-free queue over a heap ring with a fixed **byte** capacity. Every
//! value carries a [`Footprint`]; the producer may only stage a value when the
//! bytes still held by the consumer leave room for it.
//!
//! # Overview
//!
//! - [`Producer`] stages values with [`Producer::try_write`] and makes every
//!   staged value visible at once with [`Producer::publish`]. Together with
//!   [`Producer::has_room_for`] this lets a writer check room for a whole batch
//!   first and never leave half of it in the channel.
//! - [`Consumer`] peeks with [`Consumer::try_read_fragment`] and hands the
//!   slot (and its bytes) back with [`Consumer::release_read_lock`]. A value
//!   stays readable until it is released, so a reader may consume a long
//!   payload across several pulls.
//!
//! # Example
//!
//! ```
//! use tollgate::channel::{self, Footprint};
//!
//! struct Word(u32);
//!
//! impl Footprint for Word {
//!     const MIN_FOOTPRINT: usize = 4;
//!     fn footprint(&self) -> usize {
//!         4
//!     }
//! }
//!
//! let (mut tx, mut rx) = channel::channel::<Word>(16);
//!
//! assert!(tx.has_room_for(8));
//! assert!(tx.try_write(Word(1)).is_ok());
//! assert!(tx.try_write(Word(2)).is_ok());
//! assert!(rx.try_read_fragment().is_none(), "staged values are invisible");
//!
//! tx.publish();
//! assert_eq!(rx.try_read_fragment().map(|w| w.0), Some(1));
//! assert!(rx.release_read_lock());
//! assert_eq!(rx.take().map(|w| w.0), Some(2));
//! ```

mod ring;

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use ring::{Ring, load_acquire, store_release};

/// Number of bytes a value occupies while it sits in a channel.
pub trait Footprint {
    /// Smallest footprint any value of this type can have. Slot count is
    /// derived from it so that bytes, not slots, are the binding limit.
    const MIN_FOOTPRINT: usize;

    /// Footprint of this particular value.
    fn footprint(&self) -> usize;
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Creates a channel holding at most `capacity_bytes` worth of values.
///
/// # Panics
///
/// Panics if `capacity_bytes` cannot hold a single minimum-size value.
#[must_use]
pub fn channel<T: Footprint + Send>(capacity_bytes: usize) -> (Producer<T>, Consumer<T>) {
    assert!(
        T::MIN_FOOTPRINT > 0,
        "Footprint::MIN_FOOTPRINT must be greater than 0"
    );
    assert!(
        capacity_bytes >= T::MIN_FOOTPRINT,
        "channel capacity {capacity_bytes} cannot hold a single value of {} bytes",
        T::MIN_FOOTPRINT
    );

    let slots = capacity_bytes / T::MIN_FOOTPRINT;
    let ring = Arc::new(Ring::new(slots, capacity_bytes));

    let producer = Producer {
        ring: Arc::clone(&ring),
        staged: 0,
        published: 0,
        cursor: 0,
        cached_tail: 0,
        written_bytes: 0,
        cached_released: 0,
        _unsync: PhantomData,
    };

    let consumer = Consumer {
        ring,
        tail: 0,
        cursor: 0,
        cached_head: 0,
        released_bytes: 0,
        _unsync: PhantomData,
    };

    (producer, consumer)
}

/// Write end of a fragment channel.
///
/// `Producer` is [`Send`] but not [`Sync`]: it can move to another thread but
/// cannot be shared, so there is never more than one writer.
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
    /// Next position to stage into (absolute, wrapping).
    staged: usize,
    /// Last position made visible to the consumer.
    published: usize,
    /// `staged % slots`.
    cursor: usize,
    cached_tail: usize,
    /// Cumulative footprint of everything staged so far.
    written_bytes: usize,
    cached_released: usize,
    _unsync: PhantomUnsync,
}

impl<T: Footprint + Send> Producer<T> {
    /// Total byte capacity of the channel.
    #[inline]
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.ring.capacity_bytes()
    }

    /// Bytes currently free, counting staged values as used.
    #[inline]
    pub fn free_bytes(&mut self) -> usize {
        self.cached_released = load_acquire_bytes(&self.ring);
        self.cached_free()
    }

    #[inline]
    fn cached_free(&self) -> usize {
        let in_flight = self.written_bytes.wrapping_sub(self.cached_released);
        self.ring.capacity_bytes().saturating_sub(in_flight)
    }

    /// Returns `true` if `bytes` more can be staged right now.
    ///
    /// The answer can only grow until this producer writes again, which is
    /// what makes check-then-write batches safe.
    #[inline]
    pub fn has_room_for(&mut self, bytes: usize) -> bool {
        if self.cached_free() >= bytes {
            return true;
        }
        self.free_bytes() >= bytes
    }

    /// Stages `item` without making it visible.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the channel lacks room; nothing is changed.
    #[inline]
    pub fn try_write(&mut self, item: T) -> Result<(), T> {
        if !self.has_room_for(item.footprint()) {
            return Err(item);
        }

        let slots = self.ring.slots();
        if self.staged.wrapping_sub(self.cached_tail) >= slots {
            self.cached_tail = load_acquire(&self.ring.consumer.tail);
            if self.staged.wrapping_sub(self.cached_tail) >= slots {
                return Err(item);
            }
        }

        self.written_bytes = self.written_bytes.wrapping_add(item.footprint());

        // SAFETY: single producer; the slot at `cursor` is free because
        // staged - tail < slots, and `cursor` stays in [0, slots).
        unsafe {
            self.ring.write(self.cursor, item);
        }
        self.cursor = self.ring.bump_cursor(self.cursor);
        self.staged = self.staged.wrapping_add(1);
        Ok(())
    }

    /// Makes every staged value visible to the consumer in one store.
    #[inline]
    pub fn publish(&mut self) {
        if self.staged != self.published {
            store_release(&self.ring.producer.head, self.staged);
            self.published = self.staged;
        }
    }

    /// Stages and publishes a single value.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the channel lacks room.
    #[inline]
    pub fn push(&mut self, item: T) -> Result<(), T> {
        self.try_write(item)?;
        self.publish();
        Ok(())
    }

    /// Number of values staged but not yet published.
    #[inline]
    #[must_use]
    pub const fn staged_len(&self) -> usize {
        self.staged.wrapping_sub(self.published)
    }
}

impl<T: Send> Drop for Producer<T> {
    fn drop(&mut self) {
        // Staged values were never handed to the consumer; they die here.
        let slots = self.ring.slots();
        let mut pos = self.published;
        while pos != self.staged {
            // SAFETY: positions in [published, staged) were written by this
            // producer and are invisible to the consumer.
            unsafe {
                drop(self.ring.take(pos % slots));
            }
            pos = pos.wrapping_add(1);
        }
        self.staged = self.published;
    }
}

#[inline]
fn load_acquire_bytes<T>(ring: &Ring<T>) -> usize {
    load_acquire(&ring.consumer.released_bytes)
}

/// Read end of a fragment channel.
///
/// See [`Producer`] for thread-safety details (same semantics apply).
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
    tail: usize,
    /// `tail % slots`.
    cursor: usize,
    cached_head: usize,
    released_bytes: usize,
    _unsync: PhantomUnsync,
}

impl<T: Footprint + Send> Consumer<T> {
    /// Refreshes the cached head if needed; `true` if a value is readable.
    #[inline]
    fn available(&mut self) -> bool {
        if self.cached_head == self.tail {
            self.cached_head = load_acquire(&self.ring.producer.head);
        }
        self.cached_head != self.tail
    }

    /// Peeks at the oldest published value without consuming it.
    ///
    /// Returns `None` if nothing is published.
    #[inline]
    pub fn try_read_fragment(&mut self) -> Option<&T> {
        if !self.available() {
            return None;
        }
        // SAFETY: head was acquired past `tail`, so the slot is initialized and
        // the producer will not touch it until the tail moves.
        Some(unsafe { self.ring.get(self.cursor) })
    }

    /// Consumes the oldest published value and returns its bytes to the
    /// producer.
    ///
    /// Returns `false` if there was nothing to release.
    #[inline]
    pub fn release_read_lock(&mut self) -> bool {
        match self.take() {
            Some(item) => {
                drop(item);
                true
            }
            None => false,
        }
    }

    /// Pops the oldest published value.
    #[inline]
    #[must_use]
    pub fn take(&mut self) -> Option<T> {
        if !self.available() {
            return None;
        }
        // SAFETY: see `try_read_fragment`; the slot is not read again until
        // the producer rewrites it.
        let item = unsafe { self.ring.take(self.cursor) };

        self.released_bytes = self.released_bytes.wrapping_add(item.footprint());
        self.cursor = self.ring.bump_cursor(self.cursor);
        self.tail = self.tail.wrapping_add(1);
        store_release(&self.ring.consumer.released_bytes, self.released_bytes);
        store_release(&self.ring.consumer.tail, self.tail);

        Some(item)
    }

    /// Returns `true` if no published value is waiting.
    #[inline]
    pub fn is_empty(&mut self) -> bool {
        !self.available()
    }

    /// Total byte capacity of the channel.
    #[inline]
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.ring.capacity_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    impl Footprint for u64 {
        const MIN_FOOTPRINT: usize = 8;
        fn footprint(&self) -> usize {
            8
        }
    }

    impl Footprint for String {
        const MIN_FOOTPRINT: usize = 1;
        fn footprint(&self) -> usize {
            self.len().max(1)
        }
    }

    #[derive(Debug)]
    struct Counted(Arc<AtomicUsize>);

    impl Footprint for Counted {
        const MIN_FOOTPRINT: usize = 1;
        fn footprint(&self) -> usize {
            1
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_basic_push_take() {
        let (mut producer, mut consumer) = channel::<u64>(64);

        assert!(producer.push(42).is_ok());
        assert_eq!(consumer.take(), Some(42));
        assert_eq!(consumer.take(), None);
    }

    #[test]
    fn test_staged_values_are_invisible_until_publish() {
        let (mut producer, mut consumer) = channel::<u64>(64);

        producer.try_write(1).unwrap();
        producer.try_write(2).unwrap();
        assert_eq!(producer.staged_len(), 2);
        assert!(consumer.try_read_fragment().is_none());

        producer.publish();
        assert_eq!(producer.staged_len(), 0);
        assert_eq!(consumer.take(), Some(1));
        assert_eq!(consumer.take(), Some(2));
    }

    #[test]
    fn test_queue_full_by_bytes() {
        let (mut producer, mut consumer) = channel::<u64>(32);

        for i in 0..4 {
            assert!(producer.push(i).is_ok(), "Failed to push item {i}");
        }

        assert!(!producer.has_room_for(8));
        assert_eq!(producer.push(999), Err(999));

        assert_eq!(consumer.take(), Some(0));
        assert!(producer.has_room_for(8));
        assert!(producer.push(4).is_ok());
        assert_eq!(producer.push(1000), Err(1000));
    }

    #[test]
    fn test_variable_footprints_share_the_byte_budget() {
        let (mut producer, mut consumer) = channel::<String>(10);

        producer.push("abcdef".to_string()).unwrap();
        assert!(producer.has_room_for(4));
        assert!(!producer.has_room_for(5));
        assert_eq!(producer.push("12345".to_string()), Err("12345".to_string()));
        producer.push("1234".to_string()).unwrap();

        assert_eq!(consumer.take().as_deref(), Some("abcdef"));
        assert_eq!(producer.free_bytes(), 6);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut producer, mut consumer) = channel::<u64>(64);

        producer.push(7).unwrap();
        assert_eq!(consumer.try_read_fragment(), Some(&7));
        assert_eq!(consumer.try_read_fragment(), Some(&7));
        assert!(consumer.release_read_lock());
        assert!(consumer.try_read_fragment().is_none());
        assert!(!consumer.release_read_lock());
    }

    #[test]
    fn test_wrapping_behavior() {
        let (mut producer, mut consumer) = channel::<u64>(32);

        for round in 0..5 {
            for i in 0..4 {
                let value = round * 10 + i;
                assert!(producer.push(value).is_ok());
            }

            for i in 0..4 {
                let expected = round * 10 + i;
                assert_eq!(consumer.take(), Some(expected));
            }

            assert!(consumer.is_empty());
        }
    }

    #[test]
    fn test_unconsumed_values_are_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let (mut producer, mut consumer) = channel::<Counted>(8);
            producer.push(Counted(Arc::clone(&drops))).unwrap();
            producer.push(Counted(Arc::clone(&drops))).unwrap();
            producer.try_write(Counted(Arc::clone(&drops))).unwrap();
            assert!(consumer.release_read_lock());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_send_to_thread() {
        let (mut producer, mut consumer) = channel::<u64>(128);

        let handle = std::thread::spawn(move || {
            for i in 0..10 {
                producer.push(i).unwrap();
            }
        });

        handle.join().unwrap();

        for i in 0..10 {
            assert_eq!(consumer.take(), Some(i));
        }
    }

    #[test]
    fn test_concurrent_batches_arrive_whole() {
        let (mut producer, mut consumer) = channel::<u64>(64);
        let batches = 500u64;

        let producer_handle = std::thread::spawn(move || {
            for batch in 0..batches {
                while !producer.has_room_for(3 * 8) {
                    std::hint::spin_loop();
                }
                for part in 0..3 {
                    producer.try_write(batch * 3 + part).unwrap();
                }
                producer.publish();
            }
        });

        let consumer_handle = std::thread::spawn(move || {
            let mut received = Vec::with_capacity((batches * 3) as usize);
            while received.len() < (batches * 3) as usize {
                if let Some(item) = consumer.take() {
                    received.push(item);
                } else {
                    std::hint::spin_loop();
                }
            }
            received
        });

        producer_handle.join().unwrap();
        let received = consumer_handle.join().unwrap();

        for (i, &val) in received.iter().enumerate() {
            assert_eq!(val, i as u64);
        }
    }

    #[test]
    #[should_panic(expected = "cannot hold a single value")]
    fn test_undersized_channel_panics() {
        let _ = channel::<u64>(4);
    }
}
