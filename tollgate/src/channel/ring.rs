//! Core lock-free SPSC ring shared by a [`Producer`](super::Producer) and a
//! [`Consumer`](super::Consumer).
//!
//! The ring only holds what both sides must see: the published head, the
//! consumed tail, the cumulative count of released bytes and the slots
//! themselves. Cursors and cached copies of the opposite index live in the
//! endpoint structs, which are never shared.
//!
//! # Safety
//!
//! The slot accessors are unsafe because they require the caller to uphold the
//! SPSC invariant: exactly one producer and one consumer, and a slot is only
//! touched by the side that currently owns it according to head/tail.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Producer-owned index, read by the consumer.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ProducerShared {
    /// Published write index (absolute, wrapping). Release-stored by `publish`.
    pub head: AtomicUsize,
}

/// Consumer-owned indices, read by the producer.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ConsumerShared {
    /// Consumed read index (absolute, wrapping).
    pub tail: AtomicUsize,
    /// Cumulative footprint of every fragment handed back to the producer.
    pub released_bytes: AtomicUsize,
}

/// A single slot in the ring buffer.
#[repr(C)]
pub(crate) struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn empty() -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Heap ring sized at construction time.
#[repr(C)]
pub(crate) struct Ring<T> {
    pub producer: ProducerShared,
    pub consumer: ConsumerShared,
    buffer: Box<[Slot<T>]>,
    capacity_bytes: usize,
}

impl<T> Ring<T> {
    pub fn new(slots: usize, capacity_bytes: usize) -> Self {
        assert!(slots > 0, "ring must have at least one slot");
        Self {
            producer: ProducerShared {
                head: AtomicUsize::new(0),
            },
            consumer: ConsumerShared {
                tail: AtomicUsize::new(0),
                released_bytes: AtomicUsize::new(0),
            },
            buffer: (0..slots).map(|_| Slot::empty()).collect(),
            capacity_bytes,
        }
    }

    #[inline]
    pub fn slots(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub const fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Advances a cursor to the next slot index, wrapping to 0 at the slot count.
    ///
    /// Equivalent to `(cursor + 1) % slots` without the division.
    #[inline]
    pub fn bump_cursor(&self, cursor: usize) -> usize {
        let next = cursor + 1;
        if next == self.buffer.len() { 0 } else { next }
    }

    /// Moves `item` into the slot at `index`.
    ///
    /// # Safety
    ///
    /// Caller must be the single producer, `index` must be in bounds, and the
    /// slot must be free (not yet published, or already consumed).
    #[inline]
    pub unsafe fn write(&self, index: usize, item: T) {
        let slot_ptr = self.buffer[index].value.get();
        // SAFETY: the producer owns this slot per the caller contract.
        unsafe {
            std::ptr::write(slot_ptr, MaybeUninit::new(item));
        }
    }

    /// Borrows the initialized value at `index`.
    ///
    /// # Safety
    ///
    /// Caller must own the slot (consumer after an acquire load of `head`, or
    /// producer for a staged slot) and the slot must be initialized.
    #[inline]
    pub unsafe fn get(&self, index: usize) -> &T {
        // SAFETY: initialized and owned per the caller contract; the producer
        // cannot overwrite it until the tail moves past it.
        unsafe { (*self.buffer[index].value.get()).assume_init_ref() }
    }

    /// Moves the initialized value out of the slot at `index`.
    ///
    /// # Safety
    ///
    /// Same as [`Ring::get`]; additionally the slot must not be read again
    /// until it is rewritten.
    #[inline]
    pub unsafe fn take(&self, index: usize) -> T {
        // SAFETY: initialized and owned per the caller contract.
        unsafe { std::ptr::read(self.buffer[index].value.get()).assume_init() }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Published but never consumed values still need their destructors.
        // Staged values that were never published are dropped by the producer.
        let head = *self.producer.head.get_mut();
        let mut pos = *self.consumer.tail.get_mut();
        while pos != head {
            let index = pos % self.buffer.len();
            // SAFETY: every position in [tail, head) holds an initialized value,
            // and `&mut self` proves neither endpoint is still alive.
            unsafe {
                (*self.buffer[index].value.get()).assume_init_drop();
            }
            pos = pos.wrapping_add(1);
        }
    }
}

// SAFETY: values only ever move between the two endpoints, so `T: Send` is
// enough for the ring to cross threads.
unsafe impl<T: Send> Send for Ring<T> {}

// SAFETY: concurrent access is mediated by the head/tail atomics with
// Release/Acquire ordering; each slot is owned by exactly one side at a time.
unsafe impl<T: Send> Sync for Ring<T> {}

/// Loads a shared index for the opposite side.
#[inline]
pub(crate) fn load_acquire(index: &AtomicUsize) -> usize {
    index.load(Ordering::Acquire)
}

/// Publishes an index to the opposite side.
#[inline]
pub(crate) fn store_release(index: &AtomicUsize, value: usize) {
    index.store(value, Ordering::Release);
}
