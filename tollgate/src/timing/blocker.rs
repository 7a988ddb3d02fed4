//! Fixed-capacity deadline table.
//!
//! One slot per key, so a key has at most one live deadline and re-blocking
//! overwrites it. Expired keys are handed out one at a time by
//! [`Blocker::next_released`]; the scan starts where the previous one stopped,
//! so a steady stream of expiries cannot starve high indices.

use core::marker::PhantomData;

use crate::protocol::{Connection, LaneId, MAX_CONNECTIONS, MAX_LANES};

/// Key type a [`Blocker`] can be indexed by.
pub trait BlockKey: Copy {
    /// Largest table a key space supports.
    const LIMIT: usize;

    fn index(self) -> usize;

    fn from_index(index: usize) -> Self;
}

impl BlockKey for Connection {
    const LIMIT: usize = MAX_CONNECTIONS;

    #[inline]
    fn index(self) -> usize {
        Self::index(self)
    }

    #[inline]
    fn from_index(index: usize) -> Self {
        // Indices below LIMIT always fit in u8.
        Self::i2c(index as u8)
    }
}

impl BlockKey for LaneId {
    const LIMIT: usize = MAX_LANES;

    #[inline]
    fn index(self) -> usize {
        Self::index(self)
    }

    #[inline]
    fn from_index(index: usize) -> Self {
        Self::new(index)
    }
}

/// Maps keys to wake-up deadlines in milliseconds.
pub struct Blocker<K: BlockKey> {
    deadlines: Box<[Option<i64>]>,
    live: usize,
    scan: usize,
    _key: PhantomData<K>,
}

impl<K: BlockKey> Blocker<K> {
    /// Creates a table for keys in `0..capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds `K::LIMIT`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "blocker capacity must be greater than 0");
        assert!(
            capacity <= K::LIMIT,
            "blocker capacity {capacity} exceeds the supported maximum of {}",
            K::LIMIT
        );
        Self {
            deadlines: vec![None; capacity].into_boxed_slice(),
            live: 0,
            scan: 0,
            _key: PhantomData,
        }
    }

    /// Table with room for every key of `K`.
    #[must_use]
    pub fn with_full_capacity() -> Self {
        Self::new(K::LIMIT)
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.deadlines.len()
    }

    /// Number of keys holding a deadline, expired or not.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Sets or overwrites the deadline for `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` lies outside the table.
    pub fn block(&mut self, key: K, deadline_ms: i64) {
        let index = key.index();
        let capacity = self.deadlines.len();
        let Some(slot) = self.deadlines.get_mut(index) else {
            panic!("key index {index} outside blocker capacity {capacity}");
        };
        if slot.replace(deadline_ms).is_none() {
            self.live += 1;
        }
    }

    /// Returns `true` while `key`'s deadline lies in the future.
    #[inline]
    #[must_use]
    pub fn is_blocked(&self, key: K, now_ms: i64) -> bool {
        matches!(self.deadline(key), Some(deadline) if deadline > now_ms)
    }

    /// Returns `true` if `key` holds a deadline, expired or not.
    #[inline]
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.deadline(key).is_some()
    }

    #[inline]
    #[must_use]
    pub fn deadline(&self, key: K) -> Option<i64> {
        self.deadlines.get(key.index()).copied().flatten()
    }

    /// Removes `key`'s deadline without waiting for it to expire.
    pub fn clear(&mut self, key: K) {
        if let Some(slot) = self.deadlines.get_mut(key.index())
            && slot.take().is_some()
        {
            self.live -= 1;
        }
    }

    /// Pops one key whose deadline is at or before `now_ms`.
    ///
    /// Call in a loop until it returns `None`; every expired key is returned
    /// exactly once.
    pub fn next_released(&mut self, now_ms: i64) -> Option<K> {
        if self.live == 0 {
            return None;
        }
        let capacity = self.deadlines.len();
        for step in 0..capacity {
            let index = (self.scan + step) % capacity;
            if matches!(self.deadlines[index], Some(deadline) if deadline <= now_ms) {
                self.deadlines[index] = None;
                self.live -= 1;
                self.scan = (index + 1) % capacity;
                return Some(K::from_index(index));
            }
        }
        None
    }

    /// Returns `true` if some deadline falls in `[now_ms, now_ms + window_ms)`.
    #[must_use]
    pub fn will_release_within(&self, now_ms: i64, window_ms: i64) -> bool {
        if self.live == 0 {
            return false;
        }
        let limit = now_ms.saturating_add(window_ms);
        self.deadlines
            .iter()
            .flatten()
            .any(|&deadline| deadline >= now_ms && deadline < limit)
    }

    /// Earliest live deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<i64> {
        self.deadlines.iter().flatten().copied().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(raw: u8) -> Connection {
        Connection::i2c(raw)
    }

    #[test]
    fn test_block_and_expire() {
        let mut blocker = Blocker::<Connection>::with_full_capacity();

        blocker.block(c(5), 100);
        assert!(blocker.is_blocked(c(5), 99));
        assert!(!blocker.is_blocked(c(5), 100));
        assert!(!blocker.is_blocked(c(6), 0));

        assert_eq!(blocker.next_released(99), None);
        assert_eq!(blocker.next_released(100), Some(c(5)));
        assert_eq!(blocker.next_released(100), None, "each key is returned once");
        assert!(blocker.is_empty());
    }

    #[test]
    fn test_last_writer_wins() {
        let mut blocker = Blocker::<Connection>::new(16);

        blocker.block(c(3), 50);
        blocker.block(c(3), 20);
        assert_eq!(blocker.len(), 1);
        assert_eq!(blocker.deadline(c(3)), Some(20));
        assert_eq!(blocker.next_released(20), Some(c(3)));
    }

    #[test]
    fn test_released_keys_drain_in_a_loop() {
        let mut blocker = Blocker::<Connection>::new(32);
        for raw in [1, 7, 30] {
            blocker.block(c(raw), 10);
        }
        blocker.block(c(12), 500);

        let mut released = Vec::new();
        while let Some(key) = blocker.next_released(10) {
            released.push(key.raw());
        }
        released.sort_unstable();
        assert_eq!(released, vec![1, 7, 30]);
        assert_eq!(blocker.len(), 1);
    }

    #[test]
    fn test_scan_resumes_after_last_release() {
        let mut blocker = Blocker::<Connection>::new(8);
        blocker.block(c(1), 0);
        blocker.block(c(2), 0);

        assert_eq!(blocker.next_released(0), Some(c(1)));
        blocker.block(c(1), 0);
        assert_eq!(blocker.next_released(0), Some(c(2)));
        assert_eq!(blocker.next_released(0), Some(c(1)));
    }

    #[test]
    fn test_will_release_within_window() {
        let mut blocker = Blocker::<Connection>::new(8);
        assert!(!blocker.will_release_within(0, 1_000));

        blocker.block(c(4), 150);
        assert!(blocker.will_release_within(100, 51));
        assert!(!blocker.will_release_within(100, 50), "window is half-open");
        assert!(!blocker.will_release_within(151, 100), "past deadlines are not upcoming");
        assert_eq!(blocker.next_deadline(), Some(150));
    }

    #[test]
    fn test_clear_removes_deadline() {
        let mut blocker = Blocker::<LaneId>::new(4);
        blocker.block(LaneId::new(2), 40);
        blocker.clear(LaneId::new(2));
        blocker.clear(LaneId::new(2));
        assert!(blocker.is_empty());
        assert!(!blocker.is_blocked(LaneId::new(2), 0));
    }

    #[test]
    #[should_panic(expected = "exceeds the supported maximum")]
    fn test_oversized_table_panics() {
        let _ = Blocker::<Connection>::new(MAX_CONNECTIONS + 1);
    }

    #[test]
    #[should_panic(expected = "outside blocker capacity")]
    fn test_key_outside_table_panics() {
        let mut blocker = Blocker::<Connection>::new(8);
        blocker.block(c(8), 1);
    }
}
