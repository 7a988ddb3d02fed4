//! Serial loopback over a fragment channel.
//!
//! Every write becomes one chunk; reads peek the oldest chunk and copy as much
//! as the caller's buffer takes, releasing the chunk only once it is fully
//! read. A small read buffer therefore pulls one chunk over several reads.

use std::io;

use super::Transport;
use crate::channel::{self, Consumer, Footprint, Producer};

struct Chunk(Vec<u8>);

impl Footprint for Chunk {
    const MIN_FOOTPRINT: usize = 1;

    fn footprint(&self) -> usize {
        self.0.len().max(1)
    }
}

/// Transport that hands written bytes back to reads.
pub struct Loopback {
    tx: Producer<Chunk>,
    rx: Consumer<Chunk>,
    offset: usize,
}

impl Loopback {
    /// Loopback buffering up to `capacity_bytes` unread bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_bytes` is zero.
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        let (tx, rx) = channel::channel(capacity_bytes);
        Self { tx, rx, offset: 0 }
    }
}

impl Transport for Loopback {
    fn write(&mut self, _address: i32, bytes: &[u8]) -> io::Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let free = self.tx.free_bytes();
        let n = bytes.len().min(free);
        if n == 0 {
            return Ok(0);
        }
        if self.tx.push(Chunk(bytes[..n].to_vec())).is_err() {
            return Ok(0);
        }
        Ok(n)
    }

    fn read_into(&mut self, _address: i32, buf: &mut [u8]) -> io::Result<usize> {
        let Some(Chunk(bytes)) = self.rx.try_read_fragment() else {
            return Ok(0);
        };
        let remaining = &bytes[self.offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        let done = self.offset + n == bytes.len();
        if done {
            self.offset = 0;
            self.rx.release_read_lock();
        } else {
            self.offset += n;
        }
        Ok(n)
    }
}
