//! Buffer management for terminal output

mod ansi;

pub use ansi::strip_ansi;

use bytes::{Buf, BytesMut};

/// When the buffer is full, discard the oldest 1/3 of it.
const DISCARD_RATIO: usize = 3;

/// Longest unfinished escape sequence held back for the next read.
const MAX_CARRY: usize = 256;

/// Holds output that has been read from a terminal but not yet consumed by a match.
///
/// A match consumes everything up to its end; whatever follows stays for the
/// next expect. When more than `max_size` bytes pile up without a match, the
/// oldest third is dropped so a chatty console (e.g. `watch`) cannot grow the
/// buffer without bound.
///
/// With ANSI stripping on, an escape sequence cut in half by a read is held
/// back until the rest arrives.
pub struct BufferManager {
    buffer: BytesMut,
    max_size: usize,
    strip_ansi: bool,
    carry: Vec<u8>,
}

impl BufferManager {
    /// Create a new buffer manager
    pub fn new(max_size: usize, strip_ansi: bool) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_size.min(64 * 1024)),
            max_size,
            strip_ansi,
            carry: Vec::new(),
        }
    }

    /// Append freshly read data.
    pub fn append(&mut self, data: &[u8]) {
        let data = if self.strip_ansi {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(data);
            let split = ansi::incomplete_tail(&joined);
            if joined.len() - split <= MAX_CARRY {
                self.carry = joined.split_off(split);
            }
            strip_ansi(&joined)
        } else {
            data.to_vec()
        };

        if self.buffer.len() + data.len() > self.max_size {
            self.compact(data.len());
        }
        self.buffer.extend_from_slice(&data);
    }

    /// Everything not yet consumed.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Remove and return the first `end` bytes.
    pub fn consume(&mut self, end: usize) -> BytesMut {
        let end = end.min(self.buffer.len());
        self.buffer.split_to(end)
    }

    /// Drop everything pending, returning how many bytes were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.buffer.len() + self.carry.len();
        self.buffer.clear();
        self.carry.clear();
        n
    }

    /// The last `n` bytes of pending output, lossily decoded, for diagnostics.
    pub fn tail(&self, n: usize) -> String {
        let start = self.buffer.len().saturating_sub(n);
        String::from_utf8_lossy(&self.buffer[start..]).into_owned()
    }

    /// Current pending length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    fn compact(&mut self, incoming: usize) {
        let overflow = (self.buffer.len() + incoming).saturating_sub(self.max_size);
        let drop = overflow.max(self.max_size / DISCARD_RATIO);
        if drop >= self.buffer.len() {
            self.buffer.clear();
        } else {
            self.buffer.advance(drop);
        }
    }
}
