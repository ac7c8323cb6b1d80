//! Fixed-capacity relay buffer
//!
//! Holds bytes read from one socket until its peer socket accepts them.
//! Reads append at the tail, writes drain from the head and compact whatever
//! was not sent back to the front. The capacity never grows: a full buffer
//! simply stops the source from being read, which is how a fast sender is
//! throttled against a slow receiver.

use std::io::{self, Read, Write};

/// Default per-direction capacity (16 KiB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024;

/// Bounded byte queue for one relay direction
pub struct RelayBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl RelayBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of buffered bytes not yet written to the destination
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// Free space at the tail
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// Pending bytes, oldest first
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Read once from `src` into the free tail space.
    ///
    /// Never reads more than [`remaining`](Self::remaining) bytes. Callers must
    /// check [`is_full`](Self::is_full) first: on a full buffer a zero-length
    /// read would be indistinguishable from end-of-stream.
    pub fn fill_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        debug_assert!(!self.is_full(), "fill_from called on a full relay buffer");
        let n = src.read(&mut self.data[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// Write once from the head into `dst`, then compact the unsent tail.
    pub fn drain_into<W: Write + ?Sized>(&mut self, dst: &mut W) -> io::Result<usize> {
        if self.len == 0 {
            return Ok(0);
        }
        let n = dst.write(&self.data[..self.len])?;
        self.consume(n);
        Ok(n)
    }

    /// Drop everything still buffered
    pub fn clear(&mut self) {
        self.len = 0;
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl std::fmt::Debug for RelayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}
