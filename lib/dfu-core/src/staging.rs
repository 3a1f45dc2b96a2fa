// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Holding area between DATA requests and the flash.
//!
//! ```text
//!   0          flushed          fill          N
//!   |  on flash  |  not yet written  |  free  |
//! ```
//!
//! `flushed <= fill <= N` always holds.

#[derive(Debug)]
pub struct StagingBuffer<const N: usize> {
    data: [u8; N],
    fill: usize,
    flushed: usize,
}

impl<const N: usize> Default for StagingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StagingBuffer<N> {
    pub const CAPACITY: usize = N;

    pub const fn new() -> Self {
        Self {
            data: [0; N],
            fill: 0,
            flushed: 0,
        }
    }

    /// Bytes received so far, written or not.
    pub fn fill_offset(&self) -> usize {
        self.fill
    }

    /// Bytes already written to flash.
    pub fn flushed_offset(&self) -> usize {
        self.flushed
    }

    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    pub fn free(&self) -> usize {
        N - self.fill
    }

    /// Extend `self` with as much of `data` as we can, returning any remaining
    /// data. If the returned slice is empty, we extended ourselves with all of
    /// `data`.
    pub fn extend_from_slice<'a>(&mut self, data: &'a [u8]) -> &'a [u8] {
        let n = usize::min(data.len(), self.free());
        self.data[self.fill..][..n].copy_from_slice(&data[..n]);
        self.fill += n;
        &data[n..]
    }

    /// The bytes that still have to go to flash.
    pub fn unflushed(&self) -> &[u8] {
        &self.data[self.flushed..self.fill]
    }

    /// Records that the next `n` unflushed bytes are on flash.
    pub fn mark_flushed(&mut self, n: usize) {
        debug_assert!(self.flushed + n <= self.fill);
        self.flushed = usize::min(self.flushed + n, self.fill);
    }

    /// Drops the flushed prefix, moving whatever is left to the front.
    /// Returns how many bytes were dropped.
    pub fn consume_flushed(&mut self) -> usize {
        let consumed = self.flushed;
        self.data.copy_within(self.flushed..self.fill, 0);
        self.fill -= consumed;
        self.flushed = 0;
        consumed
    }

    pub fn clear(&mut self) {
        self.fill = 0;
        self.flushed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_truncates_at_capacity() {
        let mut buf = StagingBuffer::<8>::new();
        assert_eq!(buf.extend_from_slice(b"hello"), b"");
        assert_eq!(buf.extend_from_slice(b"world"), b"ld");
        assert_eq!(buf.unflushed(), b"hellowor");
        assert_eq!(buf.free(), 0);
        assert_eq!(buf.extend_from_slice(b"!"), b"!");
    }

    #[test]
    fn flush_then_consume_keeps_remainder() {
        let mut buf = StagingBuffer::<8>::new();
        buf.extend_from_slice(b"abcdef");
        buf.mark_flushed(4);
        assert_eq!(buf.flushed_offset(), 4);
        assert_eq!(buf.unflushed(), b"ef");

        assert_eq!(buf.consume_flushed(), 4);
        assert_eq!(buf.fill_offset(), 2);
        assert_eq!(buf.flushed_offset(), 0);
        assert_eq!(buf.unflushed(), b"ef");

        buf.extend_from_slice(b"gh");
        assert_eq!(buf.unflushed(), b"efgh");
    }

    #[test]
    fn clear_empties() {
        let mut buf = StagingBuffer::<4>::new();
        buf.extend_from_slice(b"ab");
        buf.mark_flushed(1);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.flushed_offset(), 0);
        assert_eq!(buf.free(), 4);
    }
}
