// Copyright 2024 the skiff authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Grow-on-demand linear byte buffer with read and write cursors.

use std::io::{IoSliceMut, Read, Write};

const INITIAL_CAPACITY: usize = 1024;

/// Size of the stack fallback used by the scatter read. One syscall per
/// wake without pre-growing the buffer; peak extra allocation is bounded by
/// this constant.
const STACK_FALLBACK: usize = 64 * 1024;

/// A contiguous byte buffer with `read_pos <= write_pos <= capacity`.
///
/// The region before `read_pos` is prependable slack, between the cursors is
/// readable, after `write_pos` is writable. Appends first compact the
/// readable region to the front when the total slack suffices, and only then
/// resize.
#[derive(Debug)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteBuffer {
    /// Creates a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Creates a buffer with a chosen initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        ByteBuffer {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Bytes available to read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes available to write without growing.
    #[inline]
    pub fn writable(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Slack before the read cursor, reclaimable by compaction.
    #[inline]
    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Consumes `len` readable bytes, saturating at the write cursor.
    pub fn retrieve(&mut self, len: usize) {
        self.read_pos = self.write_pos.min(self.read_pos + len);
    }

    /// Consumes readable bytes up to the absolute buffer offset `offset`.
    ///
    /// Offsets at or behind the read cursor are a no-op; offsets past the
    /// write cursor saturate there.
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset.saturating_sub(self.read_pos));
    }

    /// Consumes everything and zeroes the storage.
    pub fn retrieve_all(&mut self) {
        self.buf.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Consumes everything, returning the readable region as a string.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Appends `data`, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Guarantees at least `len` writable bytes.
    ///
    /// Compacts when the writable and prependable slack together cover the
    /// request, otherwise resizes to `write_pos + len + 1`.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() >= len {
            return;
        }
        if self.writable() + self.prependable() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Scatter-reads once from `src` into the writable region, spilling into
    /// a stack buffer when the kernel delivers more than fits.
    ///
    /// Returns the byte count from the syscall; `Ok(0)` means the peer
    /// closed. `WouldBlock` and friends surface as `io::Error` for the
    /// caller to classify.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> std::io::Result<usize> {
        let mut stack = [0u8; STACK_FALLBACK];
        let writable = self.writable();
        let (_, tail) = self.buf.split_at_mut(self.write_pos);
        let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut stack)];

        let n = src.read_vectored(&mut iov)?;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&stack[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `dst` and consumes what was accepted.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> std::io::Result<usize> {
        let n = dst.write(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
