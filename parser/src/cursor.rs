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

//! Byte cursor over a request buffer.

/// A forward-only cursor over the unparsed tail of a request buffer.
///
/// Tracks how many bytes have been consumed so the caller can discard them
/// from its read buffer once a parse step completes.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    inner: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor at the start of `slice`.
    pub fn new(slice: &'a [u8]) -> Self {
        Cursor { inner: slice, pos: 0 }
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes remaining.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.inner.len() - self.pos
    }

    /// True when every byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.inner.len()
    }

    /// The unconsumed tail.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.inner[self.pos..]
    }

    /// Consumes `n` bytes, saturating at the end of the slice.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.pos = self.inner.len().min(self.pos + n);
    }

    /// Consumes and returns one line, excluding its `\r\n` terminator.
    ///
    /// Returns `None` when no complete line is buffered yet; the cursor is
    /// left untouched so the caller can retry after the next read.
    pub fn line(&mut self) -> Option<&'a [u8]> {
        let tail = self.rest();
        let end = tail.windows(2).position(|w| w == b"\r\n")?;
        self.advance(end + 2);
        Some(&tail[..end])
    }

    /// Consumes and returns exactly `n` bytes, or `None` if fewer are
    /// buffered.
    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let taken = &self.rest()[..n];
        self.advance(n);
        Some(taken)
    }
}

#[cfg(test)]
mod test {
    use super::Cursor;

    #[test]
    fn cursor_constructs_with_len_and_pos() {
        let cur = Cursor::new(b"GET / HTTP/1.1");
        assert_eq!(0, cur.pos());
        assert_eq!(14, cur.remaining());
    }

    #[test]
    fn cursor_line_splits_on_crlf() {
        let mut cur = Cursor::new(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(Some(b"GET / HTTP/1.1" as &[u8]), cur.line());
        assert_eq!(Some(b"Host: x" as &[u8]), cur.line());
        assert!(cur.is_empty());
    }

    #[test]
    fn cursor_line_returns_none_without_terminator() {
        let mut cur = Cursor::new(b"GET / HTT");
        assert_eq!(None, cur.line());
        assert_eq!(0, cur.pos());
    }

    #[test]
    fn cursor_take_requires_full_count() {
        let mut cur = Cursor::new(b"abcdef");
        assert_eq!(None, cur.take(7));
        assert_eq!(Some(b"abcd" as &[u8]), cur.take(4));
        assert_eq!(4, cur.pos());
        assert_eq!(b"ef", cur.rest());
    }

    #[test]
    fn cursor_advance_saturates() {
        let mut cur = Cursor::new(b"ab");
        cur.advance(10);
        assert!(cur.is_empty());
    }
}
