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

//! Decoder accumulation buffer

/// A growable, contiguous byte buffer with separate read and write offsets.
///
/// Decoders append whole reads with [`Buffer::extend`] and consume parsed
/// prefixes with [`Buffer::consume`]. Consumed space at the front is
/// reclaimed lazily once it dominates the buffer, so steady-state parsing
/// does not reallocate.
#[derive(Debug, Default)]
pub(crate) struct Buffer {
    data: Vec<u8>,
    read_offset: usize,
}

impl Buffer {
    const COMPACT_THRESHOLD: usize = 4 * 1024;

    pub fn new() -> Self {
        Buffer {
            data: Vec::new(),
            read_offset: 0,
        }
    }

    /// Number of unconsumed bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Appends `bytes` after the current write position.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// View of the unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_offset..]
    }

    /// Marks `amount` bytes consumed, freeing them for reclamation. The next
    /// [`Buffer::as_slice`] no longer includes them.
    pub fn consume(&mut self, amount: usize) {
        self.read_offset = self.data.len().min(self.read_offset + amount);
        self.compact();
    }

    /// Takes the unconsumed tail out of the buffer, leaving it empty.
    pub fn take(&mut self) -> Vec<u8> {
        let tail = self.data.split_off(self.read_offset);
        self.data.clear();
        self.read_offset = 0;
        tail
    }

    fn compact(&mut self) {
        if self.read_offset == self.data.len() {
            self.data.clear();
            self.read_offset = 0;
        } else if self.read_offset > Self::COMPACT_THRESHOLD && self.read_offset > self.remaining()
        {
            self.data.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;

    #[test]
    fn buffer_starts_empty() {
        let buf = Buffer::new();
        assert_eq!(0, buf.remaining());
        assert!(buf.is_empty());
    }

    #[test]
    fn buffer_extend_grows_remaining() {
        let mut buf = Buffer::new();
        buf.extend(b"GET / HTTP/1.1");
        assert_eq!(14, buf.remaining());
        assert_eq!(b"GET / HTTP/1.1", buf.as_slice());
    }

    #[test]
    fn buffer_consume_advances_read_position() {
        let mut buf = Buffer::new();
        buf.extend(b"GET / HTTP/1.1");
        buf.consume(4);
        assert_eq!(10, buf.remaining());
        assert_eq!(b"/ HTTP/1.1", buf.as_slice());
    }

    #[test]
    fn buffer_consume_past_end_saturates() {
        let mut buf = Buffer::new();
        buf.extend(b"abc");
        buf.consume(10);
        assert_eq!(0, buf.remaining());
    }

    #[test]
    fn buffer_resets_once_fully_consumed() {
        let mut buf = Buffer::new();
        buf.extend(b"abc");
        buf.consume(3);
        buf.extend(b"de");
        assert_eq!(b"de", buf.as_slice());
    }

    #[test]
    fn buffer_take_drains_unconsumed_tail() {
        let mut buf = Buffer::new();
        buf.extend(b"abcdef");
        buf.consume(2);
        assert_eq!(b"cdef".to_vec(), buf.take());
        assert!(buf.is_empty());
    }
}
