// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A growable byte buffer with a read cursor and a sticky error flag.
//!
//! All multi-byte integers are fixed width, 32-bit, and big-endian. Once any operation
//! fails the buffer is marked as errored and every later operation is a no-op until
//! [`WireBuffer::reset`] is called.

use bytes::{Buf, BufMut};

#[derive(Debug, Default, Clone)]
pub struct WireBuffer {
    data: Vec<u8>,
    cursor: usize,
    failed: bool,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the contents, the cursor, and the error flag, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.cursor = 0;
        self.failed = false;
    }

    pub fn has_error(&self) -> bool {
        self.failed
    }

    /// Mark the buffer as errored.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Ensure room for `additional` more bytes.
    ///
    /// On allocation failure the buffer is marked as errored and its visible length is
    /// unchanged.
    pub fn reserve(&mut self, additional: usize) -> bool {
        if self.failed {
            return false;
        }
        if self.data.try_reserve(additional).is_err() {
            self.failed = true;
            return false;
        }
        true
    }

    pub fn put_u8(&mut self, value: u8) -> bool {
        if !self.reserve(1) {
            return false;
        }
        self.data.put_u8(value);
        true
    }

    pub fn put_u32(&mut self, value: u32) -> bool {
        if !self.reserve(4) {
            return false;
        }
        self.data.put_u32(value);
        true
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> bool {
        if !self.reserve(value.len()) {
            return false;
        }
        self.data.put_slice(value);
        true
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        let mut bytes = self.take(1)?;
        Some(bytes.get_u8())
    }

    pub fn get_u32(&mut self) -> Option<u32> {
        let mut bytes = self.take(4)?;
        Some(bytes.get_u32())
    }

    pub fn get_bytes(&mut self, len: usize) -> Option<&[u8]> {
        self.take(len)
    }

    /// Reset the buffer and size it to hold exactly `len` bytes which the caller fills,
    /// typically straight from a socket.
    pub fn prepare_receive(&mut self, len: usize) -> Option<&mut [u8]> {
        self.reset();
        if !self.reserve(len) {
            return None;
        }
        self.data.resize(len, 0);
        Some(&mut self.data)
    }

    fn take(&mut self, len: usize) -> Option<&[u8]> {
        if self.failed || self.remaining() < len {
            self.failed = true;
            return None;
        }
        let start = self.cursor;
        self.cursor += len;
        Some(&self.data[start..self.cursor])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut buffer = WireBuffer::new();
        assert!(buffer.put_u32(0x0102_0304));
        assert!(buffer.put_u8(0xff));
        assert_eq!(buffer.as_bytes(), &[1, 2, 3, 4, 0xff]);
        assert_eq!(buffer.get_u32(), Some(0x0102_0304));
        assert_eq!(buffer.get_u8(), Some(0xff));
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn short_read_is_sticky() {
        let mut buffer = WireBuffer::new();
        buffer.put_bytes(&[0, 0, 7]);
        assert_eq!(buffer.get_u32(), None);
        assert!(buffer.has_error());

        // Even reads that would fit fail once errored.
        assert_eq!(buffer.get_u8(), None);
        assert!(!buffer.put_u8(1));
        assert_eq!(buffer.len(), 3);

        buffer.reset();
        assert!(!buffer.has_error());
        assert!(buffer.is_empty());
        assert!(buffer.put_u8(1));
    }

    #[test]
    fn get_bytes_advances_cursor() {
        let mut buffer = WireBuffer::new();
        buffer.put_bytes(b"hello world");
        assert_eq!(buffer.get_bytes(5), Some(&b"hello"[..]));
        assert_eq!(buffer.remaining(), 6);
        assert_eq!(buffer.get_bytes(6), Some(&b" world"[..]));
        assert_eq!(buffer.get_bytes(1), None);
    }

    #[test]
    fn prepare_receive_sizes_buffer() {
        let mut buffer = WireBuffer::new();
        buffer.put_u32(42);
        buffer.fail();
        let space = buffer.prepare_receive(2).expect("allocation");
        space.copy_from_slice(&[9, 8]);
        assert!(!buffer.has_error());
        assert_eq!(buffer.get_u8(), Some(9));
        assert_eq!(buffer.get_u8(), Some(8));
    }
}
