//! A fixed-capacity byte buffer with a movable window of live data, used for data that was
//!  accepted but not sent yet, and for reassembling datagrams from a byte stream.
//!
//! The backing store never changes size. Consuming data advances the window's head, and
//!  getting more headroom means either sliding the live bytes to the front ([ByteBuffer::compact])
//!  or copying them into a bigger buffer ([ByteBuffer::regrow]).

use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

#[derive(Eq)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl ByteBuffer {
    pub fn alloc(capacity: usize) -> ByteBuffer {
        ByteBuffer {
            buf: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    /// allocate a buffer of the given capacity, initialized with a copy of `data`
    pub fn seeded(capacity: usize, data: &[u8]) -> ByteBuffer {
        assert!(data.len() <= capacity);

        let mut result = ByteBuffer::alloc(capacity);
        result.buf[..data.len()].copy_from_slice(data);
        result.len = data.len();
        result
    }

    /// a buffer that holds exactly `data`
    pub fn copy_of(data: &[u8]) -> ByteBuffer {
        ByteBuffer::seeded(data.len(), data)
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> usize {
        self.head
    }

    /// number of bytes that can be appended without compacting
    pub fn tail_room(&self) -> usize {
        self.capacity() - self.head - self.len
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// drop `n` bytes from the front of the live window
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len);
        self.head += n;
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
    }

    /// the free space after the live window, to be filled and then [ByteBuffer::commit]ted
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let start = self.head + self.len;
        &mut self.buf[start..]
    }

    /// make `n` bytes written into [ByteBuffer::spare_mut] part of the live window
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.tail_room());
        self.len += n;
    }

    /// move the live bytes to the start of the backing store
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        if self.len > 0 {
            self.buf.copy_within(self.head..self.head + self.len, 0);
        }
        self.head = 0;
    }

    /// a fresh buffer with (at least) the given capacity, holding this buffer's live bytes at its front
    pub fn regrow(&self, min_capacity: usize) -> ByteBuffer {
        ByteBuffer::seeded(min_capacity.max(self.len), self.as_ref())
    }
}

impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for ByteBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteBuffer{{head:{}, len:{}, capacity:{}}}", self.head, self.len, self.capacity())
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf[self.head..self.head + self.len]
    }
}

impl bytes::Buf for ByteBuffer {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        self.as_ref()
    }

    fn advance(&mut self, cnt: usize) {
        self.consume(cnt);
    }
}

unsafe impl bytes::BufMut for ByteBuffer {
    fn remaining_mut(&self) -> usize {
        self.tail_room()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.commit(cnt);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(self.spare_mut())
    }
}
