//! Fixed-length reusable byte buffers. Their main purpose is to minimize
//!  copying and allow aggressive reuse through the frame pool.
//!
//! Salient points:
//!
//! * backed by a fixed-length, pre-allocated buffer
//! * implement `BufMut` to fit into the `bytes` ecosystem
//! * support patching previously written positions, which the fragment
//!   writer needs for backfilling chunk lengths and checksums

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A fixed-length dynamically allocated buffer
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    /// create a new FixedBuf instance with the given buffer capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // in this particular use case, there is no real benefit in lazily initializing the
            //  buffer since buffers are reused aggressively, and we trade the overhead of
            //  initial initialization for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// make the entire underlying buffer available through as_ref() etc.
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// overwrite a single previously written byte in place
    pub fn patch_u8_at(&mut self, offset: usize, value: u8) {
        assert!(offset < self.len);
        self.buf[offset] = value;
    }

    /// overwrite a previously written big-endian u16 in place
    pub fn patch_u16_at(&mut self, offset: usize, value: u16) {
        assert!(offset + 2 <= self.len);
        self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// overwrite a previously written run of bytes in place
    pub fn patch_slice_at(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len);
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    /// This is a convenience function for test code. It derives the buffer's capacity from the
    ///  slice used for initialization, which is a shortcut not intended for production usage.
    #[cfg(test)]
    pub fn from_slice(data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(data.len());
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
