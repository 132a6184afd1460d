use std::sync::Mutex;
use tracing::{debug, trace};
use crate::fixed_buffer::FixedBuf;
use crate::frame::MAX_BODY_LEN;

/// A free-list of reusable frame payload buffers, shared between the reader
///  loop, the fragment writers and the writer loop of a connection.
///
/// All pooled buffers have the full wire payload capacity so a buffer handed
///  out for a small outbound frame can later hold the largest inbound frame.
pub struct FramePool {
    buffers: Mutex<Vec<FixedBuf>>,
}

impl FramePool {
    pub fn new(max_pool_size: usize) -> FramePool {
        FramePool {
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FixedBuf::new(MAX_BODY_LEN)
    }

    pub fn release(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), MAX_BODY_LEN,
                   "returned buffer does not have the regular capacity of {} bytes", MAX_BODY_LEN);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_reuse_clears_buffer() {
        let pool = FramePool::new(4);

        let mut buf = pool.get();
        buf.put_u8(1);
        buf.put_u8(2);
        pool.release(buf);

        let buf = pool.get();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), MAX_BODY_LEN);
    }

    #[test]
    fn test_excess_buffers_are_discarded() {
        let pool = FramePool::new(1);

        pool.release(FixedBuf::new(MAX_BODY_LEN));
        pool.release(FixedBuf::new(MAX_BODY_LEN));

        assert_eq!(pool.buffers.lock().unwrap().len(), 1);
    }

    #[test]
    #[should_panic]
    fn test_wrong_capacity_is_rejected() {
        let pool = FramePool::new(4);
        pool.release(FixedBuf::new(16));
    }
}
