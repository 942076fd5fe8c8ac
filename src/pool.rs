//! Reusable datagram buffers
//!
//! Every outgoing datagram and every retained send payload is an MTU-sized
//! buffer taken from here; dropping a [`PooledBuffer`] hands it back.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::packet::MIN_MTU;

static SEND_BUFFER_POOL: OnceLock<BufferPool> = OnceLock::new();

/// Buffers retained beyond this are freed instead of pooled
const MAX_POOLED_BUFFERS: usize = 1024;

/// Pool shared by all sockets in the process
pub(crate) fn send_buffers() -> &'static BufferPool {
    SEND_BUFFER_POOL.get_or_init(|| BufferPool::new(MIN_MTU, MAX_POOLED_BUFFERS))
}

#[derive(Clone)]
pub(crate) struct BufferPool {
    inner: Arc<Mutex<BufferPoolInner>>,
}

struct BufferPoolInner {
    buffers: Vec<Vec<u8>>,
    buffer_size: usize,
    max_buffers: usize,
}

/// Buffer that returns itself to its pool on drop
pub(crate) struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<Mutex<BufferPoolInner>>,
}

impl BufferPool {
    pub(crate) fn new(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferPoolInner {
                buffers: Vec::with_capacity(max_buffers.min(64)),
                buffer_size,
                max_buffers,
            })),
        }
    }

    /// Empty buffer with at least `buffer_size` capacity
    pub(crate) fn get(&self) -> PooledBuffer {
        let data = {
            let mut inner = self.inner.lock();
            let size = inner.buffer_size;
            inner
                .buffers
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(size))
        };
        PooledBuffer {
            data,
            pool: self.inner.clone(),
        }
    }

    /// Pooled copy of `bytes`
    pub(crate) fn copy_from(&self, bytes: &[u8]) -> PooledBuffer {
        let mut buf = self.get();
        buf.extend_from_slice(bytes);
        buf
    }

    /// Buffers currently idle in the pool
    pub(crate) fn idle(&self) -> usize {
        self.inner.lock().buffers.len()
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        let mut inner = self.pool.lock();
        // Oversized buffers were grown past the MTU; let them go.
        if inner.buffers.len() < inner.max_buffers && data.capacity() <= inner.buffer_size * 2 {
            data.clear();
            inner.buffers.push(data);
        }
    }
}
