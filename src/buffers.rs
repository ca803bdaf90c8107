//! Allocation strategy for the engine's segment buffers.
//!
//! The engine never allocates segment storage directly but goes through a [BufferAllocator]
//!  that is handed to it at construction time (see `KcpEngine::with_allocator`). There is no
//!  process-wide override: engines that should share a pool share an `Arc` to it.

use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

pub trait BufferAllocator: Send + Sync {
    /// Returns an empty buffer with a capacity of at least `len` bytes
    fn allocate(&self, len: usize) -> BytesMut;

    /// Hands a buffer back after the engine is done with it. Implementations may keep it for
    ///  reuse or drop it.
    fn release(&self, buffer: BytesMut);
}

/// Allocates a fresh buffer for every request
#[derive(Default)]
pub struct HeapAllocator;
impl BufferAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> BytesMut {
        BytesMut::with_capacity(len)
    }

    fn release(&self, _buffer: BytesMut) {
    }
}

/// Keeps up to `max_pool_size` buffers of a fixed capacity for reuse. Requests for more than
///  `buf_size` bytes are served by fresh allocations which are discarded on release.
///
/// A pool sized to the engines' MSS serves all segment buffers.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// number of buffers currently available for reuse
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

impl BufferAllocator for BufferPool {
    fn allocate(&self, len: usize) -> BytesMut {
        if len > self.buf_size {
            debug!("requested buffer of {} bytes exceeds pooled size {}: allocating", len, self.buf_size);
            return BytesMut::with_capacity(len);
        }

        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            trace!("discarding buffer with irregular capacity {}", buffer.capacity());
            return;
        }

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
