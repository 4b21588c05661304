use std::sync::Mutex;

use tracing::debug;

/// Maximum number of idle buffers kept for reuse.
pub const MAX_POOLED_BUFFERS: usize = 10;

/// Free-list of equally sized byte buffers.
///
/// Pixel payloads of one acquisition all have the same size, so the pool
/// tracks a single active size class. Checking out a buffer of a different
/// capacity switches the class and drops every buffer of the old one.
///
/// The pool is shared between the producer thread (checkout) and the write
/// worker (checkin after the physical write completes).
#[derive(Debug, Default)]
pub struct BufferPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    capacity: usize,
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a zero-length buffer with room for `capacity` bytes.
    ///
    /// Reuses a pooled buffer when one of the current size class is available,
    /// otherwise allocates.
    pub fn checkout(&self, capacity: usize) -> Vec<u8> {
        let reused = {
            let mut inner = self.lock();
            if inner.capacity != capacity {
                if !inner.free.is_empty() {
                    debug!(
                        "Buffer size class changed from {} to {} bytes, dropping {} pooled buffers",
                        inner.capacity,
                        capacity,
                        inner.free.len()
                    );
                }
                inner.free.clear();
                inner.capacity = capacity;
            }
            inner.free.pop()
        };

        match reused {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(capacity),
        }
    }

    /// Return a buffer after its contents have been written.
    ///
    /// Buffers whose length does not match the active size class are dropped.
    pub fn checkin(&self, buf: Vec<u8>) {
        let mut inner = self.lock();
        if buf.len() == inner.capacity && inner.free.len() < MAX_POOLED_BUFFERS {
            inner.free.push(buf);
        }
    }

    /// Current size class in bytes.
    pub fn size_class(&self) -> usize {
        self.lock().capacity
    }

    /// Number of idle buffers.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        // A panic while holding the lock cannot leave the free list inconsistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
