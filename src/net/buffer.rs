//! Datagram buffer recycling. Connections churn through EMTU-sized scratch
//! buffers on every packet; a small free-list keeps the allocator out of the
//! hot path while periodically shedding capacity so the pool cannot grow
//! without bound.

/// Every nth returned buffer is dropped instead of pooled.
const DROP_INTERVAL: u64 = 8;

/// Free-list of fixed-size byte buffers.
pub struct BufferPool {
    size: usize,
    free: Vec<Vec<u8>>,
    returned: u64,
}

impl BufferPool {
    #[inline]
    pub fn new(size: usize) -> BufferPool {
        BufferPool {
            size,
            free: Vec::new(),
            returned: 0,
        }
    }

    /// The fixed buffer size handed out by this pool.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Number of buffers currently pooled.
    #[inline]
    pub fn pooled(&self) -> usize {
        self.free.len()
    }

    /// Takes a zeroed buffer of the pool's size.
    #[inline]
    pub fn take(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.size, 0);
                buf
            }
            None => vec![0u8; self.size],
        }
    }

    /// Returns a buffer to the pool. Buffers of a foreign size and every
    /// eighth returned buffer are dropped.
    #[inline]
    pub fn put(&mut self, buf: Vec<u8>) {
        if buf.capacity() < self.size {
            return;
        }

        self.returned += 1;
        if self.returned % DROP_INTERVAL == 0 {
            return;
        }

        self.free.push(buf);
    }
}
