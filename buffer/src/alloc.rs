//! Buffer allocation facade.

use crate::bytebuf::ByteBuf;

/// Default capacity for [`BufAllocator::buffer`], sized for a typical
/// socket read.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024;

/// Hands out byte buffers for the transport and codec layers.
///
/// This is the seam the channel read path and the decoder's cumulation
/// strategies allocate through, so a pooling implementation can be swapped
/// in behind it without touching either.
#[derive(Debug, Clone)]
pub struct BufAllocator {
    default_capacity: usize,
}

impl BufAllocator {
    pub fn new(default_capacity: usize) -> Self {
        Self { default_capacity }
    }

    /// A buffer of the allocator's default capacity.
    pub fn buffer(&self) -> ByteBuf {
        ByteBuf::with_capacity(self.default_capacity)
    }

    /// A buffer with the given initial capacity and no growth bound.
    pub fn alloc(&self, capacity: usize) -> ByteBuf {
        ByteBuf::with_capacity(capacity)
    }

    /// A buffer bounded to `max_capacity`.
    pub fn alloc_bounded(&self, capacity: usize, max_capacity: usize) -> ByteBuf {
        ByteBuf::bounded(capacity, max_capacity)
    }
}

impl Default for BufAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
