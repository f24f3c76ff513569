//! Shared buffer pool for the driver-role (transmit) ring
//!
//! Carves a guest-visible region into fixed-size chunks. A chunk is owned by
//! the host while allocated, by the peer while its descriptor sits on the
//! ring, and returns to the free list when the used entry is reclaimed.

use crossbeam_queue::ArrayQueue;
use tracing::trace;
use vm_memory::GuestAddress;

use crate::error::{AllocError, FreeError};
use crate::virtqueue::Buffer;

/// Allocation counters, for leak accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful allocations
    pub allocations: u64,
    /// Successful frees
    pub frees: u64,
    /// Allocation requests that failed
    pub failures: u64,
}

impl PoolStats {
    /// Buffers allocated and not yet freed
    pub fn outstanding(&self) -> u64 {
        self.allocations - self.frees
    }
}

/// Fixed-chunk buffer pool over a region of shared memory
pub struct BufferPool {
    /// Guest address of the first chunk
    base: GuestAddress,
    chunk_size: u32,
    chunk_count: u32,
    /// Free list of chunk indices
    free: ArrayQueue<u32>,
    /// Per-chunk allocation flag, catches double and foreign frees
    allocated: Vec<bool>,
    stats: PoolStats,
}

impl BufferPool {
    /// Create a pool of `chunk_count` chunks of `chunk_size` bytes at `base`
    pub fn new(base: GuestAddress, chunk_size: u32, chunk_count: u32) -> Result<Self, AllocError> {
        if chunk_size == 0 || chunk_count == 0 {
            return Err(AllocError::InvalidPool {
                chunk_size,
                chunk_count,
            });
        }

        let free = ArrayQueue::new(chunk_count as usize);
        for i in 0..chunk_count {
            // ArrayQueue::push only fails if full, which can't happen here
            let _ = free.push(i);
        }

        Ok(BufferPool {
            base,
            chunk_size,
            chunk_count,
            free,
            allocated: vec![false; chunk_count as usize],
            stats: PoolStats::default(),
        })
    }

    /// Reserve a chunk and hand out its first `len` bytes
    pub fn allocate(&mut self, len: usize) -> Result<Buffer, AllocError> {
        let result = self.try_allocate(len);
        match &result {
            Ok(buffer) => {
                self.stats.allocations += 1;
                trace!(addr = buffer.addr().0, len, "Allocated buffer");
            }
            Err(_) => self.stats.failures += 1,
        }
        result
    }

    fn try_allocate(&mut self, len: usize) -> Result<Buffer, AllocError> {
        if len == 0 {
            return Err(AllocError::Empty);
        }
        if len > self.chunk_size as usize {
            return Err(AllocError::TooLarge {
                requested: len,
                chunk_size: self.chunk_size,
            });
        }

        let index = self.free.pop().ok_or(AllocError::Exhausted {
            capacity: self.capacity(),
        })?;
        self.allocated[index as usize] = true;

        Ok(Buffer::new(self.chunk_addr(index), len as u32))
    }

    /// Return a buffer's chunk to the free list
    pub fn free(&mut self, buffer: Buffer) -> Result<(), FreeError> {
        let addr = buffer.addr().0;
        let index = self.chunk_index(addr).ok_or(FreeError::NotFromPool(addr))?;

        if !self.allocated[index as usize] {
            return Err(FreeError::NotAllocated(addr));
        }
        self.allocated[index as usize] = false;
        // Cannot overflow: the chunk was marked allocated, so it is not queued
        let _ = self.free.push(index);
        self.stats.frees += 1;

        trace!(addr, "Freed buffer");
        Ok(())
    }

    /// Number of free chunks
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of chunks
    pub fn capacity(&self) -> usize {
        self.chunk_count as usize
    }

    /// Largest buffer a single allocation can return
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Guest address range covered by the pool
    pub fn region(&self) -> (GuestAddress, u64) {
        (self.base, self.chunk_size as u64 * self.chunk_count as u64)
    }

    fn chunk_addr(&self, index: u32) -> GuestAddress {
        GuestAddress(self.base.0 + index as u64 * self.chunk_size as u64)
    }

    /// Chunk index for an address that starts a chunk
    fn chunk_index(&self, addr: u64) -> Option<u32> {
        let offset = addr.checked_sub(self.base.0)?;
        let chunk_size = self.chunk_size as u64;
        if offset % chunk_size != 0 {
            return None;
        }
        let index = offset / chunk_size;
        (index < self.chunk_count as u64).then_some(index as u32)
    }
}
