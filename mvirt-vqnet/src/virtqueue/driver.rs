//! Driver-role virtqueue: produce available chains, consume used entries
//!
//! Follows the Linux `virtio_ring` driver: a free list of descriptors, a
//! shadow of the published available index and the last used index seen.
//! The free-list links live in host memory so the peer cannot redirect them.

use std::sync::atomic::{Ordering, fence};

use tracing::{debug, trace};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::chain::RawDescriptor;
use super::{
    Buffer, DescFlags, QueueEvents, RingHandle, RingLayout, VIRTQ_DESC_F_NEXT,
    VIRTQ_DESC_F_WRITE, Virtqueue,
};
use crate::error::QueueError;

/// Lifecycle of a chain head on the driver side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainState {
    Idle,
    /// Published on the available ring, owned by the peer
    Posted { len: u16 },
    /// Returned on the used ring, held by a live handle
    Returned { len: u16 },
}

/// A chain that could not be published; the buffers go back to the caller
#[derive(Debug)]
pub struct Rejected {
    pub buffers: Vec<Buffer>,
    pub error: QueueError,
}

/// Driver side of a split ring
pub struct DriverQueue {
    index: u16,
    layout: RingLayout,

    /// Head of free descriptor list
    free_head: u16,
    /// Number of free descriptors
    num_free: u16,
    /// Free-list links, `next_free[i]` follows descriptor `i`
    next_free: Vec<u16>,

    /// Shadow of avail->idx for tracking what we've published
    avail_idx_shadow: u16,
    /// Last seen used->idx
    last_used_idx: u16,

    /// Per-head chain state
    chains: Vec<ChainState>,

    events: QueueEvents,
}

impl DriverQueue {
    /// Bind a driver-role queue to the ring at `layout` and reset the ring
    pub fn new(
        index: u16,
        layout: RingLayout,
        events: QueueEvents,
        mem: &GuestMemoryMmap,
    ) -> Result<Self, QueueError> {
        layout.validate(index)?;

        let size = layout.size as usize;
        let mut queue = DriverQueue {
            index,
            layout,
            free_head: 0,
            num_free: layout.size,
            next_free: vec![0; size],
            avail_idx_shadow: 0,
            last_used_idx: 0,
            chains: vec![ChainState::Idle; size],
            events,
        };
        queue.init(mem)?;

        debug!(queue = index, size = layout.size, "Driver-role virtqueue ready");
        Ok(queue)
    }

    /// Zero the ring area and rebuild the free list
    pub fn init(&mut self, mem: &GuestMemoryMmap) -> Result<(), QueueError> {
        let total = (self.layout.end().0 - self.layout.desc_table.0) as usize;
        mem.write_slice(&vec![0u8; total], self.layout.desc_table)?;

        for (i, next) in self.next_free.iter_mut().enumerate() {
            *next = (i as u16).wrapping_add(1);
        }
        self.chains.fill(ChainState::Idle);
        self.free_head = 0;
        self.num_free = self.layout.size;
        self.avail_idx_shadow = 0;
        self.last_used_idx = 0;

        Ok(())
    }

    pub fn events(&self) -> &QueueEvents {
        &self.events
    }

    /// Number of free descriptors
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Available index published so far
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx_shadow
    }

    /// Used index consumed so far
    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    /// Publish `segments` as one chain on the available ring.
    ///
    /// Segment order is chain order. Only the WRITE bit of each segment's
    /// flags is honoured; NEXT is managed here. On failure nothing is
    /// published and every buffer is handed back in [`Rejected`].
    pub fn add_available(
        &mut self,
        mem: &GuestMemoryMmap,
        segments: Vec<(Buffer, DescFlags)>,
    ) -> Result<u16, Rejected> {
        let error = if segments.is_empty() {
            Some(QueueError::EmptyChain { queue: self.index })
        } else if segments.len() > self.num_free as usize {
            Some(QueueError::RingFull {
                queue: self.index,
                needed: segments.len(),
                free: self.num_free,
            })
        } else {
            None
        };

        let result = match error {
            Some(error) => Err(error),
            None => self.publish(mem, &segments),
        };

        result.map_err(|error| Rejected {
            buffers: segments.into_iter().map(|(buffer, _)| buffer).collect(),
            error,
        })
    }

    fn publish(
        &mut self,
        mem: &GuestMemoryMmap,
        segments: &[(Buffer, DescFlags)],
    ) -> Result<u16, QueueError> {
        let head = self.free_head;
        let mut desc_idx = head;

        for (i, (buffer, flags)) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;
            let next = self.next_free[desc_idx as usize];

            let mut bits = flags.bits() & VIRTQ_DESC_F_WRITE;
            if !is_last {
                bits |= VIRTQ_DESC_F_NEXT;
            }
            let desc = RawDescriptor::new(
                buffer.addr().0,
                buffer.len(),
                bits,
                if is_last { 0 } else { next },
            );
            mem.write_obj(desc, self.layout.desc_addr(desc_idx))?;

            desc_idx = next;
        }

        // Add to available ring
        let slot = self.avail_idx_shadow % self.layout.size;
        mem.write_obj(head.to_le(), self.layout.avail_elem_addr(slot))?;

        // Descriptors and buffer contents before avail->idx
        fence(Ordering::Release);
        let new_idx = self.avail_idx_shadow.wrapping_add(1);
        mem.store(new_idx.to_le(), self.layout.avail_idx_addr(), Ordering::Release)?;

        // Nothing can fail past this point
        let count = segments.len() as u16;
        self.free_head = desc_idx;
        self.num_free -= count;
        self.chains[head as usize] = ChainState::Posted { len: count };
        self.avail_idx_shadow = new_idx;

        trace!(queue = self.index, head, count, avail_idx = new_idx, "Published chain");
        Ok(head)
    }

    /// Pop one entry from the used ring.
    ///
    /// Returns the chain handle and the byte count the peer reported.
    /// The entry is consumed even when it turns out to be invalid.
    pub fn get_used_buf(
        &mut self,
        mem: &GuestMemoryMmap,
    ) -> Result<Option<(RingHandle, u32)>, QueueError> {
        let used_idx = u16::from_le(mem.load(self.layout.used_idx_addr(), Ordering::Acquire)?);
        if used_idx == self.last_used_idx {
            return Ok(None);
        }

        let slot = self.last_used_idx % self.layout.size;
        let elem = self.layout.used_elem_addr(slot);
        let id = u32::from_le(mem.read_obj(elem)?);
        let len = u32::from_le(mem.read_obj(GuestAddress(elem.0 + 4))?);
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let head = u16::try_from(id)
            .ok()
            .filter(|head| *head < self.layout.size)
            .ok_or(QueueError::UnknownUsedId {
                queue: self.index,
                id,
            })?;

        match self.chains[head as usize] {
            ChainState::Posted { len: chain_len } => {
                self.chains[head as usize] = ChainState::Returned { len: chain_len };
                trace!(queue = self.index, head, len, "Popped used chain");
                Ok(Some((RingHandle::new(self.index, head, chain_len), len)))
            }
            _ => Err(QueueError::UnknownUsedId {
                queue: self.index,
                id,
            }),
        }
    }

    /// Return the descriptors of a completed chain to the free list
    pub fn retire(&mut self, handle: RingHandle) -> Result<(), QueueError> {
        handle.check_queue(self.index)?;

        let head = handle.head;
        let ChainState::Returned { len } = self.chains[head as usize] else {
            return Err(QueueError::UnknownUsedId {
                queue: self.index,
                id: head as u32,
            });
        };

        // Find the tail of the chain
        let mut tail = head;
        for _ in 1..len {
            tail = self.next_free[tail as usize];
        }

        // Link tail to current free_head
        self.next_free[tail as usize] = self.free_head;
        self.free_head = head;
        self.num_free += len;
        self.chains[head as usize] = ChainState::Idle;

        Ok(())
    }
}

impl Virtqueue for DriverQueue {
    fn index(&self) -> u16 {
        self.index
    }

    fn layout(&self) -> &RingLayout {
        &self.layout
    }

    fn pending(&self, mem: &GuestMemoryMmap) -> Result<bool, QueueError> {
        let used_idx = u16::from_le(mem.load(self.layout.used_idx_addr(), Ordering::Acquire)?);
        Ok(used_idx != self.last_used_idx)
    }

    fn notify(&self) {
        self.events.ring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::test_util::create_guest_memory;
    use crate::virtqueue::{DeviceQueue, Gathered};

    fn create_driver(mem: &GuestMemoryMmap, size: u16) -> DriverQueue {
        let layout = RingLayout::new(GuestAddress(0), size);
        DriverQueue::new(1, layout, QueueEvents::new().expect("events"), mem).expect("driver")
    }

    fn pool() -> BufferPool {
        BufferPool::new(GuestAddress(0x8000), 2048, 16).expect("pool")
    }

    #[test]
    fn test_free_list_init() {
        let mem = create_guest_memory(64 * 1024);
        let vq = create_driver(&mem, 16);

        assert_eq!(vq.num_free(), 16);
        assert_eq!(vq.free_head, 0);
        for i in 0..15u16 {
            assert_eq!(vq.next_free[i as usize], i + 1);
        }
    }

    #[test]
    fn test_add_single_buffer() {
        let mem = create_guest_memory(64 * 1024);
        let mut vq = create_driver(&mem, 16);
        let mut pool = pool();

        let buffer = pool.allocate(256).expect("alloc");
        let addr = buffer.addr();
        let head = vq
            .add_available(&mem, vec![(buffer, DescFlags::NONE)])
            .expect("add");

        assert_eq!(head, 0);
        assert_eq!(vq.num_free(), 15);
        assert_eq!(vq.avail_idx(), 1);

        let desc: RawDescriptor = mem.read_obj(GuestAddress(0)).expect("desc");
        assert_eq!(desc.addr(), addr.0);
        assert_eq!(desc.len(), 256);
        assert_eq!(desc.flags(), 0);

        let avail_idx: u16 = mem
            .read_obj(GuestAddress(vq.layout.avail_ring.0 + 2))
            .expect("avail idx");
        let avail_entry: u16 = mem
            .read_obj(GuestAddress(vq.layout.avail_ring.0 + 4))
            .expect("avail entry");
        assert_eq!(avail_idx, 1);
        assert_eq!(avail_entry, 0);
    }

    #[test]
    fn test_add_chained_buffer() {
        let mem = create_guest_memory(64 * 1024);
        let mut vq = create_driver(&mem, 16);
        let mut pool = pool();

        let segments = vec![
            (pool.allocate(12).expect("alloc"), DescFlags::NONE),
            (pool.allocate(1500).expect("alloc"), DescFlags::NONE),
            (pool.allocate(100).expect("alloc"), DescFlags::WRITE),
        ];
        vq.add_available(&mem, segments).expect("add");
        assert_eq!(vq.num_free(), 13);

        let flags0: u16 = mem.read_obj(GuestAddress(12)).expect("flags0");
        let flags1: u16 = mem.read_obj(GuestAddress(16 + 12)).expect("flags1");
        let flags2: u16 = mem.read_obj(GuestAddress(32 + 12)).expect("flags2");
        assert_eq!(flags0, VIRTQ_DESC_F_NEXT);
        assert_eq!(flags1, VIRTQ_DESC_F_NEXT);
        assert_eq!(flags2, VIRTQ_DESC_F_WRITE);
    }

    #[test]
    fn test_ring_full_returns_buffers() {
        let mem = create_guest_memory(64 * 1024);
        let mut vq = create_driver(&mem, 2);
        let mut pool = pool();

        let segments = (0..3)
            .map(|_| (pool.allocate(64).expect("alloc"), DescFlags::NONE))
            .collect();
        let rejected = vq.add_available(&mem, segments).expect_err("ring full");

        assert!(matches!(
            rejected.error,
            QueueError::RingFull {
                needed: 3,
                free: 2,
                ..
            }
        ));
        assert_eq!(rejected.buffers.len(), 3);
        assert_eq!(vq.num_free(), 2);
        assert_eq!(vq.avail_idx(), 0);

        for buffer in rejected.buffers {
            pool.free(buffer).expect("free");
        }
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn test_empty_chain_rejected() {
        let mem = create_guest_memory(64 * 1024);
        let mut vq = create_driver(&mem, 4);

        let rejected = vq.add_available(&mem, Vec::new()).expect_err("empty");
        assert!(matches!(rejected.error, QueueError::EmptyChain { .. }));
    }

    #[test]
    fn test_used_round_trip_recycles_descriptors() {
        let mem = create_guest_memory(64 * 1024);
        let layout = RingLayout::new(GuestAddress(0), 8);
        let events = QueueEvents::new().expect("events");
        let peer_events = events.peer().expect("peer");
        let mut vq = DriverQueue::new(1, layout, events, &mem).expect("driver");
        let mut peer = DeviceQueue::new(1, layout, peer_events, &mem).expect("device");
        let mut pool = pool();

        let segments = vec![
            (pool.allocate(64).expect("alloc"), DescFlags::NONE),
            (pool.allocate(64).expect("alloc"), DescFlags::NONE),
        ];
        let head = vq.add_available(&mem, segments).expect("add");
        vq.notify();
        assert_eq!(peer.events().drain(), 1);
        assert!(!vq.pending(&mem).expect("pending"));

        let peer_handle = peer.get_available_buf(&mem).expect("pop").expect("chain");
        peer.add_used_buf(&mem, peer_handle, 128).expect("used");

        assert!(vq.pending(&mem).expect("pending"));
        let (mut handle, len) = vq.get_used_buf(&mem).expect("get used").expect("entry");
        assert_eq!(handle.head(), head);
        assert_eq!(len, 128);
        assert!(!vq.pending(&mem).expect("pending"));

        let mut gathered = 0;
        while let Gathered::Segment(buffer, _) = vq.gather(&mem, &mut handle).expect("gather") {
            pool.free(buffer).expect("free");
            gathered += 1;
        }
        assert_eq!(gathered, 2);

        vq.retire(handle).expect("retire");
        assert_eq!(vq.num_free(), 8);
        assert_eq!(pool.available(), 16);
        assert!(vq.get_used_buf(&mem).expect("get used").is_none());
    }

    #[test]
    fn test_unknown_used_id_rejected() {
        let mem = create_guest_memory(64 * 1024);
        let mut vq = create_driver(&mem, 8);

        // Peer reports head 3 which was never posted
        let elem = vq.layout.used_elem_addr(0);
        mem.write_obj(3u32.to_le(), elem).expect("id");
        mem.write_obj(1u16.to_le(), vq.layout.used_idx_addr())
            .expect("used idx");

        assert!(matches!(
            vq.get_used_buf(&mem),
            Err(QueueError::UnknownUsedId { id: 3, .. })
        ));
        // The bogus entry is consumed
        assert!(!vq.pending(&mem).expect("pending"));
    }
}
