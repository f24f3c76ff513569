//! Split virtqueue abstraction for guest memory buffer management
//!
//! The bridge drives two rings over the same shared memory:
//! - a device-role ring ([`DeviceQueue`]): the peer posts chains on the
//!   available ring, we consume them and return them on the used ring
//! - a driver-role ring ([`DriverQueue`]): we post chains on the available
//!   ring, the peer consumes them and hands them back on the used ring
//!
//! Both roles hand out a [`RingHandle`] per dequeued chain. Segments are
//! walked with [`Virtqueue::gather`] until it yields [`Gathered::EndOfChain`].

mod chain;
mod device;
mod driver;
mod events;

pub use chain::RawDescriptor;
pub use device::DeviceQueue;
pub use driver::{DriverQueue, Rejected};
pub use events::QueueEvents;

use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::error::QueueError;

/// Virtio descriptor flags
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Largest ring the split layout can express
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Largest segment copied out of shared memory
pub const MAX_SEGMENT_LEN: u32 = 64 * 1024;

/// Ring layout constants
const DESC_SIZE: u64 = 16;
const AVAIL_RING_HEADER: u64 = 4; // flags(2) + idx(2)
const AVAIL_RING_ELEM: u64 = 2;
const USED_RING_HEADER: u64 = 4; // flags(2) + idx(2)
const USED_RING_ELEM: u64 = 8; // id(4) + len(4)
const RING_EVENT_SIZE: u64 = 2; // used_event / avail_event

/// Guest addresses of the three parts of a split ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    /// Number of descriptors
    pub size: u16,
    /// Descriptor table (16-byte aligned)
    pub desc_table: GuestAddress,
    /// Available ring, directly after the descriptor table
    pub avail_ring: GuestAddress,
    /// Used ring, 4-byte aligned after the available ring
    pub used_ring: GuestAddress,
}

impl RingLayout {
    /// Lay out a ring of `size` descriptors starting at `base`
    pub fn new(base: GuestAddress, size: u16) -> Self {
        let desc_table = base;
        let avail_ring = GuestAddress(desc_table.0 + size as u64 * DESC_SIZE);
        let avail_size = AVAIL_RING_HEADER + size as u64 * AVAIL_RING_ELEM + RING_EVENT_SIZE;
        let used_ring = GuestAddress((avail_ring.0 + avail_size + 3) & !3);

        RingLayout {
            size,
            desc_table,
            avail_ring,
            used_ring,
        }
    }

    /// Bytes needed for a ring of `size` descriptors, alignment included
    pub fn total_size(size: u16) -> u64 {
        let layout = RingLayout::new(GuestAddress(0), size);
        layout.end().0
    }

    /// First address past the used ring
    pub fn end(&self) -> GuestAddress {
        GuestAddress(
            self.used_ring.0
                + USED_RING_HEADER
                + self.size as u64 * USED_RING_ELEM
                + RING_EVENT_SIZE,
        )
    }

    /// Check size and alignment rules of the split ring format
    pub fn validate(&self, queue: u16) -> Result<(), QueueError> {
        let size_ok = self.size.is_power_of_two() && self.size <= MAX_QUEUE_SIZE;
        let aligned = self.desc_table.0 % 16 == 0
            && self.avail_ring.0 % 2 == 0
            && self.used_ring.0 % 4 == 0;
        if size_ok && aligned {
            Ok(())
        } else {
            Err(QueueError::InvalidLayout { queue })
        }
    }

    fn desc_addr(&self, index: u16) -> GuestAddress {
        GuestAddress(self.desc_table.0 + index as u64 * DESC_SIZE)
    }

    fn avail_idx_addr(&self) -> GuestAddress {
        GuestAddress(self.avail_ring.0 + 2)
    }

    fn avail_elem_addr(&self, slot: u16) -> GuestAddress {
        GuestAddress(self.avail_ring.0 + AVAIL_RING_HEADER + slot as u64 * AVAIL_RING_ELEM)
    }

    fn used_idx_addr(&self) -> GuestAddress {
        GuestAddress(self.used_ring.0 + 2)
    }

    fn used_elem_addr(&self, slot: u16) -> GuestAddress {
        GuestAddress(self.used_ring.0 + USED_RING_HEADER + slot as u64 * USED_RING_ELEM)
    }
}

/// Descriptor flag bits as seen on a gathered segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescFlags(u16);

impl DescFlags {
    pub const NONE: DescFlags = DescFlags(0);
    pub const WRITE: DescFlags = DescFlags(VIRTQ_DESC_F_WRITE);

    pub fn from_bits(bits: u16) -> Self {
        DescFlags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn has_next(self) -> bool {
        self.0 & VIRTQ_DESC_F_NEXT != 0
    }

    /// Device writes, driver reads
    pub fn is_write_only(self) -> bool {
        self.0 & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn is_indirect(self) -> bool {
        self.0 & VIRTQ_DESC_F_INDIRECT != 0
    }
}

/// A region of shared memory backing one descriptor
///
/// Deliberately not `Clone`: a `Buffer` value stands for ownership of the
/// region. Handing it to a ring or back to a pool consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    addr: GuestAddress,
    len: u32,
}

impl Buffer {
    pub(crate) fn new(addr: GuestAddress, len: u32) -> Self {
        Buffer { addr, len }
    }

    pub fn addr(&self) -> GuestAddress {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the buffer to the bytes actually filled
    pub fn truncate(&mut self, len: u32) {
        self.len = self.len.min(len);
    }

    /// Copy `data` into the start of the buffer
    pub fn write(&self, mem: &GuestMemoryMmap, data: &[u8]) -> Result<(), QueueError> {
        if data.len() > self.len as usize {
            return Err(QueueError::Overflow {
                len: data.len(),
                capacity: self.len,
            });
        }
        mem.write_slice(data, self.addr)?;
        Ok(())
    }

    /// Copy the whole buffer out of shared memory into `out`.
    ///
    /// The length is peer-controlled, so it is checked against
    /// [`MAX_SEGMENT_LEN`] and the mapped range before `out` grows.
    pub fn read(&self, mem: &GuestMemoryMmap, out: &mut Vec<u8>) -> Result<(), QueueError> {
        if self.len > MAX_SEGMENT_LEN {
            return Err(QueueError::SegmentTooLong {
                len: self.len,
                max: MAX_SEGMENT_LEN,
            });
        }
        if !mem.check_range(self.addr, self.len as usize) {
            return Err(QueueError::SegmentOutOfRange {
                addr: self.addr.0,
                len: self.len,
            });
        }
        out.resize(self.len as usize, 0);
        mem.read_slice(out, self.addr)?;
        Ok(())
    }
}

/// Result of one gather step
#[derive(Debug, PartialEq, Eq)]
pub enum Gathered {
    /// Next segment of the chain, in chain order
    Segment(Buffer, DescFlags),
    /// The chain has no more segments
    EndOfChain,
}

/// Token for one in-flight descriptor chain
///
/// Obtained when a chain is dequeued and consumed when the chain is retired,
/// so a handle cannot outlive its transaction.
#[derive(Debug)]
pub struct RingHandle {
    queue: u16,
    head: u16,
    /// Next descriptor to gather
    cursor: Option<u16>,
    /// Descriptors left before the walk is considered a loop
    budget: u16,
}

impl RingHandle {
    fn new(queue: u16, head: u16, budget: u16) -> Self {
        RingHandle {
            queue,
            head,
            cursor: Some(head),
            budget,
        }
    }

    /// Index of the queue this handle belongs to
    pub fn queue(&self) -> u16 {
        self.queue
    }

    /// Head descriptor index of the chain
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Whether every segment has been gathered
    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    fn check_queue(&self, expected: u16) -> Result<(), QueueError> {
        if self.queue == expected {
            Ok(())
        } else {
            Err(QueueError::ForeignHandle {
                expected,
                found: self.queue,
            })
        }
    }
}

/// Operations common to both ring roles
pub trait Virtqueue {
    /// Queue index (0 = receive, 1 = transmit by convention)
    fn index(&self) -> u16;

    /// Ring addresses
    fn layout(&self) -> &RingLayout;

    /// Non-blocking pending-work flag.
    ///
    /// Device role: the available ring has unconsumed entries.
    /// Driver role: the used ring has unconsumed completions.
    ///
    /// Each queue is only touched by one host thread, so a plain acquire load
    /// of the peer's index is enough here.
    fn pending(&self, mem: &GuestMemoryMmap) -> Result<bool, QueueError>;

    /// Ring the peer's doorbell
    fn notify(&self);

    /// Yield the next segment of the chain behind `handle`.
    ///
    /// Does not touch ring state; only the handle's cursor advances.
    fn gather(
        &self,
        mem: &GuestMemoryMmap,
        handle: &mut RingHandle,
    ) -> Result<Gathered, QueueError> {
        chain::next_segment(mem, self.layout(), self.index(), handle)
    }
}
