//! Descriptor chain walking shared by both ring roles

use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap, Le16, Le32, Le64};

use super::{Buffer, DescFlags, Gathered, RingHandle, RingLayout};
use crate::error::QueueError;

/// Descriptor as laid out in the descriptor table
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RawDescriptor {
    pub addr: Le64,
    pub len: Le32,
    pub flags: Le16,
    pub next: Le16,
}

// SAFETY: RawDescriptor contains only POD types and has no padding
unsafe impl ByteValued for RawDescriptor {}

impl RawDescriptor {
    pub fn new(addr: u64, len: u32, flags: u16, next: u16) -> Self {
        RawDescriptor {
            addr: Le64::from(addr),
            len: Le32::from(len),
            flags: Le16::from(flags),
            next: Le16::from(next),
        }
    }

    pub fn addr(&self) -> u64 {
        u64::from(self.addr)
    }

    pub fn len(&self) -> u32 {
        u32::from(self.len)
    }

    pub fn flags(&self) -> u16 {
        u16::from(self.flags)
    }

    pub fn next(&self) -> u16 {
        u16::from(self.next)
    }
}

/// Read the descriptor under the handle's cursor and advance the cursor
pub(super) fn next_segment(
    mem: &GuestMemoryMmap,
    layout: &RingLayout,
    queue: u16,
    handle: &mut RingHandle,
) -> Result<Gathered, QueueError> {
    handle.check_queue(queue)?;

    let Some(index) = handle.cursor else {
        return Ok(Gathered::EndOfChain);
    };
    if index >= layout.size {
        return Err(QueueError::DescriptorIndex { queue, index });
    }
    if handle.budget == 0 {
        return Err(QueueError::ChainLoop {
            queue,
            head: handle.head,
        });
    }

    let desc: RawDescriptor = mem.read_obj(layout.desc_addr(index))?;
    let flags = DescFlags::from_bits(desc.flags());
    if flags.is_indirect() {
        return Err(QueueError::IndirectUnsupported { queue, index });
    }

    handle.budget -= 1;
    handle.cursor = flags.has_next().then(|| desc.next());

    Ok(Gathered::Segment(
        Buffer::new(GuestAddress(desc.addr()), desc.len()),
        flags,
    ))
}
