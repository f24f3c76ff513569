//! Device-role virtqueue: consume available chains, produce used entries

use std::num::Wrapping;
use std::sync::atomic::{Ordering, fence};

use tracing::{debug, trace};
use virtio_queue::{Queue, QueueT};
use vm_memory::GuestMemoryMmap;

use super::{QueueEvents, RingHandle, RingLayout, Virtqueue};
use crate::error::QueueError;

/// Device side of a split ring, backed by `virtio_queue::Queue`
pub struct DeviceQueue {
    index: u16,
    layout: RingLayout,
    queue: Queue,
    /// Heads dequeued but not yet returned on the used ring
    outstanding: Vec<bool>,
    events: QueueEvents,
}

impl DeviceQueue {
    /// Bind a device-role queue to the ring at `layout`
    pub fn new(
        index: u16,
        layout: RingLayout,
        events: QueueEvents,
        mem: &GuestMemoryMmap,
    ) -> Result<Self, QueueError> {
        layout.validate(index)?;

        let mut queue = Queue::new(layout.size)?;
        queue.set_size(layout.size);
        queue.set_desc_table_address(
            Some(layout.desc_table.0 as u32),
            Some((layout.desc_table.0 >> 32) as u32),
        );
        queue.set_avail_ring_address(
            Some(layout.avail_ring.0 as u32),
            Some((layout.avail_ring.0 >> 32) as u32),
        );
        queue.set_used_ring_address(
            Some(layout.used_ring.0 as u32),
            Some((layout.used_ring.0 >> 32) as u32),
        );
        queue.set_ready(true);

        if !queue.is_valid(mem) {
            return Err(QueueError::InvalidLayout { queue: index });
        }

        debug!(queue = index, size = layout.size, "Device-role virtqueue ready");

        Ok(DeviceQueue {
            index,
            layout,
            queue,
            outstanding: vec![false; layout.size as usize],
            events,
        })
    }

    pub fn events(&self) -> &QueueEvents {
        &self.events
    }

    /// Next available-ring slot we will consume
    pub fn next_avail(&self) -> u16 {
        self.queue.next_avail()
    }

    /// Used index we have published so far
    pub fn next_used(&self) -> u16 {
        self.queue.next_used()
    }

    /// Dequeue one chain from the available ring.
    ///
    /// `Ok(None)` means the ring was empty, which is benign even when the
    /// pending flag was set a moment ago.
    pub fn get_available_buf(
        &mut self,
        mem: &GuestMemoryMmap,
    ) -> Result<Option<RingHandle>, QueueError> {
        let Some(chain) = self.queue.pop_descriptor_chain(mem) else {
            return Ok(None);
        };
        let head = chain.head_index();

        if head >= self.layout.size {
            return Err(QueueError::DescriptorIndex {
                queue: self.index,
                index: head,
            });
        }
        if self.outstanding[head as usize] {
            return Err(QueueError::DuplicateHead {
                queue: self.index,
                head,
            });
        }
        self.outstanding[head as usize] = true;

        trace!(queue = self.index, head, "Dequeued available chain");
        Ok(Some(RingHandle::new(self.index, head, self.layout.size)))
    }

    /// Return the chain behind `handle` on the used ring.
    ///
    /// `len` is the number of bytes written into the chain. Buffer contents
    /// are published before the used index moves.
    pub fn add_used_buf(
        &mut self,
        mem: &GuestMemoryMmap,
        handle: RingHandle,
        len: u32,
    ) -> Result<(), QueueError> {
        handle.check_queue(self.index)?;

        // Buffer writes must be visible before the used entry
        fence(Ordering::Release);
        self.queue.add_used(mem, handle.head, len)?;
        self.outstanding[handle.head as usize] = false;

        trace!(queue = self.index, head = handle.head, len, "Added used chain");
        Ok(())
    }
}

impl Virtqueue for DeviceQueue {
    fn index(&self) -> u16 {
        self.index
    }

    fn layout(&self) -> &RingLayout {
        &self.layout
    }

    fn pending(&self, mem: &GuestMemoryMmap) -> Result<bool, QueueError> {
        let avail_idx = self.queue.avail_idx(mem, Ordering::Acquire)?;
        Ok(avail_idx != Wrapping(self.queue.next_avail()))
    }

    fn notify(&self) {
        self.events.ring();
    }
}
