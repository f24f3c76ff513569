//! Simulated guest: posts receive buffers and consumes transmit frames

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use mvirt_vqnet::virtqueue::{DescFlags, DeviceQueue, DriverQueue, Gathered, Virtqueue};
use mvirt_vqnet::{BridgeConfig, BufferPool, DeviceEvents};

use super::{GUEST_CHUNK_SIZE, GUEST_CHUNKS, GUEST_POOL_BASE};

/// Guest end of both rings
pub struct TestGuest {
    mem: GuestMemoryMmap,
    /// Driver of the receive ring
    pub rx: DriverQueue,
    /// Device end of the transmit ring
    pub tx: DeviceQueue,
    /// Backing store for posted receive buffers
    pub pool: BufferPool,
}

impl TestGuest {
    /// `events` must be the peer view of the device's eventfds
    pub fn new(config: &BridgeConfig, mem: GuestMemoryMmap, events: DeviceEvents) -> Self {
        let rx = DriverQueue::new(config.rx_queue_index, config.rx_layout(), events.rx, &mem)
            .expect("guest rx queue");
        let tx = DeviceQueue::new(config.tx_queue_index, config.tx_layout(), events.tx, &mem)
            .expect("guest tx queue");
        let pool = BufferPool::new(GuestAddress(GUEST_POOL_BASE), GUEST_CHUNK_SIZE, GUEST_CHUNKS)
            .expect("guest pool");

        TestGuest { mem, rx, tx, pool }
    }

    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// Post one chain on the receive ring and ring the doorbell.
    ///
    /// Each segment is a 1500-byte buffer shrunk to the frame it holds.
    pub fn post_rx(&mut self, frames: &[&[u8]]) -> u16 {
        self.try_post_rx(frames).expect("post rx chain")
    }

    /// Like [`post_rx`](Self::post_rx) but returns `None` when the guest is
    /// out of buffers or ring space
    pub fn try_post_rx(&mut self, frames: &[&[u8]]) -> Option<u16> {
        let mut segments = Vec::with_capacity(frames.len());
        for frame in frames {
            match self.pool.allocate(1500) {
                Ok(mut buffer) => {
                    buffer.write(&self.mem, frame).expect("fill rx buffer");
                    buffer.truncate(frame.len() as u32);
                    segments.push((buffer, DescFlags::NONE));
                }
                Err(_) => {
                    for (buffer, _) in segments {
                        self.pool.free(buffer).expect("free");
                    }
                    return None;
                }
            }
        }

        match self.rx.add_available(&self.mem, segments) {
            Ok(head) => {
                self.rx.notify();
                Some(head)
            }
            Err(rejected) => {
                for buffer in rejected.buffers {
                    self.pool.free(buffer).expect("free");
                }
                None
            }
        }
    }

    /// Collect receive chains the device returned, freeing their buffers.
    ///
    /// Returns `(head, len)` per used entry.
    pub fn take_rx_used(&mut self) -> Vec<(u16, u32)> {
        let mut used = Vec::new();
        while let Some((mut handle, len)) = self.rx.get_used_buf(&self.mem).expect("rx used") {
            while let Gathered::Segment(buffer, _) =
                self.rx.gather(&self.mem, &mut handle).expect("gather rx")
            {
                self.pool.free(buffer).expect("free rx buffer");
            }
            used.push((handle.head(), len));
            self.rx.retire(handle).expect("retire");
        }
        used
    }

    /// Used index of the receive ring as published in shared memory
    pub fn rx_used_idx(&self) -> u16 {
        let addr = GuestAddress(self.rx.layout().used_ring.0 + 2);
        u16::from_le(self.mem.read_obj(addr).expect("used idx"))
    }

    /// Consume every frame on the transmit ring and return it as used
    pub fn consume_tx(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(mut handle) = self.tx.get_available_buf(&self.mem).expect("tx avail") {
            let mut frame = Vec::new();
            while let Gathered::Segment(buffer, _) =
                self.tx.gather(&self.mem, &mut handle).expect("gather tx")
            {
                let mut segment = Vec::new();
                buffer.read(&self.mem, &mut segment).expect("read tx");
                frame.extend_from_slice(&segment);
            }
            self.tx
                .add_used_buf(&self.mem, handle, frame.len() as u32)
                .expect("tx used");
            frames.push(frame);
        }
        if !frames.is_empty() {
            self.tx.notify();
        }
        frames
    }

    /// Doorbells the device rang on the receive ring
    pub fn rx_doorbells(&self) -> u64 {
        self.rx.events().drain()
    }

    /// Doorbells the device rang on the transmit ring
    pub fn tx_doorbells(&self) -> u64 {
        self.tx.events().drain()
    }
}
