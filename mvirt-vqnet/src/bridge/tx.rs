//! Transmit path: publish outbound frames, reclaim consumed buffers

use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;

use tracing::{debug, error, trace, warn};
use vm_memory::GuestMemoryMmap;

use crate::buffer::{BufferPool, PoolStats};
use crate::error::{BridgeError, QueueError};
use crate::virtqueue::{Buffer, DescFlags, DriverQueue, Gathered, Rejected, Virtqueue};

/// Driver-role bridge owning the transmit ring and its buffer pool
pub struct TransmitQueueBridge {
    queue: DriverQueue,
    pool: BufferPool,
    mem: GuestMemoryMmap,
}

impl TransmitQueueBridge {
    pub fn new(queue: DriverQueue, pool: BufferPool, mem: GuestMemoryMmap) -> Self {
        TransmitQueueBridge { queue, pool, mem }
    }

    pub fn queue(&self) -> &DriverQueue {
        &self.queue
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Copy `frame` into a pool buffer, publish it and ring the peer.
    ///
    /// Allocation failures drop the frame and leave no state behind. A buffer
    /// that could not be written or published is freed before returning.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), BridgeError> {
        let queue = self.queue.index();

        let buffer = match self.pool.allocate(frame.len()) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(queue, len = frame.len(), error = %e, "Dropping outbound frame");
                return Err(e.into());
            }
        };

        if let Err(e) = buffer.write(&self.mem, frame) {
            self.release(buffer)?;
            error!(queue, error = %e, "Failed to copy outbound frame");
            return Err(BridgeError::ring(queue, e));
        }

        match self
            .queue
            .add_available(&self.mem, vec![(buffer, DescFlags::NONE)])
        {
            Ok(head) => {
                trace!(queue, head, len = frame.len(), "Queued outbound frame");
                self.queue.notify();
                Ok(())
            }
            Err(Rejected { buffers, error }) => {
                for buffer in buffers {
                    self.release(buffer)?;
                }
                error!(queue, error = %error, "Failed to publish outbound frame");
                Err(BridgeError::ring(queue, error))
            }
        }
    }

    /// Free every buffer of every chain the peer has returned.
    ///
    /// Returns the number of buffers freed. A used entry that cannot be
    /// dequeued is logged and skipped; the next notification retries.
    pub fn reclaim(&mut self) -> Result<usize, BridgeError> {
        let queue = self.queue.index();
        let mut freed = 0;

        loop {
            let mut handle = match self.queue.get_used_buf(&self.mem) {
                Ok(Some((handle, _len))) => handle,
                Ok(None) => break,
                Err(e @ QueueError::UnknownUsedId { .. }) => {
                    // Entry was consumed, keep draining
                    warn!(queue, error = %e, "Skipping bogus used entry");
                    continue;
                }
                Err(e) => {
                    warn!(queue, error = %e, "Failed to dequeue used entry");
                    break;
                }
            };

            loop {
                match self
                    .queue
                    .gather(&self.mem, &mut handle)
                    .map_err(|e| BridgeError::ring(queue, e))?
                {
                    Gathered::Segment(buffer, _) => {
                        self.release(buffer)?;
                        freed += 1;
                    }
                    Gathered::EndOfChain => break,
                }
            }

            self.queue
                .retire(handle)
                .map_err(|e| BridgeError::ring(queue, e))?;
        }

        if freed > 0 {
            debug!(queue, freed, available = self.pool.available(), "Reclaimed buffers");
        }
        Ok(freed)
    }

    /// Whether the used ring has unconsumed completions
    pub fn has_pending(&self) -> Result<bool, BridgeError> {
        self.queue
            .pending(&self.mem)
            .map_err(|e| BridgeError::ring(self.queue.index(), e))
    }

    fn release(&mut self, buffer: Buffer) -> Result<(), BridgeError> {
        self.pool.free(buffer).map_err(|source| {
            let queue = self.queue.index();
            error!(queue, error = %source, "Buffer release failed");
            BridgeError::Release { queue, source }
        })
    }
}

/// Shared handle to the transmit bridge
///
/// The device model and the dispatcher both reach the transmit ring from the
/// same thread. A send issued while the bridge is already borrowed (e.g. from
/// inside a reclaim pass) fails with [`BridgeError::TransmitBusy`].
///
/// Clones also share the device's halt latch. The first fatal error seen on
/// the transmit path sets it, as does the dispatcher on a fatal receive
/// error. Once set, `send` and `reclaim` fail with [`BridgeError::Halted`]
/// without touching the ring.
#[derive(Clone)]
pub struct TransmitHandle {
    bridge: Rc<RefCell<TransmitQueueBridge>>,
    halted: Rc<Cell<bool>>,
}

impl TransmitHandle {
    pub fn new(bridge: TransmitQueueBridge) -> Self {
        TransmitHandle {
            bridge: Rc::new(RefCell::new(bridge)),
            halted: Rc::new(Cell::new(false)),
        }
    }

    pub fn send(&self, frame: &[u8]) -> Result<(), BridgeError> {
        self.check_running()?;
        let result = self.borrow_mut()?.send(frame);
        self.latch(result)
    }

    pub fn reclaim(&self) -> Result<usize, BridgeError> {
        self.check_running()?;
        let result = self.borrow_mut()?.reclaim();
        self.latch(result)
    }

    pub fn has_pending(&self) -> Result<bool, BridgeError> {
        self.with_bridge(|bridge| bridge.has_pending())?
    }

    pub fn pool_stats(&self) -> Result<PoolStats, BridgeError> {
        self.with_bridge(|bridge| bridge.pool().stats())
    }

    pub fn pool_available(&self) -> Result<usize, BridgeError> {
        self.with_bridge(|bridge| bridge.pool().available())
    }

    /// Run `f` against the bridge, failing if it is mid-operation
    pub fn with_bridge<R>(
        &self,
        f: impl FnOnce(&TransmitQueueBridge) -> R,
    ) -> Result<R, BridgeError> {
        let bridge = self
            .bridge
            .try_borrow()
            .map_err(|_| BridgeError::TransmitBusy)?;
        Ok(f(&bridge))
    }

    /// Stop the transmit path for good
    pub fn halt(&self) {
        self.halted.set(true);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get()
    }

    fn check_running(&self) -> Result<(), BridgeError> {
        if self.halted.get() {
            return Err(BridgeError::Halted);
        }
        Ok(())
    }

    fn latch<R>(&self, result: Result<R, BridgeError>) -> Result<R, BridgeError> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.halted.replace(true) {
                error!(error = %e, "Fatal transmit error, halting device");
            }
        }
        result
    }

    fn borrow_mut(&self) -> Result<RefMut<'_, TransmitQueueBridge>, BridgeError> {
        self.bridge
            .try_borrow_mut()
            .map_err(|_| BridgeError::TransmitBusy)
    }
}
