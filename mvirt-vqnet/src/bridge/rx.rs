//! Receive path: hand peer-posted chains to the device model
//!
//! One cycle walks `Idle -> Dequeued -> Delivered -> Retired -> Idle`. A
//! dequeued chain always goes back on the used ring, even when the walk
//! fails part-way, so the peer never loses a buffer.

use tracing::{debug, error, trace, warn};
use vm_memory::GuestMemoryMmap;

use crate::error::BridgeError;
use crate::facade::{FacadeError, VirtioNetFacade};
use crate::virtqueue::{DeviceQueue, Gathered, RingHandle, Virtqueue};

/// Position of the receive bridge in its per-chain cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    /// A chain has been taken off the available ring
    Dequeued,
    /// Every segment was offered to the device model
    Delivered,
    /// The chain is back on the used ring
    Retired,
}

/// Outcome of one receive cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxCycle {
    /// The available ring was empty; the notification was stale
    Stale,
    /// One chain was processed and returned
    Retired {
        /// Segments gathered from the chain
        segments: usize,
        /// Segments the device model refused
        rejected: usize,
    },
}

/// Device-role bridge for the receive ring
pub struct ReceiveQueueBridge<F> {
    queue: DeviceQueue,
    mem: GuestMemoryMmap,
    facade: F,
    state: RxState,
    /// Copy of the current segment
    scratch: Vec<u8>,
}

impl<F: VirtioNetFacade> ReceiveQueueBridge<F> {
    pub fn new(queue: DeviceQueue, mem: GuestMemoryMmap, facade: F) -> Self {
        ReceiveQueueBridge {
            queue,
            mem,
            facade,
            state: RxState::Idle,
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn queue(&self) -> &DeviceQueue {
        &self.queue
    }

    pub fn facade(&self) -> &F {
        &self.facade
    }

    pub fn facade_mut(&mut self) -> &mut F {
        &mut self.facade
    }

    /// Whether the available ring has unconsumed chains
    pub fn has_pending(&self) -> Result<bool, BridgeError> {
        self.queue
            .pending(&self.mem)
            .map_err(|e| BridgeError::ring(self.queue.index(), e))
    }

    /// Process at most one chain from the available ring
    pub fn run_cycle(&mut self) -> Result<RxCycle, BridgeError> {
        let queue = self.queue.index();

        let mut handle = match self.queue.get_available_buf(&self.mem) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                debug!(queue, "Stale receive notification");
                return Ok(RxCycle::Stale);
            }
            Err(e) => {
                error!(queue, error = %e, "Failed to dequeue receive chain");
                return Err(BridgeError::ring(queue, e));
            }
        };
        self.state = RxState::Dequeued;
        let head = handle.head();

        let delivery = self.deliver_chain(&mut handle);
        if delivery.is_ok() {
            self.state = RxState::Delivered;
        }

        // Nothing is written back beyond what the device model stored
        if let Err(e) = self.queue.add_used_buf(&self.mem, handle, 0) {
            error!(queue, head, error = %e, "Failed to return receive chain");
            return Err(BridgeError::ring(queue, e));
        }
        self.state = RxState::Retired;

        self.queue.notify();
        self.state = RxState::Idle;

        let (segments, rejected) = delivery.inspect_err(|e| {
            error!(queue, head, error = %e, "Receive chain failed");
        })?;

        trace!(queue, head, segments, rejected, "Retired receive chain");
        Ok(RxCycle::Retired { segments, rejected })
    }

    /// Offer every segment of the chain to the device model.
    ///
    /// Stops at the first walk error, or when the device model's relay hits a
    /// fatal transmit error. Any other refusal only counts as a rejection.
    fn deliver_chain(&mut self, handle: &mut RingHandle) -> Result<(usize, usize), BridgeError> {
        let queue = self.queue.index();
        let mut segments = 0;
        let mut rejected = 0;

        loop {
            let buffer = match self.queue.gather(&self.mem, handle) {
                Ok(Gathered::Segment(buffer, _)) => buffer,
                Ok(Gathered::EndOfChain) => break,
                Err(e) => return Err(BridgeError::ring(queue, e)),
            };
            buffer
                .read(&self.mem, &mut self.scratch)
                .map_err(|e| BridgeError::ring(queue, e))?;
            segments += 1;

            match self.facade.deliver_inbound(&self.scratch) {
                Ok(()) => {}
                Err(FacadeError::Transmit(e)) if e.is_fatal() => return Err(e),
                Err(e) => {
                    rejected += 1;
                    warn!(
                        queue,
                        head = handle.head(),
                        len = buffer.len(),
                        error = %e,
                        "Device model rejected inbound frame"
                    );
                }
            }
        }

        Ok((segments, rejected))
    }
}
