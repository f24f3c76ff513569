//! Boundary to the packet-level virtio-net device model
//!
//! The device model is external: the bridge only hands it inbound frames and
//! gives it a [`NetCallbacks`] record through which it emits frames.

use thiserror::Error;
use tracing::{trace, warn};

use crate::bridge::TransmitHandle;
use crate::error::BridgeError;

/// Errors reported by the device model
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("Device model rejected frame with status {0}")]
    Status(i32),

    #[error("Relay failed: {0}")]
    Transmit(#[from] BridgeError),
}

/// Packet-level device model as seen from the bridge
pub trait VirtioNetFacade {
    /// Hand one gathered receive segment to the device model.
    ///
    /// An error is logged by the caller; the segment is retired regardless.
    /// A fatal [`FacadeError::Transmit`] also halts the device.
    fn deliver_inbound(&mut self, frame: &[u8]) -> Result<(), FacadeError>;
}

/// Capabilities handed to the device model at construction
pub struct NetCallbacks {
    /// Entry point for frames the device model emits
    pub tx: TransmitHandle,
    /// Optional interrupt-injection hook
    pub inject_interrupt: Option<Box<dyn FnMut()>>,
}

impl NetCallbacks {
    pub fn new(tx: TransmitHandle) -> Self {
        NetCallbacks {
            tx,
            inject_interrupt: None,
        }
    }

    pub fn with_interrupt(mut self, hook: impl FnMut() + 'static) -> Self {
        self.inject_interrupt = Some(Box::new(hook));
        self
    }

    /// Push a frame toward the transmit ring
    pub fn send(&self, frame: &[u8]) -> Result<(), BridgeError> {
        self.tx.send(frame)
    }

    /// Fire the interrupt hook if one was supplied
    pub fn raise_interrupt(&mut self) {
        if let Some(hook) = self.inject_interrupt.as_mut() {
            hook();
        }
    }
}

/// Device model that relays every inbound frame straight back out
pub struct LoopbackFacade {
    callbacks: NetCallbacks,
    relayed: u64,
    dropped: u64,
}

impl LoopbackFacade {
    pub fn new(callbacks: NetCallbacks) -> Self {
        LoopbackFacade {
            callbacks,
            relayed: 0,
            dropped: 0,
        }
    }

    /// Frames relayed to the transmit ring
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Frames dropped because the transmit path refused them
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl VirtioNetFacade for LoopbackFacade {
    fn deliver_inbound(&mut self, frame: &[u8]) -> Result<(), FacadeError> {
        match self.callbacks.send(frame) {
            Ok(()) => {
                self.relayed += 1;
                self.callbacks.raise_interrupt();
                trace!(len = frame.len(), "Relayed frame");
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                self.dropped += 1;
                warn!(len = frame.len(), error = %e, "Dropping relayed frame");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
