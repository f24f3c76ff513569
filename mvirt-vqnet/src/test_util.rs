//! Test utilities shared by unit and integration tests
//!
//! Provides anonymous guest memory and a device model that records what the
//! receive path hands to it.

use vm_memory::{GuestAddress, GuestMemoryMmap, GuestRegionMmap, MmapRegion};

use crate::facade::{FacadeError, NetCallbacks, VirtioNetFacade};

/// Create anonymous guest memory of `size` bytes starting at address 0
pub fn create_guest_memory(size: usize) -> GuestMemoryMmap {
    let mmap_region = MmapRegion::new(size).expect("mmap region");
    let region = GuestRegionMmap::new(mmap_region, GuestAddress(0)).expect("guest region");
    GuestMemoryMmap::from_regions(vec![region]).expect("mmap")
}

/// Device model that records every inbound frame
pub struct RecordingFacade {
    callbacks: NetCallbacks,
    /// Frames delivered so far, in order
    pub delivered: Vec<Vec<u8>>,
    /// Reject this many upcoming deliveries with a non-zero status
    pub reject_next: usize,
    /// Relay every accepted frame back out through the transmit path
    pub relay: bool,
}

impl RecordingFacade {
    pub fn new(callbacks: NetCallbacks) -> Self {
        RecordingFacade {
            callbacks,
            delivered: Vec::new(),
            reject_next: 0,
            relay: false,
        }
    }
}

impl VirtioNetFacade for RecordingFacade {
    fn deliver_inbound(&mut self, frame: &[u8]) -> Result<(), FacadeError> {
        if self.reject_next > 0 {
            self.reject_next -= 1;
            return Err(FacadeError::Status(-1));
        }
        self.delivered.push(frame.to_vec());
        if self.relay {
            self.callbacks.send(frame)?;
        }
        Ok(())
    }
}
