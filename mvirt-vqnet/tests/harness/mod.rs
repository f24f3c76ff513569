//! Test harness for data plane integration tests
//!
//! Provides a simulated guest driving the other end of both rings.

#![allow(dead_code)]

pub mod guest;

pub use guest::TestGuest;

use mvirt_vqnet::test_util::{RecordingFacade, create_guest_memory};
use mvirt_vqnet::{BridgeConfig, DeviceEvents, VirtioNetDevice};

/// Ring size used by the integration tests
pub const QUEUE_SIZE: u16 = 64;

/// Guest-side receive buffers live above the device's regions
pub const GUEST_POOL_BASE: u64 = 0x10_0000;
pub const GUEST_CHUNK_SIZE: u32 = 2048;
pub const GUEST_CHUNKS: u32 = 64;

/// Device config with `chunk_count` transmit buffers
pub fn config(chunk_count: u16) -> BridgeConfig {
    BridgeConfig {
        memory_size: 0x20_0000,
        queue_size: QUEUE_SIZE,
        chunk_count,
        ..BridgeConfig::default()
    }
}

/// A device plus the guest on the other side of its rings
pub struct TestRig {
    pub device: VirtioNetDevice<RecordingFacade>,
    pub guest: TestGuest,
}

impl TestRig {
    pub fn new(config: &BridgeConfig) -> Self {
        let mem = create_guest_memory(config.memory_size as usize);
        let events = DeviceEvents::new().expect("events");
        let peer = events.peer().expect("peer events");

        let device = VirtioNetDevice::new(config, mem.clone(), events, RecordingFacade::new)
            .expect("Failed to create device");
        let guest = TestGuest::new(config, mem, peer);

        TestRig { device, guest }
    }

    pub fn delivered(&self) -> &[Vec<u8>] {
        &self.device.facade().delivered
    }
}
