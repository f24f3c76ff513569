//! Device geometry: queue indices, ring placement and transmit pool
//!
//! Loaded from JSON; missing fields fall back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_memory::GuestAddress;

use crate::virtqueue::{MAX_QUEUE_SIZE, MAX_SEGMENT_LEN, RingLayout};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Queue size {0} must be a power of two no greater than 32768")]
    QueueSize(u16),

    #[error("Chunk size {0} must be between 1 and 65536")]
    ChunkSize(u32),

    #[error("Chunk count {count} must be between 1 and the queue size {queue_size}")]
    ChunkCount { count: u16, queue_size: u16 },

    #[error("Receive and transmit queues both use index {0}")]
    SameQueueIndex(u16),

    #[error("{region} at {addr:#x} is not 16-byte aligned")]
    Misaligned { region: &'static str, addr: u64 },

    #[error("{region} [{start:#x}, {end:#x}) lies outside guest memory of {memory_size:#x} bytes")]
    OutOfMemory {
        region: &'static str,
        start: u64,
        end: u64,
        memory_size: u64,
    },

    #[error("{first} overlaps {second}")]
    Overlap {
        first: &'static str,
        second: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Size of the shared memory region in bytes
    pub memory_size: u64,
    /// Descriptors per ring, applies to both queues
    pub queue_size: u16,
    pub rx_queue_index: u16,
    pub tx_queue_index: u16,
    /// Start of the receive ring
    pub rx_ring_base: u64,
    /// Start of the transmit ring
    pub tx_ring_base: u64,
    /// Start of the transmit buffer pool
    pub pool_base: u64,
    /// Largest frame a single transmit buffer holds
    pub chunk_size: u32,
    /// Number of transmit buffers
    pub chunk_count: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            memory_size: 0x20_0000,
            queue_size: 256,
            rx_queue_index: 0,
            tx_queue_index: 1,
            rx_ring_base: 0x0,
            tx_ring_base: 0x8000,
            pool_base: 0x1_0000,
            chunk_size: 2048,
            chunk_count: 256,
        }
    }
}

impl BridgeConfig {
    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn rx_layout(&self) -> RingLayout {
        RingLayout::new(GuestAddress(self.rx_ring_base), self.queue_size)
    }

    pub fn tx_layout(&self) -> RingLayout {
        RingLayout::new(GuestAddress(self.tx_ring_base), self.queue_size)
    }

    /// Byte range of the transmit pool
    pub fn pool_range(&self) -> (u64, u64) {
        let len = self.chunk_size as u64 * self.chunk_count as u64;
        (self.pool_base, self.pool_base + len)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.queue_size.is_power_of_two() || self.queue_size > MAX_QUEUE_SIZE {
            return Err(ConfigError::QueueSize(self.queue_size));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_SEGMENT_LEN {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        // One descriptor per buffer, so a full pool always fits on the ring
        if self.chunk_count == 0 || self.chunk_count > self.queue_size {
            return Err(ConfigError::ChunkCount {
                count: self.chunk_count,
                queue_size: self.queue_size,
            });
        }
        if self.rx_queue_index == self.tx_queue_index {
            return Err(ConfigError::SameQueueIndex(self.rx_queue_index));
        }

        let regions = [
            ("Receive ring", self.ring_range(self.rx_ring_base)),
            ("Transmit ring", self.ring_range(self.tx_ring_base)),
            ("Buffer pool", self.pool_range()),
        ];

        for (region, (start, end)) in regions {
            if start % 16 != 0 {
                return Err(ConfigError::Misaligned {
                    region,
                    addr: start,
                });
            }
            if end > self.memory_size {
                return Err(ConfigError::OutOfMemory {
                    region,
                    start,
                    end,
                    memory_size: self.memory_size,
                });
            }
        }

        for (i, (first, (a_start, a_end))) in regions.iter().enumerate() {
            for (second, (b_start, b_end)) in &regions[i + 1..] {
                if a_start < b_end && b_start < a_end {
                    return Err(ConfigError::Overlap {
                        first: *first,
                        second: *second,
                    });
                }
            }
        }

        Ok(())
    }

    fn ring_range(&self, base: u64) -> (u64, u64) {
        (base, base + RingLayout::total_size(self.queue_size))
    }
}
