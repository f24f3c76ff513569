//! Error types for the virtqueue bridge
//!
//! Errors fall into three classes: benign (stale notifications, frames the
//! device model refuses), resource exhaustion (allocation failures) and ring
//! protocol errors. Only the last class is fatal; see [`BridgeError::is_fatal`].

use thiserror::Error;
use vm_memory::GuestMemoryError;

/// Buffer pool allocation errors
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("Buffer pool exhausted ({capacity} chunks in use)")]
    Exhausted { capacity: usize },

    #[error("Requested {requested} bytes exceeds chunk size {chunk_size}")]
    TooLarge { requested: usize, chunk_size: u32 },

    #[error("Zero-length buffer requested")]
    Empty,

    #[error("Invalid pool geometry: {chunk_count} chunks of {chunk_size} bytes")]
    InvalidPool { chunk_size: u32, chunk_count: u32 },
}

/// Errors returning a buffer to its pool
#[derive(Debug, Error)]
pub enum FreeError {
    #[error("Buffer at {0:#x} does not belong to this pool")]
    NotFromPool(u64),

    #[error("Buffer at {0:#x} is not allocated")]
    NotAllocated(u64),
}

/// Split ring protocol errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Guest memory access failed: {0}")]
    Memory(#[from] GuestMemoryError),

    #[error("Virtqueue error: {0}")]
    Virtio(#[from] virtio_queue::Error),

    #[error("Queue {queue}: invalid ring layout")]
    InvalidLayout { queue: u16 },

    #[error("Queue {queue}: need {needed} descriptors, only {free} free")]
    RingFull { queue: u16, needed: usize, free: u16 },

    #[error("Queue {queue}: empty descriptor chain")]
    EmptyChain { queue: u16 },

    #[error("Queue {queue}: descriptor index {index} out of range")]
    DescriptorIndex { queue: u16, index: u16 },

    #[error("Queue {queue}: descriptor chain at head {head} is longer than the ring")]
    ChainLoop { queue: u16, head: u16 },

    #[error("Queue {queue}: indirect descriptor {index} not supported")]
    IndirectUnsupported { queue: u16, index: u16 },

    #[error("Queue {queue}: used id {id} does not name an outstanding chain")]
    UnknownUsedId { queue: u16, id: u32 },

    #[error("Queue {queue}: chain head {head} is already outstanding")]
    DuplicateHead { queue: u16, head: u16 },

    #[error("Handle for queue {found} presented to queue {expected}")]
    ForeignHandle { expected: u16, found: u16 },

    #[error("Frame of {len} bytes does not fit buffer of {capacity} bytes")]
    Overflow { len: usize, capacity: u32 },

    #[error("Segment of {len} bytes exceeds the {max} byte limit")]
    SegmentTooLong { len: u32, max: u32 },

    #[error("Segment at {addr:#x} of {len} bytes is outside guest memory")]
    SegmentOutOfRange { addr: u64, len: u32 },
}

/// Errors surfaced by the bridges and the dispatcher
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("Queue {queue} ring error: {source}")]
    Ring {
        queue: u16,
        #[source]
        source: QueueError,
    },

    #[error("Queue {queue}: failed to release buffer: {source}")]
    Release {
        queue: u16,
        #[source]
        source: FreeError,
    },

    #[error("Transmit path is busy")]
    TransmitBusy,

    #[error("Device halted after a fatal ring error")]
    Halted,
}

impl BridgeError {
    pub fn ring(queue: u16, source: QueueError) -> Self {
        BridgeError::Ring { queue, source }
    }

    /// Whether the error leaves the ring in an indeterminate state.
    ///
    /// Allocation failures and a busy transmit path only cost the caller a
    /// frame. Ring and release errors mean the producer/consumer contract is
    /// broken and the device must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Ring { .. } | BridgeError::Release { .. } | BridgeError::Halted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!BridgeError::Alloc(AllocError::Empty).is_fatal());
        assert!(!BridgeError::TransmitBusy.is_fatal());
        assert!(BridgeError::Halted.is_fatal());
        assert!(
            BridgeError::ring(1, QueueError::EmptyChain { queue: 1 }).is_fatal(),
            "ring errors halt the device"
        );
        assert!(
            BridgeError::Release {
                queue: 1,
                source: FreeError::NotAllocated(0x1000),
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_error_messages() {
        let err = BridgeError::from(AllocError::TooLarge {
            requested: 4096,
            chunk_size: 2048,
        });
        assert_eq!(
            err.to_string(),
            "Allocation failed: Requested 4096 bytes exceeds chunk size 2048"
        );

        let err = QueueError::ForeignHandle {
            expected: 0,
            found: 1,
        };
        assert_eq!(err.to_string(), "Handle for queue 1 presented to queue 0");
    }
}
