//! Device bring-up: both queues, the transmit pool, the device model and
//! the dispatcher, wired in dependency order.

use std::io;

use thiserror::Error;
use tracing::info;
use vm_memory::{GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use crate::bridge::{ReceiveQueueBridge, TransmitHandle, TransmitQueueBridge};
use crate::buffer::BufferPool;
use crate::config::{BridgeConfig, ConfigError};
use crate::dispatch::{DispatchSummary, NotificationDispatcher};
use crate::error::{AllocError, BridgeError, QueueError};
use crate::facade::{NetCallbacks, VirtioNetFacade};
use crate::virtqueue::{DeviceQueue, DriverQueue, QueueEvents};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to set up queue {queue}: {source}")]
    Queue {
        queue: u16,
        #[source]
        source: QueueError,
    },

    #[error("Failed to create buffer pool: {0}")]
    Pool(#[from] AllocError),

    #[error("Failed to set up notification eventfd: {0}")]
    Events(#[from] io::Error),
}

/// Eventfd pairs of both queues
pub struct DeviceEvents {
    pub rx: QueueEvents,
    pub tx: QueueEvents,
}

impl DeviceEvents {
    pub fn new() -> io::Result<Self> {
        Ok(DeviceEvents {
            rx: QueueEvents::new()?,
            tx: QueueEvents::new()?,
        })
    }

    /// The pairs as seen by the peer
    pub fn peer(&self) -> io::Result<Self> {
        Ok(DeviceEvents {
            rx: self.rx.peer()?,
            tx: self.tx.peer()?,
        })
    }
}

/// A wired-up virtio-net data plane
pub struct VirtioNetDevice<F> {
    dispatcher: NotificationDispatcher<F>,
    /// Notification eventfd per queue, for the runtime to wait on
    sources: Vec<(u16, EventFd)>,
}

impl<F: VirtioNetFacade> VirtioNetDevice<F> {
    /// Build the device; `build_facade` receives the transmit capability.
    ///
    /// Any queue or pool setup failure aborts the whole bring-up.
    pub fn new(
        config: &BridgeConfig,
        mem: GuestMemoryMmap,
        events: DeviceEvents,
        build_facade: impl FnOnce(NetCallbacks) -> F,
    ) -> Result<Self, DeviceError> {
        config.validate()?;

        let sources = vec![
            (config.rx_queue_index, events.rx.notification().try_clone()?),
            (config.tx_queue_index, events.tx.notification().try_clone()?),
        ];

        let tx_queue = DriverQueue::new(config.tx_queue_index, config.tx_layout(), events.tx, &mem)
            .map_err(|source| DeviceError::Queue {
                queue: config.tx_queue_index,
                source,
            })?;
        let pool = BufferPool::new(
            GuestAddress(config.pool_base),
            config.chunk_size,
            config.chunk_count as u32,
        )?;
        let tx = TransmitHandle::new(TransmitQueueBridge::new(tx_queue, pool, mem.clone()));

        let facade = build_facade(NetCallbacks::new(tx.clone()));

        let rx_queue = DeviceQueue::new(config.rx_queue_index, config.rx_layout(), events.rx, &mem)
            .map_err(|source| DeviceError::Queue {
                queue: config.rx_queue_index,
                source,
            })?;
        let rx = ReceiveQueueBridge::new(rx_queue, mem, facade);

        info!(
            rx_queue = config.rx_queue_index,
            tx_queue = config.tx_queue_index,
            queue_size = config.queue_size,
            chunks = config.chunk_count,
            chunk_size = config.chunk_size,
            "virtio-net data plane ready"
        );

        Ok(VirtioNetDevice {
            dispatcher: NotificationDispatcher::new(rx, tx),
            sources,
        })
    }

    /// Handle a notification on either queue
    pub fn dispatch(&mut self) -> Result<DispatchSummary, BridgeError> {
        self.dispatcher.dispatch()
    }

    pub fn transmit(&self) -> &TransmitHandle {
        self.dispatcher.transmit()
    }

    pub fn facade(&self) -> &F {
        self.dispatcher.rx().facade()
    }

    pub fn facade_mut(&mut self) -> &mut F {
        self.dispatcher.rx_mut().facade_mut()
    }

    pub fn is_halted(&self) -> bool {
        self.dispatcher.is_halted()
    }

    /// Queue index and notification eventfd of each queue
    pub fn notification_sources(&self) -> &[(u16, EventFd)] {
        &self.sources
    }
}
