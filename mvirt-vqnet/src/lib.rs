pub mod bridge;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod facade;
pub mod test_util;
pub mod virtqueue;

pub use bridge::{ReceiveQueueBridge, RxCycle, RxState, TransmitHandle, TransmitQueueBridge};
pub use buffer::{BufferPool, PoolStats};
pub use config::{BridgeConfig, ConfigError};
pub use device::{DeviceEvents, VirtioNetDevice};
pub use dispatch::{DispatchSummary, NotificationDispatcher};
pub use error::{AllocError, BridgeError, FreeError, QueueError};
pub use event_loop::EventLoop;
pub use facade::{FacadeError, LoopbackFacade, NetCallbacks, VirtioNetFacade};
