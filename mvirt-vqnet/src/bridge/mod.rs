//! Frame movement between the rings and the device model
//!
//! - [`ReceiveQueueBridge`] drives the device-role ring: the peer posts
//!   chains, each segment is handed to the device model, the chain goes back
//!   on the used ring.
//! - [`TransmitQueueBridge`] drives the driver-role ring: frames from the
//!   device model are copied into pool buffers and published, and used
//!   chains are reclaimed into the pool.

mod rx;
mod tx;

pub use rx::{ReceiveQueueBridge, RxCycle, RxState};
pub use tx::{TransmitHandle, TransmitQueueBridge};
