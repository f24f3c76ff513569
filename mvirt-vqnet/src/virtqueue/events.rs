//! Doorbell and notification eventfds of a queue

use std::io;

use tracing::warn;
use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

/// The two eventfds attached to one queue
///
/// `doorbell` is written by us to tell the peer the ring changed.
/// `notification` is written by the peer and is what the runtime waits on.
pub struct QueueEvents {
    doorbell: EventFd,
    notification: EventFd,
}

impl QueueEvents {
    /// Create a fresh non-blocking pair
    pub fn new() -> io::Result<Self> {
        Ok(QueueEvents {
            doorbell: EventFd::new(EFD_NONBLOCK)?,
            notification: EventFd::new(EFD_NONBLOCK)?,
        })
    }

    /// The same pair as seen from the other end of the ring
    pub fn peer(&self) -> io::Result<Self> {
        Ok(QueueEvents {
            doorbell: self.notification.try_clone()?,
            notification: self.doorbell.try_clone()?,
        })
    }

    pub fn notification(&self) -> &EventFd {
        &self.notification
    }

    /// Signal the peer.
    ///
    /// Treated as infallible: an eventfd write only fails when the counter
    /// would overflow, in which case the peer has a notification pending anyway.
    pub fn ring(&self) {
        if let Err(e) = self.doorbell.write(1) {
            warn!(error = %e, "Doorbell write failed");
        }
    }

    /// Consume pending notifications without blocking, returning the count
    pub fn drain(&self) -> u64 {
        match self.notification.read() {
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!(error = %e, "Notification read failed");
                0
            }
        }
    }
}
