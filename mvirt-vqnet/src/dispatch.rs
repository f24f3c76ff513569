//! Notification dispatch for both queues
//!
//! Every invocation checks both pending flags (level-triggered), drains what
//! is currently pending and returns. After a fatal ring error the dispatcher
//! stays halted. The halt latch lives in the [`TransmitHandle`], so a fatal
//! error raised by a send outside dispatch stops it too.

use tracing::{debug, error};

use crate::bridge::{ReceiveQueueBridge, RxCycle, TransmitHandle};
use crate::error::BridgeError;
use crate::facade::VirtioNetFacade;
use crate::virtqueue::Virtqueue;

/// Work done by one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Receive chains retired
    pub rx_chains: usize,
    /// The receive flag was set but the ring turned out empty
    pub rx_stale: bool,
    /// Transmit buffers returned to the pool
    pub tx_reclaimed: usize,
}

impl DispatchSummary {
    pub fn is_idle(&self) -> bool {
        self.rx_chains == 0 && self.tx_reclaimed == 0
    }
}

pub struct NotificationDispatcher<F> {
    rx: ReceiveQueueBridge<F>,
    tx: TransmitHandle,
}

impl<F: VirtioNetFacade> NotificationDispatcher<F> {
    pub fn new(rx: ReceiveQueueBridge<F>, tx: TransmitHandle) -> Self {
        NotificationDispatcher { rx, tx }
    }

    pub fn rx(&self) -> &ReceiveQueueBridge<F> {
        &self.rx
    }

    pub fn rx_mut(&mut self) -> &mut ReceiveQueueBridge<F> {
        &mut self.rx
    }

    pub fn transmit(&self) -> &TransmitHandle {
        &self.tx
    }

    pub fn is_halted(&self) -> bool {
        self.tx.is_halted()
    }

    /// Handle one notification covering either or both queues
    pub fn dispatch(&mut self) -> Result<DispatchSummary, BridgeError> {
        if self.tx.is_halted() {
            return Err(BridgeError::Halted);
        }

        let result = self.drain();
        if let Err(e) = &result {
            if e.is_fatal() && !self.tx.is_halted() {
                error!(error = %e, "Fatal ring error, halting device");
                self.tx.halt();
            }
        }
        result
    }

    fn drain(&mut self) -> Result<DispatchSummary, BridgeError> {
        let mut summary = DispatchSummary::default();

        if self.rx.has_pending()? {
            // Bounded by the ring size so a peer that keeps posting cannot pin us
            let limit = self.rx.queue().layout().size as usize;
            while summary.rx_chains < limit {
                match self.rx.run_cycle()? {
                    RxCycle::Stale => {
                        summary.rx_stale = true;
                        break;
                    }
                    RxCycle::Retired { .. } => summary.rx_chains += 1,
                }
                if !self.rx.has_pending()? {
                    break;
                }
            }
        }

        if self.tx.has_pending()? {
            summary.tx_reclaimed = self.tx.reclaim()?;
        }

        if !summary.is_idle() {
            debug!(
                rx_chains = summary.rx_chains,
                tx_reclaimed = summary.tx_reclaimed,
                "Dispatched notification"
            );
        }
        Ok(summary)
    }
}
