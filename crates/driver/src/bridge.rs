//! Blocking transfers over the asynchronous host controller
//!
//! The host controller completes transfers through a callback that fires
//! inside its event pump. [`TransferBridge`] turns that into a bounded wait:
//! the driver submits, pumps the host once and then waits on a single-slot
//! rendezvous for the transfer to come back.
//!
//! Every submission is tagged. A completion whose tag does not match the
//! outstanding one (a transfer that timed out earlier and finished late) is
//! dropped instead of being mistaken for the current result.

use common::{CompletionReceiver, CompletionSender, WaitError, completion_slot};
use host::{SubmitError, Transfer};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Why a transfer attempt produced no completed transfer
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Previous transfer still in flight")]
    Busy,

    #[error("No completion within {0:?}")]
    Timeout(Duration),

    #[error("Submission rejected: {0}")]
    Submit(#[source] SubmitError),

    #[error("Completion channel disconnected")]
    Disconnected,
}

/// Outcome of one submit/pump/wait round
pub type TransferAttempt = std::result::Result<Transfer, TransferError>;

/// Single-slot completion rendezvous plus in-flight bookkeeping
#[derive(Debug)]
pub struct TransferBridge {
    tx: CompletionSender<Transfer>,
    rx: CompletionReceiver<Transfer>,
    in_flight: Option<u64>,
    next_tag: u64,
    acquire_timeout: Duration,
    pump_timeout: Duration,
}

impl TransferBridge {
    pub fn new(acquire_timeout: Duration, pump_timeout: Duration) -> Self {
        let (tx, rx) = completion_slot();
        Self {
            tx,
            rx,
            in_flight: None,
            next_tag: 0,
            acquire_timeout,
            pump_timeout,
        }
    }

    pub fn pump_timeout(&self) -> Duration {
        self.pump_timeout
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Make sure no earlier transfer is outstanding
    ///
    /// Waits at most the acquire timeout for a straggler; whatever arrives
    /// is stale and dropped.
    pub fn acquire(&mut self) -> Result<(), TransferError> {
        let Some(tag) = self.in_flight else {
            return Ok(());
        };

        match self.rx.wait(self.acquire_timeout) {
            Ok(stale) => {
                debug!(
                    "Collected late completion (tag {}, status {:?})",
                    stale.context, stale.status
                );
                self.in_flight = None;
                Ok(())
            }
            Err(WaitError::Timeout) => {
                debug!("Transfer {} still in flight", tag);
                Err(TransferError::Busy)
            }
            Err(WaitError::Disconnected) => Err(TransferError::Disconnected),
        }
    }

    /// Tag `transfer` and route its completion here
    pub fn begin(&mut self, transfer: &mut Transfer) {
        self.next_tag += 1;
        transfer.context = self.next_tag;
        transfer.callback = Some(self.tx.clone());
        self.in_flight = Some(self.next_tag);
    }

    /// The controller refused the transfer begun last
    pub fn rejected(&mut self) {
        self.in_flight = None;
    }

    /// Wait at most `timeout` for the outstanding transfer
    ///
    /// On timeout the transfer stays in flight and is collected by the next
    /// [`acquire`](Self::acquire).
    pub fn wait(&mut self, timeout: Duration) -> TransferAttempt {
        let Some(tag) = self.in_flight else {
            return Err(TransferError::Timeout(Duration::ZERO));
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.wait(remaining) {
                Ok(transfer) if transfer.context == tag => {
                    self.in_flight = None;
                    return Ok(transfer);
                }
                Ok(stale) => {
                    debug!("Dropping stale completion (tag {})", stale.context);
                }
                Err(WaitError::Timeout) => return Err(TransferError::Timeout(timeout)),
                Err(WaitError::Disconnected) => return Err(TransferError::Disconnected),
            }
        }
    }

    /// Forget the outstanding transfer and drop anything already delivered
    pub fn reset(&mut self) {
        while self.rx.try_take().is_some() {}
        self.in_flight = None;
    }
}
