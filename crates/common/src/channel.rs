//! Channels between the USB threads and the rest of the application
//!
//! Three kinds of plumbing live here:
//! - [`ReadySignal`]: the start/exit handshake between the host daemon, the
//!   class driver and whoever spawned them.
//! - [`completion_slot`]: a single-slot rendezvous that carries a finished
//!   transfer from the host controller's completion callback back to the
//!   driver step that is waiting for it.
//! - [`create_event_bridge`]: driver events (device opened, report
//!   descriptor, input reports) flowing from the blocking driver thread to
//!   the Tokio runtime.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use protocol::{DeviceAddress, DeviceSpeed, ReportDescriptorKind};
use std::time::Duration;
use tracing::warn;

/// Counting signal shared by cooperating tasks
///
/// Every `give` deposits one token; every `take` consumes one, blocking
/// until a token is available.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Deposit one token
    pub fn give(&self) {
        // Both ends live in self, so the channel cannot be disconnected
        let _ = self.tx.send(());
    }

    /// Block until a token is available
    pub fn take(&self) {
        let _ = self.rx.recv();
    }

    /// Wait at most `timeout` for a token
    pub fn take_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a completion wait returned without a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Nothing completed within the timeout
    Timeout,
    /// Every sender was dropped
    Disconnected,
}

/// Completion side of the rendezvous, handed to the host controller
///
/// Called from inside the controller's event pump, so it never blocks: if
/// the slot is already occupied the value is handed back to the caller.
#[derive(Debug)]
pub struct CompletionSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for CompletionSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> CompletionSender<T> {
    pub fn complete(&self, value: T) -> Result<(), T> {
        match self.tx.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(value)) => {
                warn!("Completion slot occupied, previous completion not yet collected");
                Err(value)
            }
            Err(TrySendError::Disconnected(value)) => Err(value),
        }
    }
}

/// Waiting side of the rendezvous, owned by the driver
#[derive(Debug)]
pub struct CompletionReceiver<T> {
    rx: Receiver<T>,
}

impl<T> CompletionReceiver<T> {
    /// Wait at most `timeout` for the next completion
    pub fn wait(&self, timeout: Duration) -> Result<T, WaitError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => WaitError::Timeout,
            RecvTimeoutError::Disconnected => WaitError::Disconnected,
        })
    }

    /// Collect a completion that already arrived, if any
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Create the single-slot completion rendezvous
pub fn completion_slot<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = bounded(1);
    (CompletionSender { tx }, CompletionReceiver { rx })
}

/// Events published by the class driver
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Device enumerated and its descriptors read
    DeviceOpened {
        address: DeviceAddress,
        vendor_id: u16,
        product_id: u16,
        speed: DeviceSpeed,
        manufacturer: Option<String>,
        product: Option<String>,
        serial_number: Option<String>,
    },

    /// A HID interface was claimed
    InterfaceClaimed {
        interface: u8,
        endpoint_in: Option<u8>,
        endpoint_out: Option<u8>,
    },

    /// HID report descriptor fetched over the control endpoint
    ReportDescriptor {
        interface: u8,
        descriptor: Vec<u8>,
        kind: ReportDescriptorKind,
    },

    /// Input report read from the interrupt IN endpoint
    InputReport { endpoint: u8, data: Vec<u8> },

    /// Device released and closed
    DeviceClosed { address: DeviceAddress },
}

/// Publishing end, owned by the driver thread (never blocks)
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: async_channel::Sender<DriverEvent>,
}

impl EventPublisher {
    /// Publish an event, dropping it if the consumer has fallen behind
    pub fn publish(&self, event: DriverEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(event)) => {
                warn!("Driver event channel full, dropping {:?}", event);
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                // Nobody listening any more
            }
        }
    }
}

/// Consuming end, for the Tokio runtime
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    rx: async_channel::Receiver<DriverEvent>,
}

impl EventSubscriber {
    /// Receive the next driver event
    pub async fn recv(&self) -> crate::Result<DriverEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive without blocking
    pub fn try_recv(&self) -> Option<DriverEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create the driver event bridge
///
/// Returns (EventPublisher for the driver thread, EventSubscriber for Tokio)
pub fn create_event_bridge(capacity: usize) -> (EventPublisher, EventSubscriber) {
    let (tx, rx) = async_channel::bounded(capacity);
    (EventPublisher { tx }, EventSubscriber { rx })
}
