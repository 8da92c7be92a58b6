//! Host controller contract consumed by class drivers
//!
//! A host controller owns the bus: it announces devices, opens them, hands
//! out descriptors and executes transfers. Drivers talk to it through
//! [`HostController`] only, so the same driver runs against libusb
//! ([`crate::rusb_host::RusbHost`]) and against the scripted `MockHost`.
//!
//! Transfers are asynchronous. A [`Transfer`] is moved into the controller on
//! submit and comes back through its completion sender once it finished,
//! which only ever happens from inside [`HostController::handle_events`].

use common::CompletionSender;
use protocol::{
    ConfigDescriptor, DeviceAddress, DeviceDescriptor, DeviceHandle, DeviceSpeed, TransferStatus,
};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::error::{HostError, Result};

/// Default timeout applied to freshly allocated transfers
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Client registration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Upper bound on events delivered per `handle_events` call
    pub max_num_event_msg: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_num_event_msg: 5,
        }
    }
}

/// Registration token returned by [`HostController::register_client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u32);

/// Device presence events delivered to a registered client
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientEvent {
    /// A device was enumerated at `address`
    NewDevice { address: DeviceAddress },
    /// The device at `address` was disconnected
    DeviceGone { address: DeviceAddress },
}

/// Information about an opened device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub speed: DeviceSpeed,
    pub address: DeviceAddress,
    /// bConfigurationValue of the active configuration
    pub configuration_value: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// A transfer owned either by the submitter or by the host controller
///
/// For control transfers the first eight bytes of `buffer` hold the setup
/// packet and `actual_num_bytes` counts them too.
pub struct Transfer {
    pub device: Option<DeviceHandle>,
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    /// Bytes to transfer, at most `buffer.len()`
    pub num_bytes: usize,
    pub actual_num_bytes: usize,
    pub status: TransferStatus,
    pub timeout: Duration,
    /// Opaque submitter tag carried through completion
    pub context: u64,
    pub callback: Option<CompletionSender<Transfer>>,
}

impl Transfer {
    /// Allocate a transfer with a zeroed buffer of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            device: None,
            endpoint: 0,
            buffer: vec![0; size],
            num_bytes: size,
            actual_num_bytes: 0,
            status: TransferStatus::Pending,
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            context: 0,
            callback: None,
        }
    }

    /// Capacity of the data buffer
    pub fn data_buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes actually transferred
    pub fn data(&self) -> &[u8] {
        let end = self.actual_num_bytes.min(self.buffer.len());
        &self.buffer[..end]
    }

    /// Record the outcome and hand the transfer back to its submitter
    ///
    /// Host controllers call this from inside their event pump.
    pub fn finish(mut self, status: TransferStatus, actual_num_bytes: usize) {
        self.status = status;
        self.actual_num_bytes = actual_num_bytes.min(self.buffer.len());
        match self.callback.clone() {
            Some(callback) => {
                if let Err(dropped) = callback.complete(self) {
                    warn!(
                        "Completion for endpoint {:#04x} could not be delivered",
                        dropped.endpoint
                    );
                }
            }
            None => warn!(
                "Transfer on endpoint {:#04x} finished without a callback",
                self.endpoint
            ),
        }
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("device", &self.device)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("buffer_len", &self.buffer.len())
            .field("num_bytes", &self.num_bytes)
            .field("actual_num_bytes", &self.actual_num_bytes)
            .field("status", &self.status)
            .field("timeout", &self.timeout)
            .field("context", &self.context)
            .finish()
    }
}

/// A submission the controller refused; the transfer is handed back
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SubmitError {
    pub error: HostError,
    pub transfer: Box<Transfer>,
}

impl SubmitError {
    pub fn new(error: HostError, transfer: Transfer) -> Self {
        Self {
            error,
            transfer: Box::new(transfer),
        }
    }
}

/// USB host controller as seen by a class driver
pub trait HostController {
    fn register_client(&mut self, config: &ClientConfig) -> Result<ClientHandle>;

    fn deregister_client(&mut self, client: ClientHandle) -> Result<()>;

    /// Pump the controller
    ///
    /// Delivers pending client events to `on_event` and fires completions of
    /// finished transfers. `None` waits until something happens.
    fn handle_events(
        &mut self,
        client: ClientHandle,
        timeout: Option<Duration>,
        on_event: &mut dyn FnMut(ClientEvent),
    ) -> Result<()>;

    fn device_open(&mut self, client: ClientHandle, address: DeviceAddress) -> Result<DeviceHandle>;

    fn device_close(&mut self, client: ClientHandle, device: DeviceHandle) -> Result<()>;

    fn device_info(&mut self, device: DeviceHandle) -> Result<DeviceInfo>;

    fn device_descriptor(&mut self, device: DeviceHandle) -> Result<DeviceDescriptor>;

    fn active_config_descriptor(&mut self, device: DeviceHandle) -> Result<ConfigDescriptor>;

    fn interface_claim(
        &mut self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
        alternate: u8,
    ) -> Result<()>;

    fn interface_release(
        &mut self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
    ) -> Result<()>;

    /// Stop an endpoint; further submissions to it are rejected
    fn endpoint_halt(&mut self, device: DeviceHandle, endpoint: u8) -> Result<()>;

    /// Cancel every transfer queued on a halted endpoint
    fn endpoint_flush(&mut self, device: DeviceHandle, endpoint: u8) -> Result<()>;

    fn transfer_alloc(&mut self, size: usize) -> Result<Transfer>;

    /// Submit a transfer to a non-control endpoint
    fn transfer_submit(&mut self, transfer: Transfer) -> std::result::Result<(), SubmitError>;

    /// Submit a control transfer on endpoint 0
    fn transfer_submit_control(
        &mut self,
        client: ClientHandle,
        transfer: Transfer,
    ) -> std::result::Result<(), SubmitError>;
}

/// Check the parts of a submission every controller rejects
pub(crate) fn validate_submission(transfer: &Transfer, control: bool) -> Result<DeviceHandle> {
    let device = transfer
        .device
        .ok_or_else(|| HostError::InvalidArgument("transfer has no device".to_string()))?;

    if transfer.num_bytes > transfer.buffer.len() {
        return Err(HostError::InvalidArgument(format!(
            "num_bytes {} exceeds buffer of {}",
            transfer.num_bytes,
            transfer.buffer.len()
        )));
    }
    if transfer.callback.is_none() {
        return Err(HostError::InvalidArgument(
            "transfer has no completion callback".to_string(),
        ));
    }

    if control {
        if transfer.endpoint & 0x7F != 0 {
            return Err(HostError::InvalidArgument(format!(
                "control transfer on endpoint {:#04x}",
                transfer.endpoint
            )));
        }
        if transfer.num_bytes < protocol::SETUP_PACKET_SIZE {
            return Err(HostError::InvalidArgument(
                "control transfer shorter than a setup packet".to_string(),
            ));
        }
    } else if transfer.endpoint & 0x7F == 0 {
        return Err(HostError::InvalidArgument(
            "endpoint 0 requires a control submission".to_string(),
        ));
    }

    Ok(device)
}
