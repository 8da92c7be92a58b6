//! Scripted in-memory host controller
//!
//! [`MockHost`] plays the bus for driver tests. Devices are attached and
//! detached by the test, transfer outcomes are scripted per endpoint kind,
//! one-shot failures can be injected per operation, and every call is
//! recorded so tests can assert on ordering.
//!
//! Like the real backend, completions only fire inside `handle_events`.

use common::test_utils::{
    create_mock_device_descriptor, gamepad_report_descriptor, hid_keyboard_config,
};
use protocol::{
    ConfigDescriptor, DeviceAddress, DeviceDescriptor, DeviceHandle, DeviceSpeed,
    SETUP_PACKET_SIZE, SetupPacket, TransferStatus,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::controller::{
    ClientConfig, ClientEvent, ClientHandle, DeviceInfo, HostController, SubmitError, Transfer,
    validate_submission,
};
use crate::error::{HostError, Result};

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Register,
    HandleEvents,
    Open,
    Close,
    DeviceInfo,
    DeviceDescriptor,
    ConfigDescriptor,
    Claim(u8),
    Release(u8),
    Halt(u8),
    Flush(u8),
    Submit,
    SubmitControl,
}

/// Recorded controller call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    RegisterClient,
    DeregisterClient,
    HandleEvents(Option<Duration>),
    Open(DeviceAddress),
    Close(DeviceHandle),
    DeviceInfo,
    DeviceDescriptor,
    ConfigDescriptor,
    Claim { interface: u8, alternate: u8 },
    Release(u8),
    Halt(u8),
    Flush(u8),
    Alloc(usize),
    Submit { endpoint: u8, num_bytes: usize },
    SubmitControl(SetupPacket),
}

/// Scripted outcome of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCompletion {
    /// Complete successfully with this data stage
    Data(Vec<u8>),
    /// Complete with a non-success status and no data
    Status(TransferStatus),
    /// Keep the transfer in flight until flushed
    Hold,
}

/// A device that can be attached to the mock bus
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub descriptor: DeviceDescriptor,
    /// Raw configuration descriptor
    pub config: Vec<u8>,
    pub info: DeviceInfo,
    /// Served for report descriptor requests without a scripted outcome
    pub report_descriptor: Vec<u8>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16, config: Vec<u8>) -> Self {
        Self {
            descriptor: create_mock_device_descriptor(vendor_id, product_id, 64),
            config,
            info: DeviceInfo {
                speed: DeviceSpeed::Full,
                address: DeviceAddress(0),
                configuration_value: 1,
                manufacturer: Some("Mock Manufacturer".to_string()),
                product: Some("Mock Gamepad".to_string()),
                serial_number: Some("0001".to_string()),
            },
            report_descriptor: gamepad_report_descriptor(),
        }
    }

    /// One HID interface with an 8-byte interrupt IN endpoint at 0x81
    pub fn hid_keyboard() -> Self {
        Self::new(0x1234, 0x5678, hid_keyboard_config())
    }

    pub fn with_max_packet_size0(mut self, max_packet_size0: u8) -> Self {
        self.descriptor.max_packet_size0 = max_packet_size0;
        self
    }

    pub fn with_report_descriptor(mut self, report_descriptor: Vec<u8>) -> Self {
        self.report_descriptor = report_descriptor;
        self
    }
}

#[derive(Debug)]
struct OpenState {
    address: DeviceAddress,
    device: MockDevice,
    claimed: HashSet<u8>,
    halted: HashSet<u8>,
}

/// Scripted [`HostController`]
#[derive(Debug)]
pub struct MockHost {
    client: Option<ClientHandle>,
    max_events: usize,
    devices: HashMap<DeviceAddress, MockDevice>,
    open: HashMap<DeviceHandle, OpenState>,
    next_handle: u32,
    events: VecDeque<ClientEvent>,
    queue: VecDeque<Transfer>,
    held: Vec<Transfer>,
    control_script: VecDeque<MockCompletion>,
    interrupt_script: VecDeque<MockCompletion>,
    default_interrupt: MockCompletion,
    failures: Vec<MockOp>,
    calls: Vec<HostCall>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            client: None,
            max_events: usize::MAX,
            devices: HashMap::new(),
            open: HashMap::new(),
            next_handle: 1,
            events: VecDeque::new(),
            queue: VecDeque::new(),
            held: Vec::new(),
            control_script: VecDeque::new(),
            interrupt_script: VecDeque::new(),
            default_interrupt: MockCompletion::Data(Vec::new()),
            failures: Vec::new(),
            calls: Vec::new(),
        }
    }

    /// Plug a device in and queue its `NewDevice` event
    pub fn attach(&mut self, address: DeviceAddress, mut device: MockDevice) {
        device.info.address = address;
        self.devices.insert(address, device);
        self.events.push_back(ClientEvent::NewDevice { address });
    }

    /// Unplug a device and queue its `DeviceGone` event
    pub fn detach(&mut self, address: DeviceAddress) {
        self.devices.remove(&address);
        self.events.push_back(ClientEvent::DeviceGone { address });
    }

    pub fn push_event(&mut self, event: ClientEvent) {
        self.events.push_back(event);
    }

    pub fn script_control(&mut self, completion: MockCompletion) {
        self.control_script.push_back(completion);
    }

    pub fn script_interrupt(&mut self, completion: MockCompletion) {
        self.interrupt_script.push_back(completion);
    }

    /// Outcome of interrupt transfers once the script is exhausted
    pub fn set_default_interrupt(&mut self, completion: MockCompletion) {
        self.default_interrupt = completion;
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&mut self, op: MockOp) {
        self.failures.push(op);
    }

    pub fn calls(&self) -> &[HostCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn client(&self) -> Option<ClientHandle> {
        self.client
    }

    /// Number of submissions to `endpoint` recorded so far
    pub fn submissions(&self, endpoint: u8) -> usize {
        self.calls
            .iter()
            .filter(|call| match call {
                HostCall::Submit { endpoint: ep, .. } => *ep == endpoint,
                HostCall::SubmitControl(_) => endpoint == 0,
                _ => false,
            })
            .count()
    }

    pub fn is_open(&self, device: DeviceHandle) -> bool {
        self.open.contains_key(&device)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn claimed(&self, device: DeviceHandle) -> Vec<u8> {
        let mut claimed: Vec<u8> = self
            .open
            .get(&device)
            .map(|state| state.claimed.iter().copied().collect())
            .unwrap_or_default();
        claimed.sort_unstable();
        claimed
    }

    /// Transfers held in flight by [`MockCompletion::Hold`]
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    fn take_failure(&mut self, op: MockOp) -> Result<()> {
        match self.failures.iter().position(|f| *f == op) {
            Some(pos) => {
                self.failures.remove(pos);
                Err(HostError::Usb(rusb::Error::Io))
            }
            None => Ok(()),
        }
    }

    fn check_client(&self, client: ClientHandle) -> Result<()> {
        match self.client {
            Some(registered) if registered == client => Ok(()),
            _ => Err(HostError::InvalidClient),
        }
    }

    fn open_state(&self, device: DeviceHandle) -> Result<&OpenState> {
        self.open.get(&device).ok_or(HostError::InvalidHandle(device))
    }

    fn open_state_mut(&mut self, device: DeviceHandle) -> Result<&mut OpenState> {
        self.open
            .get_mut(&device)
            .ok_or(HostError::InvalidHandle(device))
    }

    fn complete_queued(&mut self) {
        while let Some(transfer) = self.queue.pop_front() {
            let Some(state) = transfer.device.and_then(|d| self.open.get(&d)) else {
                transfer.finish(TransferStatus::NoDevice, 0);
                continue;
            };
            if !self.devices.contains_key(&state.address) {
                transfer.finish(TransferStatus::NoDevice, 0);
                continue;
            }

            let completion = if transfer.endpoint == 0 {
                self.control_script.pop_front().unwrap_or_else(|| {
                    MockCompletion::Data(state.device.report_descriptor.clone())
                })
            } else {
                self.interrupt_script
                    .pop_front()
                    .unwrap_or_else(|| self.default_interrupt.clone())
            };

            self.apply(transfer, completion);
        }
    }

    fn apply(&mut self, mut transfer: Transfer, completion: MockCompletion) {
        match completion {
            MockCompletion::Data(data) => {
                let offset = if transfer.endpoint == 0 {
                    SETUP_PACKET_SIZE
                } else {
                    0
                };
                let room = transfer.num_bytes.saturating_sub(offset);
                let len = data.len().min(room);
                transfer.buffer[offset..offset + len].copy_from_slice(&data[..len]);
                transfer.finish(TransferStatus::Completed, offset + len);
            }
            MockCompletion::Status(status) => transfer.finish(status, 0),
            MockCompletion::Hold => self.held.push(transfer),
        }
    }

    fn cancel_where(&mut self, device: DeviceHandle, endpoint: u8) {
        let matches = |t: &Transfer| t.device == Some(device) && t.endpoint == endpoint;

        let (cancelled, keep): (Vec<_>, Vec<_>) = self.held.drain(..).partition(|t| matches(t));
        self.held = keep;
        let (queued, keep): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|t| matches(t));
        self.queue = keep;

        for transfer in cancelled.into_iter().chain(queued) {
            transfer.finish(TransferStatus::Cancelled, 0);
        }
    }
}

impl HostController for MockHost {
    fn register_client(&mut self, config: &ClientConfig) -> Result<ClientHandle> {
        self.calls.push(HostCall::RegisterClient);
        self.take_failure(MockOp::Register)?;
        if self.client.is_some() {
            return Err(HostError::ClientRegistered);
        }
        let handle = ClientHandle(1);
        self.client = Some(handle);
        self.max_events = config.max_num_event_msg.max(1);
        Ok(handle)
    }

    fn deregister_client(&mut self, client: ClientHandle) -> Result<()> {
        self.calls.push(HostCall::DeregisterClient);
        self.check_client(client)?;
        self.client = None;
        Ok(())
    }

    fn handle_events(
        &mut self,
        client: ClientHandle,
        timeout: Option<Duration>,
        on_event: &mut dyn FnMut(ClientEvent),
    ) -> Result<()> {
        self.calls.push(HostCall::HandleEvents(timeout));
        self.check_client(client)?;
        self.take_failure(MockOp::HandleEvents)?;

        for _ in 0..self.max_events {
            match self.events.pop_front() {
                Some(event) => on_event(event),
                None => break,
            }
        }

        self.complete_queued();
        Ok(())
    }

    fn device_open(&mut self, client: ClientHandle, address: DeviceAddress) -> Result<DeviceHandle> {
        self.calls.push(HostCall::Open(address));
        self.check_client(client)?;
        self.take_failure(MockOp::Open)?;

        let device = self
            .devices
            .get(&address)
            .cloned()
            .ok_or(HostError::DeviceNotFound(address))?;

        let handle = DeviceHandle(self.next_handle);
        self.next_handle += 1;
        self.open.insert(
            handle,
            OpenState {
                address,
                device,
                claimed: HashSet::new(),
                halted: HashSet::new(),
            },
        );
        Ok(handle)
    }

    fn device_close(&mut self, client: ClientHandle, device: DeviceHandle) -> Result<()> {
        self.calls.push(HostCall::Close(device));
        self.check_client(client)?;
        self.take_failure(MockOp::Close)?;
        self.open
            .remove(&device)
            .map(|_| ())
            .ok_or(HostError::InvalidHandle(device))
    }

    fn device_info(&mut self, device: DeviceHandle) -> Result<DeviceInfo> {
        self.calls.push(HostCall::DeviceInfo);
        self.take_failure(MockOp::DeviceInfo)?;
        Ok(self.open_state(device)?.device.info.clone())
    }

    fn device_descriptor(&mut self, device: DeviceHandle) -> Result<DeviceDescriptor> {
        self.calls.push(HostCall::DeviceDescriptor);
        self.take_failure(MockOp::DeviceDescriptor)?;
        Ok(self.open_state(device)?.device.descriptor.clone())
    }

    fn active_config_descriptor(&mut self, device: DeviceHandle) -> Result<ConfigDescriptor> {
        self.calls.push(HostCall::ConfigDescriptor);
        self.take_failure(MockOp::ConfigDescriptor)?;
        Ok(ConfigDescriptor::parse(&self.open_state(device)?.device.config)?)
    }

    fn interface_claim(
        &mut self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
        alternate: u8,
    ) -> Result<()> {
        self.calls.push(HostCall::Claim {
            interface,
            alternate,
        });
        self.check_client(client)?;
        self.take_failure(MockOp::Claim(interface))?;

        let state = self.open_state_mut(device)?;
        ConfigDescriptor::parse(&state.device.config)?.interface(interface, alternate)?;
        if !state.claimed.insert(interface) {
            return Err(HostError::InvalidArgument(format!(
                "interface {} already claimed",
                interface
            )));
        }
        Ok(())
    }

    fn interface_release(
        &mut self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
    ) -> Result<()> {
        self.calls.push(HostCall::Release(interface));
        self.check_client(client)?;
        self.take_failure(MockOp::Release(interface))?;

        let state = self.open_state_mut(device)?;
        if state.claimed.remove(&interface) {
            Ok(())
        } else {
            Err(HostError::InterfaceNotClaimed(interface))
        }
    }

    fn endpoint_halt(&mut self, device: DeviceHandle, endpoint: u8) -> Result<()> {
        self.calls.push(HostCall::Halt(endpoint));
        self.take_failure(MockOp::Halt(endpoint))?;
        self.open_state_mut(device)?.halted.insert(endpoint);
        Ok(())
    }

    fn endpoint_flush(&mut self, device: DeviceHandle, endpoint: u8) -> Result<()> {
        self.calls.push(HostCall::Flush(endpoint));
        self.take_failure(MockOp::Flush(endpoint))?;
        if !self.open_state(device)?.halted.contains(&endpoint) {
            return Err(HostError::InvalidArgument(format!(
                "endpoint {:#04x} must be halted before flushing",
                endpoint
            )));
        }
        self.cancel_where(device, endpoint);
        Ok(())
    }

    fn transfer_alloc(&mut self, size: usize) -> Result<Transfer> {
        self.calls.push(HostCall::Alloc(size));
        Ok(Transfer::new(size))
    }

    fn transfer_submit(&mut self, transfer: Transfer) -> std::result::Result<(), SubmitError> {
        self.calls.push(HostCall::Submit {
            endpoint: transfer.endpoint,
            num_bytes: transfer.num_bytes,
        });
        if let Err(e) = self.take_failure(MockOp::Submit) {
            return Err(SubmitError::new(e, transfer));
        }
        let device = match validate_submission(&transfer, false) {
            Ok(device) => device,
            Err(e) => return Err(SubmitError::new(e, transfer)),
        };
        let halted = match self.open.get(&device) {
            Some(state) => state.halted.contains(&transfer.endpoint),
            None => return Err(SubmitError::new(HostError::InvalidHandle(device), transfer)),
        };
        if halted {
            return Err(SubmitError::new(
                HostError::EndpointHalted(transfer.endpoint),
                transfer,
            ));
        }

        self.queue.push_back(transfer);
        Ok(())
    }

    fn transfer_submit_control(
        &mut self,
        client: ClientHandle,
        transfer: Transfer,
    ) -> std::result::Result<(), SubmitError> {
        match SetupPacket::from_bytes(&transfer.buffer) {
            Ok(setup) => self.calls.push(HostCall::SubmitControl(setup)),
            Err(e) => return Err(SubmitError::new(e.into(), transfer)),
        }
        if let Err(e) = self
            .check_client(client)
            .and_then(|()| self.take_failure(MockOp::SubmitControl))
        {
            return Err(SubmitError::new(e, transfer));
        }
        let device = match validate_submission(&transfer, true) {
            Ok(device) => device,
            Err(e) => return Err(SubmitError::new(e, transfer)),
        };
        if !self.open.contains_key(&device) {
            return Err(SubmitError::new(HostError::InvalidHandle(device), transfer));
        }

        self.queue.push_back(transfer);
        Ok(())
    }
}
