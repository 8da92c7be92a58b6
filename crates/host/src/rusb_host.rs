//! libusb host controller backend
//!
//! [`RusbLibrary`] owns the libusb context and counts registered clients for
//! the host daemon. [`RusbHost`] is the per-client [`HostController`]:
//!
//! - Device presence comes from a libusb hot-plug registration (with
//!   `enumerate(true)` so devices already plugged in are announced too). The
//!   callback runs inside `libusb_handle_events` and only forwards notices
//!   over a channel; filtering and bookkeeping happen in the pump.
//! - Submitted transfers are queued and executed synchronously with the
//!   blocking rusb transfer calls on the next pump, then completed through
//!   their callback. Completions therefore only ever fire from inside
//!   [`HostController::handle_events`].
//! - The raw configuration descriptor is read with a GET_DESCRIPTOR request
//!   so class descriptors between interfaces and endpoints are preserved.

use crossbeam_channel::{Receiver, Sender, unbounded};
use protocol::descriptors::{CONFIG_DESCRIPTOR_SIZE, DESCRIPTOR_TYPE_CONFIGURATION};
use protocol::setup::{REQUEST_GET_DESCRIPTOR, REQUEST_TYPE_DIR_IN};
use protocol::{
    ConfigDescriptor, DeviceAddress, DeviceDescriptor, DeviceHandle, DeviceSpeed, Direction,
    EndpointType, HID_CLASS, SETUP_PACKET_SIZE, SetupPacket, TransferStatus,
};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::controller::{
    ClientConfig, ClientEvent, ClientHandle, DeviceInfo, HostController, SubmitError, Transfer,
    validate_submission,
};
use crate::error::{HostError, Result};

/// Timeout for the descriptor requests issued by the backend itself
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(1000);

/// Notifications from the library to the host daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryEvent {
    ClientRegistered,
    AllClientsGone,
    Shutdown,
}

struct LibraryShared {
    clients: AtomicUsize,
    notify_tx: Sender<LibraryEvent>,
    notify_rx: Receiver<LibraryEvent>,
}

/// Installed libusb library
///
/// Cheap to clone; every clone refers to the same context. The context is
/// torn down once the last clone is dropped.
#[derive(Clone)]
pub struct RusbLibrary {
    context: Context,
    shared: Arc<LibraryShared>,
}

impl RusbLibrary {
    /// Initialize libusb
    pub fn install() -> Result<Self> {
        let context = Context::new()?;
        let version = rusb::version();
        info!(
            "libusb {}.{}.{} installed (hotplug: {})",
            version.major(),
            version.minor(),
            version.micro(),
            rusb::has_hotplug()
        );

        let (notify_tx, notify_rx) = unbounded();
        Ok(Self {
            context,
            shared: Arc::new(LibraryShared {
                clients: AtomicUsize::new(0),
                notify_tx,
                notify_rx,
            }),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.load(Ordering::SeqCst)
    }

    /// Block until the next library event
    pub fn wait_event(&self) -> Option<LibraryEvent> {
        self.shared.notify_rx.recv().ok()
    }

    /// Wait at most `timeout` for the next library event
    pub fn wait_event_timeout(&self, timeout: Duration) -> Option<LibraryEvent> {
        self.shared.notify_rx.recv_timeout(timeout).ok()
    }

    /// Ask the daemon to uninstall even if clients never registered
    pub fn request_shutdown(&self) {
        let _ = self.shared.notify_tx.send(LibraryEvent::Shutdown);
    }

    /// Wake a thread blocked in `handle_events`
    pub fn wake(&self) {
        self.context.interrupt_handle_events();
    }

    fn client_registered(&self) {
        self.shared.clients.fetch_add(1, Ordering::SeqCst);
        let _ = self.shared.notify_tx.send(LibraryEvent::ClientRegistered);
    }

    fn client_deregistered(&self) {
        let previous = self
            .shared
            .clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            let _ = self.shared.notify_tx.send(LibraryEvent::AllClientsGone);
        }
    }

    /// Enumerate attached devices for display
    pub fn list_devices(&self, filters: &[String]) -> Result<Vec<DeviceListing>> {
        let mut listings = Vec::new();
        for device in self.context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!("Skipping device without descriptor: {}", e);
                    continue;
                }
            };

            let (manufacturer, product) = match device.open() {
                Ok(handle) => (
                    desc.manufacturer_string_index()
                        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
                    desc.product_string_index()
                        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
                ),
                Err(_) => (None, None),
            };

            let hid_interfaces = device
                .active_config_descriptor()
                .map(|config| {
                    config
                        .interfaces()
                        .filter(|intf| {
                            intf.descriptors()
                                .any(|alt| alt.class_code() == HID_CLASS)
                        })
                        .map(|intf| intf.number())
                        .collect()
                })
                .unwrap_or_default();

            listings.push(DeviceListing {
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                speed: map_device_speed(device.speed()),
                manufacturer,
                product,
                hid_interfaces,
                allowed: check_filter(desc.vendor_id(), desc.product_id(), filters),
            });
        }
        Ok(listings)
    }
}

/// One attached device as shown by `--list-devices`
#[derive(Debug, Clone, Serialize)]
pub struct DeviceListing {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub speed: DeviceSpeed,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub hid_interfaces: Vec<u8>,
    /// Passes the configured VID:PID filters
    pub allowed: bool,
}

enum HotplugNotice {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

struct HotplugCallback {
    tx: Sender<HotplugNotice>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.send(HotplugNotice::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.send(HotplugNotice::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

struct ClientState {
    handle: ClientHandle,
    max_events: usize,
    _registration: Option<Registration<Context>>,
    notices: Receiver<HotplugNotice>,
}

struct OpenDevice {
    address: DeviceAddress,
    device: Device<Context>,
    handle: rusb::DeviceHandle<Context>,
    config: Option<ConfigDescriptor>,
    /// Claimed interface -> kernel driver was detached from it
    claimed: HashMap<u8, bool>,
    /// Endpoints of claimed interfaces
    endpoints: HashMap<u8, EndpointType>,
    halted: HashSet<u8>,
}

/// libusb-backed [`HostController`]
pub struct RusbHost {
    library: RusbLibrary,
    filters: Vec<String>,
    client: Option<ClientState>,
    next_client: u32,
    /// Announced devices by address
    devices: HashMap<DeviceAddress, Device<Context>>,
    open: HashMap<DeviceHandle, OpenDevice>,
    next_handle: u32,
    queue: VecDeque<Transfer>,
    events: VecDeque<ClientEvent>,
}

impl RusbHost {
    /// Create a host controller on an installed library
    ///
    /// `filters` are VID:PID patterns (`0x046d:0xc52b`, `0x046d:*`); devices
    /// that match none are never announced. An empty list allows everything.
    pub fn new(library: RusbLibrary, filters: Vec<String>) -> Self {
        Self {
            library,
            filters,
            client: None,
            next_client: 1,
            devices: HashMap::new(),
            open: HashMap::new(),
            next_handle: 1,
            queue: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn library(&self) -> &RusbLibrary {
        &self.library
    }

    fn check_client(&self, client: ClientHandle) -> Result<&ClientState> {
        match &self.client {
            Some(state) if state.handle == client => Ok(state),
            _ => Err(HostError::InvalidClient),
        }
    }

    fn open_device(&self, device: DeviceHandle) -> Result<&OpenDevice> {
        self.open.get(&device).ok_or(HostError::InvalidHandle(device))
    }

    fn open_device_mut(&mut self, device: DeviceHandle) -> Result<&mut OpenDevice> {
        self.open
            .get_mut(&device)
            .ok_or(HostError::InvalidHandle(device))
    }

    /// Check if a device should be announced
    fn is_device_allowed(&self, device: &Device<Context>) -> bool {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => return false,
        };

        // Hubs are never HID devices
        if desc.class_code() == 0x09 {
            debug!(
                "Skipping hub: bus={}, addr={}, vid={:#x}, pid={:#x}",
                device.bus_number(),
                device.address(),
                desc.vendor_id(),
                desc.product_id()
            );
            return false;
        }

        if !check_filter(desc.vendor_id(), desc.product_id(), &self.filters) {
            debug!(
                "Device ignored by filter: bus={}, addr={}, vid={:#x}, pid={:#x}",
                device.bus_number(),
                device.address(),
                desc.vendor_id(),
                desc.product_id()
            );
            return false;
        }

        true
    }

    fn device_arrived(&mut self, device: Device<Context>) {
        if !self.is_device_allowed(&device) {
            return;
        }

        let address = DeviceAddress(device.address());
        if let Some(previous) = self.devices.get(&address)
            && previous.bus_number() != device.bus_number()
        {
            warn!(
                "Address {} reused on bus {}, replacing device from bus {}",
                address,
                device.bus_number(),
                previous.bus_number()
            );
        }

        debug!("New device at address {}", address);
        self.devices.insert(address, device);
        self.events.push_back(ClientEvent::NewDevice { address });
    }

    fn device_left(&mut self, bus: u8, address: u8) {
        let address = DeviceAddress(address);
        let tracked = self
            .devices
            .get(&address)
            .is_some_and(|device| device.bus_number() == bus);

        if tracked {
            self.devices.remove(&address);
            debug!("Device at address {} gone", address);
            self.events.push_back(ClientEvent::DeviceGone { address });
        }
    }

    fn drain_notices(&mut self) {
        let notices: Vec<HotplugNotice> = match &self.client {
            Some(state) => state.notices.try_iter().collect(),
            None => return,
        };

        for notice in notices {
            match notice {
                HotplugNotice::Arrived(device) => self.device_arrived(device),
                HotplugNotice::Left { bus, address } => self.device_left(bus, address),
            }
        }
    }

    fn enumerate_devices(&mut self) -> Result<()> {
        let devices = self.library.context.devices()?;
        for device in devices.iter() {
            self.device_arrived(device);
        }
        debug!("Enumerated {} devices", self.devices.len());
        Ok(())
    }

    fn run_queued_transfers(&mut self) {
        while let Some(transfer) = self.queue.pop_front() {
            let Some(device) = transfer.device else {
                transfer.finish(TransferStatus::Error, 0);
                continue;
            };
            match self.open.get(&device) {
                Some(open) => execute_transfer(open, transfer),
                None => transfer.finish(TransferStatus::NoDevice, 0),
            }
        }
    }

    fn cached_config(&mut self, device: DeviceHandle) -> Result<ConfigDescriptor> {
        let open = self.open_device_mut(device)?;
        if let Some(config) = &open.config {
            return Ok(config.clone());
        }
        let config = read_active_config(&open.handle, &open.device)?;
        open.config = Some(config.clone());
        Ok(config)
    }
}

impl HostController for RusbHost {
    fn register_client(&mut self, config: &ClientConfig) -> Result<ClientHandle> {
        if self.client.is_some() {
            return Err(HostError::ClientRegistered);
        }

        let (tx, notices) = unbounded();
        let registration = if rusb::has_hotplug() {
            let callback = HotplugCallback { tx };
            let registration = HotplugBuilder::new()
                .enumerate(true)
                .register(&self.library.context, Box::new(callback))?;
            debug!("Hot-plug callbacks registered");
            Some(registration)
        } else {
            warn!("libusb has no hot-plug support, only devices present now are seen");
            None
        };

        let handle = ClientHandle(self.next_client);
        self.next_client += 1;
        self.client = Some(ClientState {
            handle,
            max_events: config.max_num_event_msg.max(1),
            _registration: registration,
            notices,
        });

        if !rusb::has_hotplug() {
            self.enumerate_devices()?;
        }

        self.library.client_registered();
        info!("Client {:?} registered", handle);
        Ok(handle)
    }

    fn deregister_client(&mut self, client: ClientHandle) -> Result<()> {
        self.check_client(client)?;
        self.client = None;
        self.events.clear();
        self.library.client_deregistered();
        info!("Client {:?} deregistered", client);
        Ok(())
    }

    fn handle_events(
        &mut self,
        client: ClientHandle,
        timeout: Option<Duration>,
        on_event: &mut dyn FnMut(ClientEvent),
    ) -> Result<()> {
        let max_events = self.check_client(client)?.max_events;

        // Work already waiting must not sit behind a blocking wait
        let timeout = if self.queue.is_empty() && self.events.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        match self.library.context.handle_events(timeout) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => return Err(e.into()),
        }

        self.drain_notices();

        for _ in 0..max_events {
            match self.events.pop_front() {
                Some(event) => on_event(event),
                None => break,
            }
        }

        self.run_queued_transfers();
        Ok(())
    }

    fn device_open(&mut self, client: ClientHandle, address: DeviceAddress) -> Result<DeviceHandle> {
        self.check_client(client)?;

        if self.open.values().any(|open| open.address == address) {
            return Err(HostError::InvalidArgument(format!(
                "device {} is already open",
                address
            )));
        }

        let device = self
            .devices
            .get(&address)
            .cloned()
            .ok_or(HostError::DeviceNotFound(address))?;
        let handle = device.open()?;

        let device_handle = DeviceHandle(self.next_handle);
        self.next_handle += 1;
        self.open.insert(
            device_handle,
            OpenDevice {
                address,
                device,
                handle,
                config: None,
                claimed: HashMap::new(),
                endpoints: HashMap::new(),
                halted: HashSet::new(),
            },
        );

        debug!("Opened device {} as {:?}", address, device_handle);
        Ok(device_handle)
    }

    fn device_close(&mut self, client: ClientHandle, device: DeviceHandle) -> Result<()> {
        self.check_client(client)?;
        let open = self
            .open
            .remove(&device)
            .ok_or(HostError::InvalidHandle(device))?;

        for (interface, detached) in &open.claimed {
            warn!("Interface {} still claimed at close, releasing", interface);
            release(&open.handle, *interface, *detached);
        }

        // Transfers still queued for this device can never run
        let (stale, keep): (VecDeque<_>, VecDeque<_>) = self
            .queue
            .drain(..)
            .partition(|t| t.device == Some(device));
        self.queue = keep;
        for transfer in stale {
            transfer.finish(TransferStatus::NoDevice, 0);
        }

        debug!("Closed device {} ({:?})", open.address, device);
        Ok(())
    }

    fn device_info(&mut self, device: DeviceHandle) -> Result<DeviceInfo> {
        let open = self.open_device(device)?;
        let desc = open.device.device_descriptor()?;
        let configuration_value = open.handle.active_configuration()?;

        let read = |index: Option<u8>| -> Result<Option<String>> {
            match index {
                Some(idx) => Ok(Some(open.handle.read_string_descriptor_ascii(idx)?)),
                None => Ok(None),
            }
        };

        Ok(DeviceInfo {
            speed: map_device_speed(open.device.speed()),
            address: open.address,
            configuration_value,
            manufacturer: read(desc.manufacturer_string_index())?,
            product: read(desc.product_string_index())?,
            serial_number: read(desc.serial_number_string_index())?,
        })
    }

    fn device_descriptor(&mut self, device: DeviceHandle) -> Result<DeviceDescriptor> {
        let open = self.open_device(device)?;
        let desc = open.device.device_descriptor()?;
        Ok(convert_device_descriptor(&desc))
    }

    fn active_config_descriptor(&mut self, device: DeviceHandle) -> Result<ConfigDescriptor> {
        self.cached_config(device)
    }

    fn interface_claim(
        &mut self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
        alternate: u8,
    ) -> Result<()> {
        self.check_client(client)?;
        let config = self.cached_config(device)?;
        let descriptor = config.interface(interface, alternate)?;
        let open = self.open_device_mut(device)?;

        if open.claimed.contains_key(&interface) {
            return Err(HostError::InvalidArgument(format!(
                "interface {} already claimed",
                interface
            )));
        }

        let mut detached = false;
        match open.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match open.handle.detach_kernel_driver(interface) {
                    Ok(()) => detached = true,
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        if let Err(e) = open.handle.claim_interface(interface) {
            if detached {
                let _ = open.handle.attach_kernel_driver(interface);
            }
            return Err(e.into());
        }
        if alternate != 0
            && let Err(e) = open.handle.set_alternate_setting(interface, alternate)
        {
            release(&open.handle, interface, detached);
            return Err(e.into());
        }

        for index in 0..descriptor.num_endpoints {
            match config.endpoint_by_index(&descriptor, index) {
                Ok(ep) => {
                    open.endpoints.insert(ep.address, ep.transfer_type());
                }
                Err(e) => debug!("Interface {} endpoint {}: {}", interface, index, e),
            }
        }

        open.claimed.insert(interface, detached);
        debug!("Claimed interface {} on {:?}", interface, device);
        Ok(())
    }

    fn interface_release(
        &mut self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
    ) -> Result<()> {
        self.check_client(client)?;
        let config = self.cached_config(device).ok();
        let open = self.open_device_mut(device)?;
        let detached = open
            .claimed
            .remove(&interface)
            .ok_or(HostError::InterfaceNotClaimed(interface))?;

        if let Some(config) = config
            && let Ok(descriptor) = config.interface(interface, 0)
        {
            for index in 0..descriptor.num_endpoints {
                if let Ok(ep) = config.endpoint_by_index(&descriptor, index) {
                    open.endpoints.remove(&ep.address);
                    open.halted.remove(&ep.address);
                }
            }
        }

        release(&open.handle, interface, detached);
        Ok(())
    }

    fn endpoint_halt(&mut self, device: DeviceHandle, endpoint: u8) -> Result<()> {
        let open = self.open_device_mut(device)?;
        open.halted.insert(endpoint);
        debug!("Halted endpoint {:#04x} on {:?}", endpoint, device);
        Ok(())
    }

    fn endpoint_flush(&mut self, device: DeviceHandle, endpoint: u8) -> Result<()> {
        let open = self.open_device(device)?;
        if !open.halted.contains(&endpoint) {
            return Err(HostError::InvalidArgument(format!(
                "endpoint {:#04x} must be halted before flushing",
                endpoint
            )));
        }

        let (flushed, keep): (VecDeque<_>, VecDeque<_>) = self
            .queue
            .drain(..)
            .partition(|t| t.device == Some(device) && t.endpoint == endpoint);
        self.queue = keep;

        debug!(
            "Flushed {} transfers from endpoint {:#04x}",
            flushed.len(),
            endpoint
        );
        for transfer in flushed {
            transfer.finish(TransferStatus::Cancelled, 0);
        }
        Ok(())
    }

    fn transfer_alloc(&mut self, size: usize) -> Result<Transfer> {
        Ok(Transfer::new(size))
    }

    fn transfer_submit(&mut self, mut transfer: Transfer) -> std::result::Result<(), SubmitError> {
        let device = match validate_submission(&transfer, false) {
            Ok(device) => device,
            Err(e) => return Err(SubmitError::new(e, transfer)),
        };
        let open = match self.open.get(&device) {
            Some(open) => open,
            None => return Err(SubmitError::new(HostError::InvalidHandle(device), transfer)),
        };
        if open.halted.contains(&transfer.endpoint) {
            return Err(SubmitError::new(
                HostError::EndpointHalted(transfer.endpoint),
                transfer,
            ));
        }
        match open.endpoints.get(&transfer.endpoint) {
            Some(EndpointType::Interrupt) | Some(EndpointType::Bulk) => {}
            Some(other) => {
                return Err(SubmitError::new(
                    HostError::InvalidArgument(format!("{:?} transfers are not supported", other)),
                    transfer,
                ));
            }
            None => {
                return Err(SubmitError::new(
                    HostError::InvalidArgument(format!(
                        "endpoint {:#04x} is not part of a claimed interface",
                        transfer.endpoint
                    )),
                    transfer,
                ));
            }
        }

        transfer.status = TransferStatus::Pending;
        transfer.actual_num_bytes = 0;
        self.queue.push_back(transfer);
        Ok(())
    }

    fn transfer_submit_control(
        &mut self,
        client: ClientHandle,
        mut transfer: Transfer,
    ) -> std::result::Result<(), SubmitError> {
        if let Err(e) = self.check_client(client) {
            return Err(SubmitError::new(e, transfer));
        }
        let device = match validate_submission(&transfer, true) {
            Ok(device) => device,
            Err(e) => return Err(SubmitError::new(e, transfer)),
        };
        if !self.open.contains_key(&device) {
            return Err(SubmitError::new(HostError::InvalidHandle(device), transfer));
        }

        transfer.status = TransferStatus::Pending;
        transfer.actual_num_bytes = 0;
        self.queue.push_back(transfer);
        Ok(())
    }
}

/// Release an interface and give it back to the kernel driver
fn release(handle: &rusb::DeviceHandle<Context>, interface: u8, reattach: bool) {
    match handle.release_interface(interface) {
        Ok(()) => debug!("Released interface {}", interface),
        // Nothing left to release on a disconnected device
        Err(rusb::Error::NoDevice) => debug!("Interface {} released with device gone", interface),
        Err(e) => warn!("Failed to release interface {}: {}", interface, e),
    }

    if reattach {
        if let Err(e) = handle.attach_kernel_driver(interface) {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            );
        } else {
            debug!("Reattached kernel driver to interface {}", interface);
        }
    }
}

/// Execute one queued transfer and complete it
fn execute_transfer(open: &OpenDevice, mut transfer: Transfer) {
    let result = if transfer.endpoint & 0x7F == 0 {
        execute_control(&open.handle, &mut transfer)
    } else {
        let endpoint = transfer.endpoint;
        let timeout = transfer.timeout;
        let num_bytes = transfer.num_bytes;
        let buffer = &mut transfer.buffer[..num_bytes];
        let kind = open
            .endpoints
            .get(&endpoint)
            .copied()
            .unwrap_or(EndpointType::Interrupt);

        match (kind, Direction::from_bit7(endpoint)) {
            (EndpointType::Bulk, Direction::In) => open.handle.read_bulk(endpoint, buffer, timeout),
            (EndpointType::Bulk, Direction::Out) => {
                open.handle.write_bulk(endpoint, buffer, timeout)
            }
            (_, Direction::In) => open.handle.read_interrupt(endpoint, buffer, timeout),
            (_, Direction::Out) => open.handle.write_interrupt(endpoint, buffer, timeout),
        }
    };

    match result {
        Ok(actual) => {
            debug!(
                "Transfer on endpoint {:#04x} completed: {} bytes",
                transfer.endpoint, actual
            );
            transfer.finish(TransferStatus::Completed, actual);
        }
        Err(e) => {
            let status = map_transfer_status(e);
            debug!(
                "Transfer on endpoint {:#04x} failed: {} ({:?})",
                transfer.endpoint, e, status
            );
            transfer.finish(status, 0);
        }
    }
}

/// Run a control transfer whose setup packet sits at the start of the buffer
///
/// Returns the byte count including the setup packet.
fn execute_control(
    handle: &rusb::DeviceHandle<Context>,
    transfer: &mut Transfer,
) -> rusb::Result<usize> {
    let setup = SetupPacket::from_bytes(&transfer.buffer).map_err(|_| rusb::Error::InvalidParam)?;
    let data_len = (transfer.num_bytes - SETUP_PACKET_SIZE).min(usize::from(setup.length));
    let data = &mut transfer.buffer[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + data_len];

    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, len={}",
        setup.request_type, setup.request, setup.value, setup.index, data_len
    );

    let transferred = match setup.direction() {
        Direction::In => handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            transfer.timeout,
        )?,
        Direction::Out => handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            transfer.timeout,
        )?,
    };
    Ok(SETUP_PACKET_SIZE + transferred)
}

/// Read the raw active configuration descriptor
fn read_active_config(
    handle: &rusb::DeviceHandle<Context>,
    device: &Device<Context>,
) -> Result<ConfigDescriptor> {
    let value = handle.active_configuration()?;
    let num_configurations = device.device_descriptor()?.num_configurations();
    let index = (0..num_configurations)
        .find(|i| {
            device
                .config_descriptor(*i)
                .is_ok_and(|config| config.number() == value)
        })
        .unwrap_or(0);

    let request_value = (u16::from(DESCRIPTOR_TYPE_CONFIGURATION) << 8) | u16::from(index);
    let mut header = [0u8; CONFIG_DESCRIPTOR_SIZE];
    handle.read_control(
        REQUEST_TYPE_DIR_IN,
        REQUEST_GET_DESCRIPTOR,
        request_value,
        0,
        &mut header,
        DESCRIPTOR_TIMEOUT,
    )?;

    let total_length = usize::from(u16::from_le_bytes([header[2], header[3]]));
    let mut raw = vec![0u8; total_length.max(CONFIG_DESCRIPTOR_SIZE)];
    let read = handle.read_control(
        REQUEST_TYPE_DIR_IN,
        REQUEST_GET_DESCRIPTOR,
        request_value,
        0,
        &mut raw,
        DESCRIPTOR_TIMEOUT,
    )?;
    raw.truncate(read);

    Ok(ConfigDescriptor::parse(&raw)?)
}

fn convert_device_descriptor(desc: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    let bcd = |v: rusb::Version| {
        (u16::from(v.major()) << 8) | (u16::from(v.minor()) << 4) | u16::from(v.sub_minor())
    };

    DeviceDescriptor {
        usb_version: bcd(desc.usb_version()),
        class: desc.class_code(),
        subclass: desc.sub_class_code(),
        protocol: desc.protocol_code(),
        max_packet_size0: desc.max_packet_size(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        device_version: bcd(desc.device_version()),
        manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
        product_index: desc.product_string_index().unwrap_or(0),
        serial_number_index: desc.serial_number_string_index().unwrap_or(0),
        num_configurations: desc.num_configurations(),
    }
}

/// Map rusb device speed to protocol DeviceSpeed
fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Full,
    }
}

/// Map a failed rusb transfer to the status the submitter sees
pub fn map_transfer_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}

/// Check if a VID/PID pair is allowed by the filters
///
/// Filter format: `0xVID:0xPID`, either side may be `*`. Filters are
/// validated by the config loader, malformed entries never match.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    let matches = |pattern: &str, value: u16| {
        pattern == "*"
            || u16::from_str_radix(
                pattern
                    .trim_start_matches("0x")
                    .trim_start_matches("0X"),
                16,
            )
            .is_ok_and(|v| v == value)
    };

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((filter_vid, filter_pid)) => matches(filter_vid, vid) && matches(filter_pid, pid),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(check_filter(0xABCD, 0x9999, &filters));

        assert!(!check_filter(0x1234, 0x9999, &filters));
        assert!(!check_filter(0x9999, 0x5678, &filters));
        assert!(!check_filter(0x0000, 0x0000, &filters));

        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_filter_ignores_malformed_entries() {
        let filters = vec!["garbage".to_string(), "*:0x0001".to_string()];
        assert!(check_filter(0x4242, 0x0001, &filters));
        assert!(!check_filter(0x4242, 0x0002, &filters));
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::Full), DeviceSpeed::Full);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::Super), DeviceSpeed::Super);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
    }

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(
            map_transfer_status(rusb::Error::Timeout),
            TransferStatus::TimedOut
        );
        assert_eq!(map_transfer_status(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(
            map_transfer_status(rusb::Error::NoDevice),
            TransferStatus::NoDevice
        );
        assert_eq!(map_transfer_status(rusb::Error::Io), TransferStatus::Error);
    }

    #[test]
    fn test_library_install() {
        // libusb may be unavailable in the build environment
        match RusbLibrary::install() {
            Ok(library) => {
                assert_eq!(library.client_count(), 0);
                library.request_shutdown();
                assert_eq!(
                    library.wait_event_timeout(Duration::from_millis(10)),
                    Some(LibraryEvent::Shutdown)
                );
            }
            Err(e) => eprintln!("libusb unavailable (expected without USB access): {}", e),
        }
    }
}
