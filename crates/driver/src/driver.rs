//! HID class driver state machine
//!
//! [`ClassDriver`] registers with a [`HostController`] as a client and walks
//! each attached device through a fixed pipeline: open, read device info and
//! descriptors, claim the HID interfaces, fetch the report descriptor over the
//! control endpoint and finally poll the interrupt IN endpoint. Detach (or a
//! shutdown request) collapses whatever is pending into the close path.
//!
//! All work runs on the calling thread. Host events reach the driver only
//! while it pumps the controller, and the event callback does nothing but
//! update the pending actions.

use common::{Clock, DriverEvent, EventPublisher, RateLimitResult, SystemClock};
use host::{ClientConfig, ClientEvent, ClientHandle, HostController, HostError, Transfer};
use protocol::hid::REPORT_DUMP_BYTES;
use protocol::{
    DESCRIPTOR_TYPE_HID_REPORT, DeviceAddress, DeviceHandle, DeviceSpeed, EndpointDescriptor,
    EndpointType, HID_CLASS, MAX_REPORT_DESCRIPTOR_SIZE, ReportDescriptorKind, SETUP_PACKET_SIZE,
    SetupPacket, TransferStatus, bit_dump, hex_dump, round_up_to_mps,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::action::{Action, PendingActions};
use crate::bridge::{TransferAttempt, TransferBridge, TransferError};
use crate::error::{DriverError, Result};
use crate::stages::{ControlStage, PollStage};

/// Runtime parameters of the class driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    /// Minimum spacing between two attempts of the same transfer action
    pub min_transfer_interval: Duration,
    /// How long to wait for a previous transfer before deferring
    pub acquire_timeout: Duration,
    /// Host pump timeout right after a submission
    pub pump_timeout: Duration,
    pub control_timeout: Duration,
    pub poll_timeout: Duration,
    /// Report descriptor request size before rounding to bMaxPacketSize0
    pub report_descriptor_max: usize,
    /// Consecutive transfer failures before a stage gives up
    pub max_retries: Option<u32>,
    /// Exit after the device is closed instead of waiting for the next one
    pub exit_on_detach: bool,
    pub max_event_messages: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            min_transfer_interval: Duration::from_millis(8),
            acquire_timeout: Duration::from_millis(100),
            pump_timeout: Duration::from_millis(10),
            control_timeout: Duration::from_millis(1000),
            poll_timeout: Duration::from_millis(1000),
            report_descriptor_max: MAX_REPORT_DESCRIPTOR_SIZE,
            max_retries: None,
            exit_on_detach: true,
            max_event_messages: 5,
        }
    }
}

/// A claimed HID interface and the interrupt endpoints it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedInterface {
    pub number: u8,
    pub endpoint_in: Option<EndpointDescriptor>,
    pub endpoint_out: Option<EndpointDescriptor>,
    /// Every endpoint address on the interface, halted and flushed on close
    pub endpoints: Vec<u8>,
}

/// Result of dispatching one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The handler ran
    Ran,
    /// A rate limiter deferred the handler for this long
    Deferred(Duration),
    /// The action was not pending
    Idle,
    /// Exit was dispatched
    Exit,
}

/// Whether the dispatch loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

/// Everything the event callback touches
#[derive(Debug, Default)]
struct DeviceContext {
    address: Option<DeviceAddress>,
    handle: Option<DeviceHandle>,
    pending: PendingActions,
    /// Device announced while another one was tracked
    waiting: Option<DeviceAddress>,
}

impl DeviceContext {
    /// Start enumerating the waiting device, if any
    fn promote_waiting(&mut self) {
        if let Some(next) = self.waiting.take() {
            info!("Enumerating waiting device at address {}", next);
            self.address = Some(next);
            self.pending.raise_open();
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DeviceSummary {
    vendor_id: u16,
    product_id: u16,
    speed: Option<DeviceSpeed>,
}

#[derive(Debug, Clone, Copy)]
enum TransferKind {
    Control,
    Interrupt,
}

/// USB HID class driver
pub struct ClassDriver<H: HostController> {
    host: H,
    client: ClientHandle,
    settings: DriverSettings,
    clock: Box<dyn Clock>,
    events: Option<EventPublisher>,
    shutdown: Option<Arc<AtomicBool>>,
    shutdown_seen: bool,
    exit_after_close: bool,

    ctx: DeviceContext,
    fault: Option<ClientEvent>,

    control_max_packet_size: u8,
    summary: DeviceSummary,
    claimed: Vec<ClaimedInterface>,
    endpoint_in: Option<EndpointDescriptor>,
    endpoint_out: Option<EndpointDescriptor>,

    bridge: TransferBridge,
    control: ControlStage,
    poll: PollStage,
}

impl<H: HostController> ClassDriver<H> {
    /// Register with `host` as a client
    pub fn new(mut host: H, settings: DriverSettings) -> Result<Self> {
        let client = host
            .register_client(&ClientConfig {
                max_num_event_msg: settings.max_event_messages,
            })
            .map_err(DriverError::host("register_client"))?;
        info!("Registered host client {:?}", client);

        Ok(Self {
            host,
            client,
            clock: Box::new(SystemClock),
            events: None,
            shutdown: None,
            shutdown_seen: false,
            exit_after_close: false,
            ctx: DeviceContext::default(),
            fault: None,
            control_max_packet_size: 0,
            summary: DeviceSummary::default(),
            claimed: Vec::new(),
            endpoint_in: None,
            endpoint_out: None,
            bridge: TransferBridge::new(settings.acquire_timeout, settings.pump_timeout),
            control: ControlStage::new(settings.min_transfer_interval, settings.max_retries),
            poll: PollStage::new(settings.min_transfer_interval, settings.max_retries),
            settings,
        })
    }

    /// Use `clock` for rate limiting
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Publish driver events to `publisher`
    pub fn with_events(mut self, publisher: EventPublisher) -> Self {
        self.events = Some(publisher);
        self
    }

    /// Shut down once `flag` is set
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn client(&self) -> ClientHandle {
        self.client
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn pending(&self) -> &PendingActions {
        &self.ctx.pending
    }

    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.ctx.address
    }

    pub fn device_handle(&self) -> Option<DeviceHandle> {
        self.ctx.handle
    }

    pub fn control_max_packet_size(&self) -> u8 {
        self.control_max_packet_size
    }

    pub fn claimed_interfaces(&self) -> &[ClaimedInterface] {
        &self.claimed
    }

    pub fn endpoint_in(&self) -> Option<EndpointDescriptor> {
        self.endpoint_in
    }

    pub fn endpoint_out(&self) -> Option<EndpointDescriptor> {
        self.endpoint_out
    }

    /// Report descriptor of the current device, once fetched
    pub fn report_descriptor(&self) -> Option<&[u8]> {
        self.control.report_descriptor()
    }

    /// Non-empty input reports received from the current device
    pub fn reports_received(&self) -> u64 {
        self.poll.reports()
    }

    /// Pump the host controller once
    ///
    /// Client events update the pending actions; an event kind the driver
    /// does not understand is returned as an error after the pump.
    pub fn process_events(&mut self, timeout: Option<Duration>) -> Result<()> {
        let ctx = &mut self.ctx;
        let fault = &mut self.fault;
        self.host
            .handle_events(self.client, timeout, &mut |event| {
                on_client_event(ctx, fault, event)
            })
            .map_err(DriverError::host("handle_events"))?;

        match self.fault.take() {
            Some(event) => Err(DriverError::UnexpectedEvent(event)),
            None => Ok(()),
        }
    }

    /// Close the current device if any, then exit
    pub fn request_shutdown(&mut self) {
        self.exit_after_close = true;
        if self.ctx.handle.is_some() {
            info!("Shutdown requested, closing device");
            self.ctx.pending.force_close();
        } else {
            info!("Shutdown requested");
            self.ctx.pending.force_exit();
        }
    }

    fn check_shutdown(&mut self) {
        if self.shutdown_seen {
            return;
        }
        let requested = self
            .shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst));
        if requested {
            self.shutdown_seen = true;
            self.request_shutdown();
        }
    }

    /// Run the handler of `action` if it is pending
    pub fn dispatch(&mut self, action: Action) -> Result<Progress> {
        if !self.ctx.pending.contains(action) {
            return Ok(Progress::Idle);
        }
        debug!("Dispatching {}", action);

        match action {
            Action::Open => self.handle_open(),
            Action::GetDeviceInfo => self.handle_device_info(),
            Action::GetDeviceDescriptor => self.handle_device_descriptor(),
            Action::GetConfigDescriptor => self.handle_config_descriptor(),
            Action::GetStringDescriptors => self.handle_string_descriptors(),
            Action::ClaimInterface => self.handle_claim_interface(),
            Action::ControlTransfer => self.handle_control_transfer(),
            Action::Poll => self.handle_poll(),
            Action::Close => self.handle_close(),
            Action::Exit => self.handle_exit(),
        }
    }

    /// One iteration of the dispatch loop
    ///
    /// With nothing pending this blocks in the host pump until an event
    /// arrives. Otherwise every pending action runs once in priority order;
    /// if all of them were deferred by rate limiting, the host is pumped for
    /// the shortest remaining window.
    pub fn step(&mut self) -> Result<LoopControl> {
        self.check_shutdown();

        if self.ctx.pending.is_empty() {
            self.process_events(None)?;
            return Ok(LoopControl::Continue);
        }

        let mut ran = false;
        let mut deferred: Option<Duration> = None;
        for action in Action::ALL {
            match self.dispatch(action)? {
                Progress::Ran => ran = true,
                Progress::Deferred(wait) => {
                    deferred = Some(deferred.map_or(wait, |d| d.min(wait)));
                }
                Progress::Idle => {}
                Progress::Exit => return Ok(LoopControl::Exit),
            }
        }

        if !ran && let Some(wait) = deferred {
            trace!("Rate limited, pumping for {:?}", wait);
            self.process_events(Some(wait))?;
        }
        Ok(LoopControl::Continue)
    }

    /// Run the dispatch loop until exit or a fatal error
    pub fn run(&mut self) -> Result<()> {
        info!("Class driver running");
        while self.step()? == LoopControl::Continue {}
        info!("Class driver exiting");
        Ok(())
    }

    /// Best-effort release of the current device after a fatal error
    ///
    /// The tracked address is kept so enumeration can be restarted.
    pub fn teardown(&mut self) {
        if let Some(device) = self.ctx.handle {
            for intf in self.claimed.clone() {
                for &endpoint in &intf.endpoints {
                    if let Err(e) = self.host.endpoint_halt(device, endpoint) {
                        debug!("Teardown: halt {:#04x}: {}", endpoint, e);
                    }
                    if let Err(e) = self.host.endpoint_flush(device, endpoint) {
                        debug!("Teardown: flush {:#04x}: {}", endpoint, e);
                    }
                }
                if let Err(e) = self.host.interface_release(self.client, device, intf.number) {
                    debug!("Teardown: release interface {}: {}", intf.number, e);
                }
            }
            if let Err(e) = self.host.device_close(self.client, device) {
                warn!("Teardown: close device: {}", e);
            }
        }

        let address = self.ctx.address;
        self.reset_device_state();
        self.ctx.pending.clear();
        self.ctx.address = address;
        self.fault = None;
    }

    /// Start enumeration again for the tracked device
    ///
    /// Returns false when no device is tracked.
    pub fn restart(&mut self) -> bool {
        if self.ctx.address.is_none() {
            return false;
        }
        self.ctx.pending.raise_open();
        true
    }

    /// Deregister from the host and hand it back
    pub fn shutdown(mut self) -> Result<H> {
        self.host
            .deregister_client(self.client)
            .map_err(DriverError::host("deregister_client"))?;
        info!("Deregistered host client {:?}", self.client);
        Ok(self.host)
    }

    fn publish(&self, event: DriverEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn require_handle(&self, action: Action) -> Result<DeviceHandle> {
        self.ctx.handle.ok_or(DriverError::Precondition {
            action,
            reason: "no device open",
        })
    }

    fn reset_device_state(&mut self) {
        self.ctx.address = None;
        self.ctx.handle = None;
        self.control_max_packet_size = 0;
        self.summary = DeviceSummary::default();
        self.claimed.clear();
        self.endpoint_in = None;
        self.endpoint_out = None;
        self.bridge.reset();
        self.control.reset();
        self.poll.reset();
    }

    fn handle_open(&mut self) -> Result<Progress> {
        let address = self.ctx.address.ok_or(DriverError::Precondition {
            action: Action::Open,
            reason: "no device address",
        })?;
        if self.ctx.handle.is_some() {
            return Err(DriverError::Precondition {
                action: Action::Open,
                reason: "device already open",
            });
        }

        info!("Opening device at address {}", address);
        let handle = self
            .host
            .device_open(self.client, address)
            .map_err(DriverError::host("device_open"))?;
        self.ctx.handle = Some(handle);
        self.ctx
            .pending
            .advance(Action::Open, Action::GetDeviceInfo)?;
        Ok(Progress::Ran)
    }

    fn handle_device_info(&mut self) -> Result<Progress> {
        let device = self.require_handle(Action::GetDeviceInfo)?;
        let info = self
            .host
            .device_info(device)
            .map_err(DriverError::host("device_info"))?;

        info!(
            "Device speed: {}, configuration value: {}",
            info.speed, info.configuration_value
        );
        self.summary.speed = Some(info.speed);
        self.ctx
            .pending
            .advance(Action::GetDeviceInfo, Action::GetDeviceDescriptor)?;
        Ok(Progress::Ran)
    }

    fn handle_device_descriptor(&mut self) -> Result<Progress> {
        let device = self.require_handle(Action::GetDeviceDescriptor)?;
        let descriptor = self
            .host
            .device_descriptor(device)
            .map_err(DriverError::host("device_descriptor"))?;

        info!(
            "Device descriptor: VID {:04x}, PID {:04x}, bMaxPacketSize0 {}",
            descriptor.vendor_id, descriptor.product_id, descriptor.max_packet_size0
        );
        debug!("{:?}", descriptor);

        self.control_max_packet_size = descriptor.max_packet_size0;
        self.summary.vendor_id = descriptor.vendor_id;
        self.summary.product_id = descriptor.product_id;
        self.ctx
            .pending
            .advance(Action::GetDeviceDescriptor, Action::GetConfigDescriptor)?;
        Ok(Progress::Ran)
    }

    fn handle_config_descriptor(&mut self) -> Result<Progress> {
        let device = self.require_handle(Action::GetConfigDescriptor)?;
        let config = self
            .host
            .active_config_descriptor(device)
            .map_err(DriverError::host("active_config_descriptor"))?;

        info!(
            "Configuration {}: {} interface(s), {} bytes, {} mA",
            config.configuration_value,
            config.num_interfaces,
            config.total_length,
            u16::from(config.max_power) * 2
        );
        debug!("Configuration descriptor: {}", hex_dump(config.as_bytes()));

        self.ctx
            .pending
            .advance(Action::GetConfigDescriptor, Action::GetStringDescriptors)?;
        Ok(Progress::Ran)
    }

    fn handle_string_descriptors(&mut self) -> Result<Progress> {
        let device = self.require_handle(Action::GetStringDescriptors)?;
        let info = self
            .host
            .device_info(device)
            .map_err(DriverError::host("device_info"))?;

        if let Some(manufacturer) = &info.manufacturer {
            info!("Manufacturer: {}", manufacturer);
        }
        if let Some(product) = &info.product {
            info!("Product: {}", product);
        }
        if let Some(serial) = &info.serial_number {
            info!("Serial number: {}", serial);
        }

        if let Some(address) = self.ctx.address {
            self.publish(DriverEvent::DeviceOpened {
                address,
                vendor_id: self.summary.vendor_id,
                product_id: self.summary.product_id,
                speed: self.summary.speed.unwrap_or(info.speed),
                manufacturer: info.manufacturer,
                product: info.product,
                serial_number: info.serial_number,
            });
        }

        self.ctx
            .pending
            .advance(Action::GetStringDescriptors, Action::ClaimInterface)?;
        Ok(Progress::Ran)
    }

    fn handle_claim_interface(&mut self) -> Result<Progress> {
        let device = self.require_handle(Action::ClaimInterface)?;
        let config = self
            .host
            .active_config_descriptor(device)
            .map_err(DriverError::host("active_config_descriptor"))?;
        let interfaces = config.interfaces().map_err(|e| DriverError::Host {
            op: "parse configuration",
            source: HostError::Descriptor(e),
        })?;

        for intf in interfaces.iter().filter(|i| i.alternate_setting == 0) {
            if intf.class != HID_CLASS {
                debug!(
                    "Interface {} has class {:#04x}, skipping",
                    intf.number, intf.class
                );
                continue;
            }

            let mut endpoint_in = None;
            let mut endpoint_out = None;
            let mut endpoints = Vec::new();
            for index in 0..intf.num_endpoints {
                let parsed = config.endpoint_by_index(intf, index);
                if let Ok(endpoint) = &parsed {
                    endpoints.push(endpoint.address);
                }
                match parsed {
                    Ok(endpoint) if endpoint.transfer_type() == EndpointType::Interrupt => {
                        debug!(
                            "Interface {}: interrupt endpoint {:#04x}, {} bytes, interval {}",
                            intf.number,
                            endpoint.address,
                            endpoint.packet_size(),
                            endpoint.interval
                        );
                        if endpoint.is_in() {
                            endpoint_in = Some(endpoint);
                        } else {
                            endpoint_out = Some(endpoint);
                        }
                    }
                    Ok(endpoint) => debug!(
                        "Interface {}: ignoring {:?} endpoint {:#04x}",
                        intf.number,
                        endpoint.transfer_type(),
                        endpoint.address
                    ),
                    Err(e) => warn!("Interface {} endpoint {}: {}", intf.number, index, e),
                }
            }

            if let Err(e) =
                self.host
                    .interface_claim(self.client, device, intf.number, intf.alternate_setting)
            {
                warn!("Failed to claim interface {}: {}", intf.number, e);
                continue;
            }

            info!("Claimed HID interface {}", intf.number);
            self.publish(DriverEvent::InterfaceClaimed {
                interface: intf.number,
                endpoint_in: endpoint_in.map(|ep| ep.address),
                endpoint_out: endpoint_out.map(|ep| ep.address),
            });
            if self.endpoint_in.is_none() {
                self.endpoint_in = endpoint_in;
            }
            if self.endpoint_out.is_none() {
                self.endpoint_out = endpoint_out;
            }
            self.claimed.push(ClaimedInterface {
                number: intf.number,
                endpoint_in,
                endpoint_out,
                endpoints,
            });
        }

        if self.claimed.is_empty() {
            warn!("No HID interface claimed, device stays idle until removed");
            self.ctx.pending.complete(Action::ClaimInterface);
        } else {
            self.ctx
                .pending
                .advance(Action::ClaimInterface, Action::ControlTransfer)?;
        }
        Ok(Progress::Ran)
    }

    fn handle_control_transfer(&mut self) -> Result<Progress> {
        let device = self.require_handle(Action::ControlTransfer)?;
        let interface = self.claimed.first().map(|c| c.number).ok_or(
            DriverError::Precondition {
                action: Action::ControlTransfer,
                reason: "no interface claimed",
            },
        )?;
        if self.control_max_packet_size == 0 {
            return Err(DriverError::Precondition {
                action: Action::ControlTransfer,
                reason: "bMaxPacketSize0 is zero",
            });
        }

        let now = self.clock.now();
        if let RateLimitResult::Wait(wait) = self.control.transfer.check(now) {
            return Ok(Progress::Deferred(wait));
        }
        self.control.transfer.record_attempt(now);

        if let Err(e) = self.acquire_bridge()? {
            self.transfer_failed(Action::ControlTransfer, Err(e));
            return Ok(Progress::Ran);
        }

        let num_bytes = round_up_to_mps(
            self.settings.report_descriptor_max,
            usize::from(self.control_max_packet_size),
        );
        let mut transfer = match self.control.transfer.take_transfer() {
            Some(transfer) if transfer.data_buffer_size() >= num_bytes => transfer,
            _ => self
                .host
                .transfer_alloc(num_bytes)
                .map_err(DriverError::host("transfer_alloc"))?,
        };

        let length = u16::try_from(num_bytes.saturating_sub(SETUP_PACKET_SIZE)).unwrap_or(u16::MAX);
        let setup = SetupPacket::get_interface_descriptor(
            DESCRIPTOR_TYPE_HID_REPORT,
            0,
            u16::from(interface),
            length,
        );
        transfer.buffer.fill(0);
        transfer.buffer[..SETUP_PACKET_SIZE].copy_from_slice(&setup.to_bytes());
        transfer.device = Some(device);
        transfer.endpoint = 0;
        transfer.num_bytes = num_bytes;
        transfer.timeout = self.settings.control_timeout;
        debug!(
            "Requesting report descriptor of interface {} ({} bytes)",
            interface, num_bytes
        );

        match self.submit_and_wait(transfer, TransferKind::Control)? {
            Ok(done) if done.status.is_completed() => {
                let data = done.data();
                debug!(
                    "Control transfer completed, {} bytes: {}",
                    data.len(),
                    hex_dump(data)
                );
                let descriptor = data.get(SETUP_PACKET_SIZE..).unwrap_or_default().to_vec();
                let kind = ReportDescriptorKind::classify(&descriptor);
                info!(
                    "Report descriptor: {} bytes, {}",
                    descriptor.len(),
                    kind.label()
                );

                self.publish(DriverEvent::ReportDescriptor {
                    interface,
                    descriptor: descriptor.clone(),
                    kind,
                });
                self.control.set_report_descriptor(descriptor);
                self.control.transfer.record_success();
                self.control.transfer.store_transfer(done);

                if self.endpoint_in.is_some() {
                    self.ctx
                        .pending
                        .advance(Action::ControlTransfer, Action::Poll)?;
                } else {
                    info!("No interrupt IN endpoint, nothing to poll");
                    self.ctx.pending.complete(Action::ControlTransfer);
                }
            }
            attempt => self.transfer_failed(Action::ControlTransfer, attempt),
        }
        Ok(Progress::Ran)
    }

    fn handle_poll(&mut self) -> Result<Progress> {
        let device = self.require_handle(Action::Poll)?;
        let endpoint = self.endpoint_in.ok_or(DriverError::Precondition {
            action: Action::Poll,
            reason: "no interrupt IN endpoint",
        })?;
        let size = endpoint.packet_size();
        if size == 0 {
            return Err(DriverError::Precondition {
                action: Action::Poll,
                reason: "interrupt IN endpoint has no packet size",
            });
        }

        let now = self.clock.now();
        if let RateLimitResult::Wait(wait) = self.poll.transfer.check(now) {
            return Ok(Progress::Deferred(wait));
        }
        self.poll.transfer.record_attempt(now);

        if let Err(e) = self.acquire_bridge()? {
            self.transfer_failed(Action::Poll, Err(e));
            return Ok(Progress::Ran);
        }

        let mut transfer = match self.poll.transfer.take_transfer() {
            Some(transfer) => transfer,
            None => self
                .host
                .transfer_alloc(size)
                .map_err(DriverError::host("transfer_alloc"))?,
        };
        transfer.buffer.fill(0);
        transfer.device = Some(device);
        transfer.endpoint = endpoint.address;
        transfer.num_bytes = size.min(transfer.data_buffer_size());
        transfer.timeout = self.settings.poll_timeout;

        match self.submit_and_wait(transfer, TransferKind::Interrupt)? {
            Ok(done) if done.status.is_completed() => {
                if done.actual_num_bytes > 0 {
                    let data = done.data().to_vec();
                    trace!(
                        "Report from {:#04x}: {}",
                        endpoint.address,
                        bit_dump(&data, REPORT_DUMP_BYTES)
                    );
                    self.poll.record_report();
                    self.publish(DriverEvent::InputReport {
                        endpoint: endpoint.address,
                        data,
                    });
                }
                self.poll.transfer.record_success();
                self.poll.transfer.store_transfer(done);
            }
            attempt => self.transfer_failed(Action::Poll, attempt),
        }
        Ok(Progress::Ran)
    }

    fn handle_close(&mut self) -> Result<Progress> {
        let device = self.require_handle(Action::Close)?;
        let address = self.ctx.address;

        for intf in self.claimed.clone() {
            for &endpoint in &intf.endpoints {
                self.host
                    .endpoint_halt(device, endpoint)
                    .map_err(DriverError::host("endpoint_halt"))?;
                self.host
                    .endpoint_flush(device, endpoint)
                    .map_err(DriverError::host("endpoint_flush"))?;
            }
            self.host
                .interface_release(self.client, device, intf.number)
                .map_err(DriverError::host("interface_release"))?;
            debug!("Released interface {}", intf.number);
        }

        self.host
            .device_close(self.client, device)
            .map_err(DriverError::host("device_close"))?;
        self.reset_device_state();

        if let Some(address) = address {
            info!("Device at address {} closed", address);
            self.publish(DriverEvent::DeviceClosed { address });
        }

        if self.settings.exit_on_detach || self.exit_after_close {
            if let Some(next) = self.ctx.waiting.take() {
                info!("Exiting, device at address {} is left alone", next);
            }
            self.ctx.pending.advance(Action::Close, Action::Exit)?;
        } else {
            self.ctx.pending.complete(Action::Close);
            if self.ctx.waiting.is_some() {
                self.ctx.promote_waiting();
            } else {
                info!("Waiting for the next device");
            }
        }
        Ok(Progress::Ran)
    }

    fn handle_exit(&mut self) -> Result<Progress> {
        self.ctx.pending.complete(Action::Exit);
        Ok(Progress::Exit)
    }

    /// Wait for a straggling transfer before starting a new one
    ///
    /// A late completion only arrives through the host pump, so pump first.
    fn acquire_bridge(&mut self) -> Result<std::result::Result<(), TransferError>> {
        if self.bridge.is_in_flight() {
            self.process_events(Some(self.bridge.pump_timeout()))?;
        }
        Ok(self.bridge.acquire())
    }

    fn submit_and_wait(
        &mut self,
        mut transfer: Transfer,
        kind: TransferKind,
    ) -> Result<TransferAttempt> {
        let timeout = transfer.timeout;
        self.bridge.begin(&mut transfer);

        let submitted = match kind {
            TransferKind::Control => self.host.transfer_submit_control(self.client, transfer),
            TransferKind::Interrupt => self.host.transfer_submit(transfer),
        };
        if let Err(rejected) = submitted {
            self.bridge.rejected();
            return Ok(Err(TransferError::Submit(rejected)));
        }

        self.process_events(Some(self.bridge.pump_timeout()))?;
        Ok(self.bridge.wait(timeout))
    }

    fn transfer_failed(&mut self, action: Action, attempt: TransferAttempt) {
        let stage = match action {
            Action::ControlTransfer => &mut self.control.transfer,
            _ => &mut self.poll.transfer,
        };

        // An interrupt IN endpoint with nothing to say simply times out
        let counts = match attempt {
            Ok(done) => {
                let idle = done.status == TransferStatus::TimedOut && action == Action::Poll;
                if idle {
                    trace!("{} timed out without data", action);
                } else {
                    warn!("{} failed with status {:?}", action, done.status);
                }
                stage.store_transfer(done);
                !idle
            }
            Err(TransferError::Submit(rejected)) => {
                warn!("{} submission rejected: {}", action, rejected.error);
                stage.store_transfer(*rejected.transfer);
                true
            }
            Err(TransferError::Busy) => {
                debug!("{} deferred, previous transfer still in flight", action);
                false
            }
            Err(TransferError::Timeout(timeout)) => {
                if action == Action::Poll {
                    trace!("{} got no completion within {:?}", action, timeout);
                } else {
                    warn!("{} got no completion within {:?}", action, timeout);
                }
                action != Action::Poll
            }
            Err(e @ TransferError::Disconnected) => {
                error!("{}: {}", action, e);
                true
            }
        };

        if counts && stage.record_failure() {
            warn!(
                "{} giving up after {} consecutive failures",
                action,
                stage.failures()
            );
            self.ctx.pending.complete(action);
        }
    }
}

fn on_client_event(ctx: &mut DeviceContext, fault: &mut Option<ClientEvent>, event: ClientEvent) {
    match event {
        ClientEvent::NewDevice { address } => match ctx.address {
            None => {
                info!("New device at address {}", address);
                ctx.address = Some(address);
                ctx.pending.raise_open();
            }
            Some(current) if current == address => {
                debug!("Device at address {} already tracked", address)
            }
            Some(current) => {
                warn!(
                    "Device at address {} waits until {} is closed",
                    address, current
                );
                ctx.waiting = Some(address);
            }
        },
        ClientEvent::DeviceGone { address } => {
            if ctx.waiting == Some(address) {
                info!("Waiting device at address {} gone", address);
                ctx.waiting = None;
            } else if ctx.address != Some(address) {
                debug!("Ignoring removal of untracked device {}", address);
            } else if ctx.handle.is_some() {
                info!("Device at address {} gone", address);
                ctx.pending.force_close();
            } else {
                info!("Device at address {} gone before it was opened", address);
                ctx.address = None;
                ctx.pending.complete(Action::Open);
                ctx.promote_waiting();
            }
        }
        other => {
            error!("Unexpected host event {:?}", other);
            fault.get_or_insert(other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ManualClock;
    use host::{MockDevice, MockHost};

    fn driver() -> ClassDriver<MockHost> {
        ClassDriver::new(MockHost::new(), DriverSettings::default())
            .unwrap()
            .with_clock(ManualClock::new())
    }

    #[test]
    fn test_registers_on_creation() {
        let driver = driver();
        assert_eq!(driver.host().client(), Some(driver.client()));
        assert!(driver.pending().is_empty());
    }

    #[test]
    fn test_new_device_raises_open() {
        let mut driver = driver();
        driver
            .host_mut()
            .attach(DeviceAddress(5), MockDevice::hid_keyboard());
        driver.process_events(Some(Duration::ZERO)).unwrap();

        assert_eq!(driver.device_address(), Some(DeviceAddress(5)));
        assert_eq!(driver.pending().to_vec(), vec![Action::Open]);
    }

    #[test]
    fn test_second_device_waits_its_turn() {
        let mut driver = driver();
        driver
            .host_mut()
            .attach(DeviceAddress(5), MockDevice::hid_keyboard());
        driver
            .host_mut()
            .attach(DeviceAddress(6), MockDevice::hid_keyboard());
        driver.process_events(Some(Duration::ZERO)).unwrap();

        assert_eq!(driver.device_address(), Some(DeviceAddress(5)));
        assert_eq!(driver.pending().to_vec(), vec![Action::Open]);
        assert_eq!(driver.ctx.waiting, Some(DeviceAddress(6)));
    }

    #[test]
    fn test_repeated_announcement_is_not_queued() {
        let mut driver = driver();
        driver
            .host_mut()
            .push_event(ClientEvent::NewDevice {
                address: DeviceAddress(5),
            });
        driver
            .host_mut()
            .push_event(ClientEvent::NewDevice {
                address: DeviceAddress(5),
            });
        driver.process_events(Some(Duration::ZERO)).unwrap();

        assert_eq!(driver.device_address(), Some(DeviceAddress(5)));
        assert_eq!(driver.ctx.waiting, None);
    }

    #[test]
    fn test_recorded_fault_stops_the_pump() {
        let mut driver = driver();
        let event = ClientEvent::NewDevice {
            address: DeviceAddress(7),
        };
        driver.fault = Some(event.clone());

        let err = driver.process_events(Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, DriverError::UnexpectedEvent(e) if e == event));
        assert!(driver.fault.is_none());
        assert!(driver.process_events(Some(Duration::ZERO)).is_ok());
    }

    #[test]
    fn test_gone_before_open_forgets_device() {
        let mut driver = driver();
        driver
            .host_mut()
            .attach(DeviceAddress(5), MockDevice::hid_keyboard());
        driver.host_mut().detach(DeviceAddress(5));
        driver.process_events(Some(Duration::ZERO)).unwrap();

        assert_eq!(driver.device_address(), None);
        assert!(driver.pending().is_empty());
    }

    #[test]
    fn test_dispatch_of_idle_action() {
        let mut driver = driver();
        assert_eq!(driver.dispatch(Action::Poll).unwrap(), Progress::Idle);
    }

    #[test]
    fn test_shutdown_without_device_exits() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut driver = driver().with_shutdown_flag(flag);
        assert_eq!(driver.step().unwrap(), LoopControl::Exit);
        assert!(driver.pending().is_empty());
    }

    #[test]
    fn test_shutdown_deregisters() {
        let driver = driver();
        let host = driver.shutdown().unwrap();
        assert_eq!(host.client(), None);
    }
}
