//! Host controller contract tests
//!
//! Drives [`MockHost`] only through the [`HostController`] trait, the way a
//! class driver does, and checks the listing format used by
//! `--list-devices --json`.
//!
//! Run with: `cargo test -p host --test mock_host_tests`

use common::completion_slot;
use common::test_utils::{ATTR_BULK, ATTR_INTERRUPT, ConfigBuilder, DEFAULT_TEST_TIMEOUT};
use host::{
    ClientConfig, ClientEvent, DeviceListing, HostController, HostError, MockCompletion,
    MockDevice, MockHost, Transfer,
};
use protocol::{
    DESCRIPTOR_TYPE_HID_REPORT, DeviceAddress, DeviceSpeed, SETUP_PACKET_SIZE, SetupPacket,
    TransferStatus,
};
use std::time::Duration;

fn pump<H: HostController>(host: &mut H, client: host::ClientHandle) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    host.handle_events(client, Some(Duration::ZERO), &mut |e| events.push(e))
        .expect("handle_events failed");
    events
}

// ============================================================================
// Client lifecycle
// ============================================================================

#[test]
fn test_single_client_registration() {
    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();

    let second = host.register_client(&ClientConfig::default());
    assert!(matches!(second, Err(HostError::ClientRegistered)));

    host.deregister_client(client).unwrap();
    assert!(host.register_client(&ClientConfig::default()).is_ok());
}

#[test]
fn test_events_bounded_per_pump() {
    let mut host = MockHost::new();
    let client = host
        .register_client(&ClientConfig {
            max_num_event_msg: 2,
        })
        .unwrap();

    for addr in 1..=3 {
        host.attach(DeviceAddress(addr), MockDevice::hid_keyboard());
    }

    assert_eq!(pump(&mut host, client).len(), 2);
    assert_eq!(
        pump(&mut host, client),
        vec![ClientEvent::NewDevice {
            address: DeviceAddress(3)
        }]
    );
    assert!(pump(&mut host, client).is_empty());
}

#[test]
fn test_calls_rejected_for_unknown_client() {
    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();
    host.deregister_client(client).unwrap();

    let result = host.device_open(client, DeviceAddress(1));
    assert!(matches!(result, Err(HostError::InvalidClient)));
}

// ============================================================================
// Device access
// ============================================================================

#[test]
fn test_open_describe_claim_release_close() {
    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();
    host.attach(DeviceAddress(4), MockDevice::hid_keyboard());

    let handle = host.device_open(client, DeviceAddress(4)).unwrap();
    let info = host.device_info(handle).unwrap();
    assert_eq!(info.address, DeviceAddress(4));
    assert_eq!(info.speed, DeviceSpeed::Full);

    let desc = host.device_descriptor(handle).unwrap();
    assert_eq!((desc.vendor_id, desc.product_id), (0x1234, 0x5678));

    let config = host.active_config_descriptor(handle).unwrap();
    assert_eq!(config.num_interfaces, 1);

    host.interface_claim(client, handle, 0, 0).unwrap();
    assert_eq!(host.claimed(handle), vec![0]);
    assert!(host.interface_claim(client, handle, 0, 0).is_err());

    host.interface_release(client, handle, 0).unwrap();
    assert!(matches!(
        host.interface_release(client, handle, 0),
        Err(HostError::InterfaceNotClaimed(0))
    ));

    host.device_close(client, handle).unwrap();
    assert!(!host.is_open(handle));
    assert!(matches!(
        host.device_close(client, handle),
        Err(HostError::InvalidHandle(_))
    ));
}

#[test]
fn test_open_missing_device() {
    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();

    assert!(matches!(
        host.device_open(client, DeviceAddress(9)),
        Err(HostError::DeviceNotFound(DeviceAddress(9)))
    ));
}

#[test]
fn test_claim_nonexistent_interface_fails() {
    let config = ConfigBuilder::new()
        .hid_interface(0)
        .endpoint(0x81, ATTR_INTERRUPT, 8, 10)
        .interface(1, 0xFF)
        .endpoint(0x02, ATTR_BULK, 64, 0)
        .build();

    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();
    host.attach(DeviceAddress(1), MockDevice::new(0xAAAA, 0xBBBB, config));
    let handle = host.device_open(client, DeviceAddress(1)).unwrap();

    assert!(host.interface_claim(client, handle, 1, 0).is_ok());
    assert!(host.interface_claim(client, handle, 2, 0).is_err());
}

// ============================================================================
// Transfers
// ============================================================================

#[test]
fn test_control_transfer_completes_during_pump() {
    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();
    let report = vec![0x06, 0x00, 0xFF, 0x09, 0x01];
    host.attach(
        DeviceAddress(2),
        MockDevice::hid_keyboard().with_report_descriptor(report.clone()),
    );
    let handle = host.device_open(client, DeviceAddress(2)).unwrap();

    let (tx, rx) = completion_slot();
    let mut transfer = host.transfer_alloc(64).unwrap();
    let setup = SetupPacket::get_interface_descriptor(DESCRIPTOR_TYPE_HID_REPORT, 0, 0, 56);
    transfer.buffer[..SETUP_PACKET_SIZE].copy_from_slice(&setup.to_bytes());
    transfer.device = Some(handle);
    transfer.endpoint = 0;
    transfer.num_bytes = 64;
    transfer.callback = Some(tx);

    host.transfer_submit_control(client, transfer).unwrap();
    assert!(rx.try_take().is_none());

    pump(&mut host, client);
    let done = rx.wait(DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(&done.data()[SETUP_PACKET_SIZE..], report.as_slice());
}

#[test]
fn test_interrupt_transfer_follows_script() {
    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();
    host.attach(DeviceAddress(1), MockDevice::hid_keyboard());
    host.script_interrupt(MockCompletion::Status(TransferStatus::TimedOut));
    host.script_interrupt(MockCompletion::Data(vec![0x00, 0x04]));
    let handle = host.device_open(client, DeviceAddress(1)).unwrap();
    host.interface_claim(client, handle, 0, 0).unwrap();

    let (tx, rx) = completion_slot();
    let submit = |host: &mut MockHost| {
        let mut transfer = Transfer::new(8);
        transfer.device = Some(handle);
        transfer.endpoint = 0x81;
        transfer.callback = Some(tx.clone());
        host.transfer_submit(transfer).unwrap();
    };

    submit(&mut host);
    pump(&mut host, client);
    assert_eq!(rx.try_take().unwrap().status, TransferStatus::TimedOut);

    submit(&mut host);
    pump(&mut host, client);
    let done = rx.try_take().unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.data(), &[0x00, 0x04]);
    assert_eq!(host.submissions(0x81), 2);
}

#[test]
fn test_transfer_on_unplugged_device_reports_no_device() {
    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();
    host.attach(DeviceAddress(1), MockDevice::hid_keyboard());
    let handle = host.device_open(client, DeviceAddress(1)).unwrap();

    let (tx, rx) = completion_slot();
    let mut transfer = Transfer::new(8);
    transfer.device = Some(handle);
    transfer.endpoint = 0x81;
    transfer.callback = Some(tx);
    host.transfer_submit(transfer).unwrap();

    host.detach(DeviceAddress(1));
    let events = pump(&mut host, client);
    assert!(events.contains(&ClientEvent::DeviceGone {
        address: DeviceAddress(1)
    }));
    assert_eq!(rx.try_take().unwrap().status, TransferStatus::NoDevice);
}

#[test]
fn test_rejected_submission_returns_transfer() {
    let mut host = MockHost::new();
    let client = host.register_client(&ClientConfig::default()).unwrap();
    host.attach(DeviceAddress(1), MockDevice::hid_keyboard());
    let handle = host.device_open(client, DeviceAddress(1)).unwrap();

    let mut transfer = Transfer::new(8);
    transfer.device = Some(handle);
    transfer.endpoint = 0x81;
    transfer.context = 42;

    let rejected = host.transfer_submit(transfer).unwrap_err();
    assert!(matches!(rejected.error, HostError::InvalidArgument(_)));
    assert_eq!(rejected.transfer.context, 42);
}

// ============================================================================
// Device listing
// ============================================================================

#[test]
fn test_device_listing_json_shape() {
    let listing = DeviceListing {
        bus: 1,
        address: 7,
        vendor_id: 0x046d,
        product_id: 0xc216,
        speed: DeviceSpeed::Full,
        manufacturer: Some("Logitech".to_string()),
        product: None,
        hid_interfaces: vec![0],
        allowed: true,
    };

    let json: serde_json::Value = serde_json::to_value(&listing).unwrap();
    assert_eq!(json["bus"], 1);
    assert_eq!(json["vendor_id"], 0x046d);
    assert_eq!(json["manufacturer"], "Logitech");
    assert!(json["product"].is_null());
    assert_eq!(json["hid_interfaces"], serde_json::json!([0]));
    assert_eq!(json["allowed"], true);
}
