//! Descriptor parsing integration tests
//!
//! Exercises the configuration-descriptor lookups the class driver relies on
//! against composite devices, plus fuzz-style checks that arbitrary bytes
//! never panic the parser.
//!
//! Run with: `cargo test -p protocol --test descriptor_tests`

use proptest::prelude::*;
use protocol::{
    ConfigDescriptor, DescriptorError, DeviceDescriptor, EndpointType, HID_CLASS, SetupPacket,
};

/// Keyboard + vendor bulk interface + mouse, as seen on wireless receivers
fn composite_config() -> Vec<u8> {
    let mut bytes = vec![
        0x09, 0x02, 0x00, 0x00, 0x03, 0x01, 0x00, 0xA0, 0x32, // configuration
        // interface 0: HID keyboard, interrupt IN + interrupt OUT
        0x09, 0x04, 0x00, 0x00, 0x02, 0x03, 0x01, 0x01, 0x00, //
        0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x41, 0x00, //
        0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x08, //
        0x07, 0x05, 0x01, 0x03, 0x08, 0x00, 0x08, //
        // interface 1: vendor specific, bulk pair
        0x09, 0x04, 0x01, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00, //
        0x07, 0x05, 0x82, 0x02, 0x40, 0x00, 0x00, //
        0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00, //
        // interface 2: HID mouse, interrupt IN only
        0x09, 0x04, 0x02, 0x00, 0x01, 0x03, 0x01, 0x02, 0x00, //
        0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x34, 0x00, //
        0x07, 0x05, 0x83, 0x03, 0x04, 0x00, 0x02, //
    ];
    let total = bytes.len() as u16;
    bytes[2..4].copy_from_slice(&total.to_le_bytes());
    bytes
}

#[test]
fn test_composite_interface_classes() {
    let config = ConfigDescriptor::parse(&composite_config()).unwrap();
    assert_eq!(config.num_interfaces, 3);

    let hid: Vec<u8> = config
        .interfaces()
        .unwrap()
        .iter()
        .filter(|intf| intf.class == HID_CLASS)
        .map(|intf| intf.number)
        .collect();
    assert_eq!(hid, vec![0, 2]);
}

#[test]
fn test_endpoints_stay_within_their_interface() {
    let config = ConfigDescriptor::parse(&composite_config()).unwrap();

    let keyboard = config.interface(0, 0).unwrap();
    let ep_in = config.endpoint_by_index(&keyboard, 0).unwrap();
    let ep_out = config.endpoint_by_index(&keyboard, 1).unwrap();
    assert_eq!(ep_in.address, 0x81);
    assert_eq!(ep_out.address, 0x01);
    assert!(!ep_out.is_in());
    // Index 2 would be the vendor interface's first endpoint if the
    // lookup leaked across interface boundaries
    assert!(matches!(
        config.endpoint_by_index(&keyboard, 2),
        Err(DescriptorError::EndpointNotFound { .. })
    ));

    let vendor = config.interface(1, 0).unwrap();
    let bulk = config.endpoint_by_index(&vendor, 0).unwrap();
    assert_eq!(bulk.transfer_type(), EndpointType::Bulk);

    let mouse = config.interface(2, 0).unwrap();
    let ep = config.endpoint_by_index(&mouse, 0).unwrap();
    assert_eq!(ep.address, 0x83);
    assert_eq!(ep.packet_size(), 4);
}

#[test]
fn test_raw_bytes_trimmed_to_total_length() {
    let mut bytes = composite_config();
    let expected = bytes.len();
    bytes.extend_from_slice(&[0xAA; 16]);
    let config = ConfigDescriptor::parse(&bytes).unwrap();
    assert_eq!(config.as_bytes().len(), expected);
}

proptest! {
    #[test]
    fn prop_config_parser_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
        if let Ok(config) = ConfigDescriptor::parse(&bytes) {
            if let Ok(interfaces) = config.interfaces() {
                for intf in interfaces {
                    for index in 0..intf.num_endpoints {
                        let _ = config.endpoint_by_index(&intf, index);
                    }
                }
            }
        }
    }

    #[test]
    fn prop_device_parser_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
        let _ = DeviceDescriptor::parse(&bytes);
    }

    #[test]
    fn prop_setup_packet_bytes_roundtrip(
        request_type in any::<u8>(),
        request in any::<u8>(),
        value in any::<u16>(),
        index in any::<u16>(),
        length in any::<u16>(),
    ) {
        let setup = SetupPacket { request_type, request, value, index, length };
        prop_assert_eq!(SetupPacket::from_bytes(&setup.to_bytes()).unwrap(), setup);
    }
}
