//! USB and HID wire types for rust-usb-hid-host
//!
//! This crate holds everything about the bytes on the bus that the host
//! controller abstraction and the class driver agree on: identifiers,
//! transfer statuses, setup packets, standard descriptors and the small set
//! of HID constants the driver needs.
//!
//! # Example
//!
//! ```
//! use protocol::{ConfigDescriptor, HID_CLASS};
//!
//! let bytes = [
//!     0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0xA0, 0x32,
//!     0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00,
//!     0x07, 0x05, 0x81, 0x03, 0x40, 0x00, 0x01,
//! ];
//! let config = ConfigDescriptor::parse(&bytes).unwrap();
//! let intf = config.interface(0, 0).unwrap();
//! assert_eq!(intf.class, HID_CLASS);
//!
//! let ep = config.endpoint_by_index(&intf, 0).unwrap();
//! assert!(ep.is_in());
//! ```

pub mod descriptors;
pub mod error;
pub mod hid;
pub mod setup;
pub mod types;

pub use descriptors::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
};
pub use error::{DescriptorError, Result};
pub use hid::{
    DESCRIPTOR_TYPE_HID_REPORT, HID_CLASS, MAX_REPORT_DESCRIPTOR_SIZE, ReportDescriptorKind,
    bit_dump, hex_dump,
};
pub use setup::{SETUP_PACKET_SIZE, SetupPacket, round_up_to_mps};
pub use types::{
    DeviceAddress, DeviceHandle, DeviceSpeed, Direction, EndpointType, TransferStatus,
};
