//! Test utilities for rust-usb-hid-host
//!
//! Builders for raw descriptor bytes and helpers shared by the tests of
//! every crate in the workspace.
//!
//! # Example
//!
//! ```
//! use common::test_utils::ConfigBuilder;
//! use protocol::ConfigDescriptor;
//!
//! let bytes = ConfigBuilder::new()
//!     .hid_interface(0)
//!     .endpoint(0x81, 0x03, 8, 10)
//!     .build();
//! let config = ConfigDescriptor::parse(&bytes).unwrap();
//! assert_eq!(config.num_interfaces, 1);
//! ```

use protocol::{DeviceDescriptor, HID_CLASS};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint attributes for an interrupt endpoint
pub const ATTR_INTERRUPT: u8 = 0x03;
/// Endpoint attributes for a bulk endpoint
pub const ATTR_BULK: u8 = 0x02;

/// Create raw device descriptor bytes
///
/// String indices are 1 (manufacturer), 2 (product) and 3 (serial).
pub fn device_descriptor_bytes(vendor_id: u16, product_id: u16, max_packet_size0: u8) -> [u8; 18] {
    let vid = vendor_id.to_le_bytes();
    let pid = product_id.to_le_bytes();
    [
        0x12,
        0x01,
        0x00,
        0x02,
        0x00,
        0x00,
        0x00,
        max_packet_size0,
        vid[0],
        vid[1],
        pid[0],
        pid[1],
        0x00,
        0x01,
        0x01,
        0x02,
        0x03,
        0x01,
    ]
}

/// Create a parsed mock device descriptor
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_descriptor;
///
/// let desc = create_mock_device_descriptor(0x046d, 0xc52b, 64);
/// assert_eq!(desc.max_packet_size0, 64);
/// ```
pub fn create_mock_device_descriptor(
    vendor_id: u16,
    product_id: u16,
    max_packet_size0: u8,
) -> DeviceDescriptor {
    DeviceDescriptor::parse(&device_descriptor_bytes(
        vendor_id,
        product_id,
        max_packet_size0,
    ))
    .expect("builder produces a valid device descriptor")
}

/// Builder for raw configuration descriptors
///
/// Interfaces and endpoints are appended in call order; `endpoint` always
/// belongs to the most recently added interface. Header fields
/// (wTotalLength, bNumInterfaces, bNumEndpoints) are filled in by `build`.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    interfaces: Vec<InterfaceSpec>,
}

#[derive(Debug, Clone)]
struct InterfaceSpec {
    number: u8,
    alternate: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
    endpoints: Vec<[u8; 7]>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interface with an arbitrary class code
    pub fn interface(mut self, number: u8, class: u8) -> Self {
        self.interfaces.push(InterfaceSpec {
            number,
            alternate: 0,
            class,
            subclass: 0,
            protocol: 0,
            endpoints: Vec::new(),
        });
        self
    }

    /// Add a HID interface (a HID class descriptor is emitted after it)
    pub fn hid_interface(self, number: u8) -> Self {
        self.interface(number, HID_CLASS)
    }

    /// Add an endpoint to the last interface
    pub fn endpoint(mut self, address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Self {
        let mps = max_packet_size.to_le_bytes();
        if let Some(intf) = self.interfaces.last_mut() {
            intf.endpoints
                .push([0x07, 0x05, address, attributes, mps[0], mps[1], interval]);
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = vec![0x09, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0xA0, 0x32];

        let mut numbers: Vec<u8> = self.interfaces.iter().map(|i| i.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        bytes[4] = numbers.len() as u8;

        for intf in &self.interfaces {
            bytes.extend_from_slice(&[
                0x09,
                0x04,
                intf.number,
                intf.alternate,
                intf.endpoints.len() as u8,
                intf.class,
                intf.subclass,
                intf.protocol,
                0x00,
            ]);
            if intf.class == HID_CLASS {
                bytes.extend_from_slice(&[0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3F, 0x00]);
            }
            for endpoint in &intf.endpoints {
                bytes.extend_from_slice(endpoint);
            }
        }

        let total = (bytes.len() as u16).to_le_bytes();
        bytes[2] = total[0];
        bytes[3] = total[1];
        bytes
    }
}

/// Single HID interface with one interrupt IN endpoint (0x81, 8 bytes)
pub fn hid_keyboard_config() -> Vec<u8> {
    ConfigBuilder::new()
        .hid_interface(0)
        .endpoint(0x81, ATTR_INTERRUPT, 8, 10)
        .build()
}

/// Report descriptor beginning with Usage Page (Generic Desktop), Usage (Game Pad)
pub fn gamepad_report_descriptor() -> Vec<u8> {
    vec![
        0x05, 0x01, 0x09, 0x05, 0xA1, 0x01, 0x15, 0x00, 0x25, 0x01, 0x35, 0x00, 0x45, 0x01, 0x75,
        0x01, 0x95, 0x0E, 0x05, 0x09, 0x19, 0x01, 0x29, 0x0E, 0x81, 0x02, 0xC0,
    ]
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ConfigDescriptor, EndpointType};

    #[test]
    fn test_builder_header_fields() {
        let bytes = ConfigBuilder::new()
            .hid_interface(0)
            .endpoint(0x81, ATTR_INTERRUPT, 8, 10)
            .endpoint(0x01, ATTR_INTERRUPT, 8, 10)
            .interface(1, 0xFF)
            .endpoint(0x82, ATTR_BULK, 64, 0)
            .build();

        let config = ConfigDescriptor::parse(&bytes).unwrap();
        assert_eq!(usize::from(config.total_length), bytes.len());
        assert_eq!(config.num_interfaces, 2);

        let intf = config.interface(0, 0).unwrap();
        assert_eq!(intf.num_endpoints, 2);
        let vendor = config.interface(1, 0).unwrap();
        let ep = config.endpoint_by_index(&vendor, 0).unwrap();
        assert_eq!(ep.transfer_type(), EndpointType::Bulk);
    }

    #[test]
    fn test_keyboard_config() {
        let config = ConfigDescriptor::parse(&hid_keyboard_config()).unwrap();
        let intf = config.interface(0, 0).unwrap();
        assert_eq!(intf.class, HID_CLASS);
    }

    #[test]
    fn test_mock_device_descriptor() {
        let desc = create_mock_device_descriptor(0x1234, 0x5678, 8);
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id, 0x5678);
        assert_eq!(desc.max_packet_size0, 8);
    }
}
