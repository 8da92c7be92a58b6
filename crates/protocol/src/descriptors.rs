//! Standard USB descriptors
//!
//! Decoding for device, configuration, interface and endpoint descriptors,
//! plus the lookup helpers used while claiming interfaces: locate an
//! interface by number/alternate setting and an endpoint by its index inside
//! that interface.
//!
//! A [`ConfigDescriptor`] keeps the raw `wTotalLength` bytes it was parsed
//! from, so class-specific descriptors interleaved with the standard ones
//! (e.g. the HID descriptor) are skipped rather than rejected.

use crate::error::{DescriptorError, Result};
use crate::types::{Direction, EndpointType};
use serde::{Deserialize, Serialize};

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 9;
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 7;

fn check_header(bytes: &[u8], size: usize, descriptor_type: u8) -> Result<()> {
    if bytes.len() < size {
        return Err(DescriptorError::Truncated {
            needed: size,
            available: bytes.len(),
        });
    }
    if bytes[1] != descriptor_type {
        return Err(DescriptorError::UnexpectedType {
            expected: descriptor_type,
            found: bytes[1],
        });
    }
    Ok(())
}

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// bMaxPacketSize0, the control endpoint's packet size
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, DEVICE_DESCRIPTOR_SIZE, DESCRIPTOR_TYPE_DEVICE)?;
        Ok(Self {
            usb_version: le16(bytes, 2),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: le16(bytes, 8),
            product_id: le16(bytes, 10),
            device_version: le16(bytes, 12),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }
}

/// Interface descriptor, with its position inside the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
    /// Byte offset of this descriptor within the configuration
    #[serde(skip)]
    pub offset: usize,
}

impl InterfaceDescriptor {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self> {
        check_header(bytes, INTERFACE_DESCRIPTOR_SIZE, DESCRIPTOR_TYPE_INTERFACE)?;
        Ok(Self {
            number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            class: bytes[5],
            subclass: bytes[6],
            protocol: bytes[7],
            string_index: bytes[8],
            offset,
        })
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, direction in bit 7
    pub address: u8,
    /// bmAttributes
    pub attributes: u8,
    /// wMaxPacketSize as transmitted (may carry high-bandwidth bits)
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, ENDPOINT_DESCRIPTOR_SIZE, DESCRIPTOR_TYPE_ENDPOINT)?;
        Ok(Self {
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: le16(bytes, 4),
            interval: bytes[6],
        })
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.address)
    }

    pub fn is_in(&self) -> bool {
        self.direction() == Direction::In
    }

    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }

    /// Payload bytes per packet, without the additional-transaction bits
    pub fn packet_size(&self) -> usize {
        usize::from(self.max_packet_size & 0x07FF)
    }
}

/// Configuration descriptor together with everything it encloses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: u8,
    /// bMaxPower in 2 mA units
    pub max_power: u8,
    raw: Vec<u8>,
}

impl ConfigDescriptor {
    /// Parse a full configuration descriptor (header plus wTotalLength bytes)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, CONFIG_DESCRIPTOR_SIZE, DESCRIPTOR_TYPE_CONFIGURATION)?;
        let total_length = le16(bytes, 2);
        let total = usize::from(total_length);
        if total < CONFIG_DESCRIPTOR_SIZE || bytes.len() < total {
            return Err(DescriptorError::Truncated {
                needed: total.max(CONFIG_DESCRIPTOR_SIZE),
                available: bytes.len(),
            });
        }

        Ok(Self {
            total_length,
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            string_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
            raw: bytes[..total].to_vec(),
        })
    }

    /// Raw descriptor bytes (exactly wTotalLength long)
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Walk the descriptor chain, yielding `(offset, descriptor bytes)`
    fn walk(&self) -> impl Iterator<Item = Result<(usize, &[u8])>> + '_ {
        let mut offset = 0usize;
        let mut failed = false;
        std::iter::from_fn(move || {
            if failed || offset >= self.raw.len() {
                return None;
            }
            let length = self.raw[offset];
            let end = offset + usize::from(length);
            if length < 2 || end > self.raw.len() {
                failed = true;
                return Some(Err(DescriptorError::Malformed { offset, length }));
            }
            let item = (offset, &self.raw[offset..end]);
            offset = end;
            Some(Ok(item))
        })
    }

    /// All interface descriptors (every alternate setting) in order
    pub fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        let mut interfaces = Vec::new();
        for item in self.walk() {
            let (offset, bytes) = item?;
            if bytes[1] == DESCRIPTOR_TYPE_INTERFACE {
                interfaces.push(InterfaceDescriptor::parse(bytes, offset)?);
            }
        }
        Ok(interfaces)
    }

    /// Locate interface `number` with alternate setting `alternate`
    pub fn interface(&self, number: u8, alternate: u8) -> Result<InterfaceDescriptor> {
        self.interfaces()?
            .into_iter()
            .find(|intf| intf.number == number && intf.alternate_setting == alternate)
            .ok_or(DescriptorError::InterfaceNotFound { number, alternate })
    }

    /// Endpoint number `index` (0-based) belonging to `interface`
    ///
    /// Only descriptors between this interface descriptor and the next one
    /// are considered.
    pub fn endpoint_by_index(
        &self,
        interface: &InterfaceDescriptor,
        index: u8,
    ) -> Result<EndpointDescriptor> {
        let mut seen = 0u8;
        for item in self.walk() {
            let (offset, bytes) = item?;
            if offset <= interface.offset {
                continue;
            }
            match bytes[1] {
                DESCRIPTOR_TYPE_INTERFACE => break,
                DESCRIPTOR_TYPE_ENDPOINT => {
                    if seen == index {
                        return EndpointDescriptor::parse(bytes);
                    }
                    seen += 1;
                }
                _ => {}
            }
        }
        Err(DescriptorError::EndpointNotFound {
            interface: interface.number,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Keyboard-style configuration: one HID interface with a HID class
    // descriptor and a single interrupt IN endpoint.
    const KEYBOARD_CONFIG: [u8; 34] = [
        0x09, 0x02, 0x22, 0x00, 0x01, 0x01, 0x00, 0xA0, 0x32, // configuration
        0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, // interface 0
        0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3F, 0x00, // HID
        0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A, // endpoint 0x81
    ];

    #[test]
    fn test_parse_device_descriptor() {
        let bytes = [
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x6D, 0x04, 0x1C, 0xC5, 0x00, 0x01,
            0x01, 0x02, 0x00, 0x01,
        ];
        let desc = DeviceDescriptor::parse(&bytes).unwrap();
        assert_eq!(desc.vendor_id, 0x046D);
        assert_eq!(desc.product_id, 0xC51C);
        assert_eq!(desc.max_packet_size0, 64);
        assert_eq!(desc.serial_number_index, 0);
    }

    #[test]
    fn test_parse_device_descriptor_wrong_type() {
        let mut bytes = [0u8; 18];
        bytes[0] = 0x12;
        bytes[1] = 0x02;
        assert!(matches!(
            DeviceDescriptor::parse(&bytes),
            Err(DescriptorError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn test_config_interfaces_skip_class_descriptors() {
        let config = ConfigDescriptor::parse(&KEYBOARD_CONFIG).unwrap();
        assert_eq!(config.total_length, 34);
        let interfaces = config.interfaces().unwrap();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].class, 0x03);
        assert_eq!(interfaces[0].offset, 9);
    }

    #[test]
    fn test_endpoint_by_index() {
        let config = ConfigDescriptor::parse(&KEYBOARD_CONFIG).unwrap();
        let intf = config.interface(0, 0).unwrap();
        let ep = config.endpoint_by_index(&intf, 0).unwrap();
        assert_eq!(ep.address, 0x81);
        assert!(ep.is_in());
        assert_eq!(ep.transfer_type(), EndpointType::Interrupt);
        assert_eq!(ep.packet_size(), 8);

        assert_eq!(
            config.endpoint_by_index(&intf, 1),
            Err(DescriptorError::EndpointNotFound {
                interface: 0,
                index: 1
            })
        );
    }

    #[test]
    fn test_interface_not_found() {
        let config = ConfigDescriptor::parse(&KEYBOARD_CONFIG).unwrap();
        assert_eq!(
            config.interface(1, 0),
            Err(DescriptorError::InterfaceNotFound {
                number: 1,
                alternate: 0
            })
        );
    }

    #[test]
    fn test_config_truncated_total_length() {
        let err = ConfigDescriptor::parse(&KEYBOARD_CONFIG[..20]).unwrap_err();
        assert_eq!(
            err,
            DescriptorError::Truncated {
                needed: 34,
                available: 20
            }
        );
    }

    #[test]
    fn test_malformed_chain() {
        let mut bytes = KEYBOARD_CONFIG;
        // Zero-length descriptor in place of the HID descriptor
        bytes[18] = 0x00;
        let config = ConfigDescriptor::parse(&bytes).unwrap();
        assert_eq!(
            config.interfaces(),
            Err(DescriptorError::Malformed {
                offset: 18,
                length: 0
            })
        );
    }

    #[test]
    fn test_packet_size_masks_high_bandwidth_bits() {
        let ep = EndpointDescriptor {
            address: 0x81,
            attributes: 0x03,
            max_packet_size: 0x1400,
            interval: 1,
        };
        assert_eq!(ep.packet_size(), 0x400);
    }
}
