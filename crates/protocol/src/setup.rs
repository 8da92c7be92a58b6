//! Control transfer setup packets

use crate::error::{DescriptorError, Result};
use crate::types::Direction;

/// Size of a setup packet on the wire
pub const SETUP_PACKET_SIZE: usize = 8;

/// bmRequestType: data stage is device to host
pub const REQUEST_TYPE_DIR_IN: u8 = 0x80;
/// bmRequestType: standard request
pub const REQUEST_TYPE_STANDARD: u8 = 0x00;
/// bmRequestType: class request
pub const REQUEST_TYPE_CLASS: u8 = 0x20;
/// bmRequestType: recipient is an interface
pub const REQUEST_TYPE_RECIPIENT_INTERFACE: u8 = 0x01;

/// bRequest: GET_DESCRIPTOR
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// Standard USB setup packet (USB 2.0 §9.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// GET_DESCRIPTOR for a class descriptor addressed to an interface
    ///
    /// `wValue` carries the descriptor type in the high byte and the
    /// descriptor index in the low byte.
    pub fn get_interface_descriptor(
        descriptor_type: u8,
        descriptor_index: u8,
        interface: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: REQUEST_TYPE_DIR_IN
                | REQUEST_TYPE_STANDARD
                | REQUEST_TYPE_RECIPIENT_INTERFACE,
            request: REQUEST_GET_DESCRIPTOR,
            value: (u16::from(descriptor_type) << 8) | u16::from(descriptor_index),
            index: interface,
            length,
        }
    }

    /// Direction of the data stage
    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.request_type)
    }

    /// Encode in little-endian wire order
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Decode from the first 8 bytes of a control transfer buffer
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETUP_PACKET_SIZE {
            return Err(DescriptorError::Truncated {
                needed: SETUP_PACKET_SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

/// Round `num_bytes` up to a whole number of packets of `mps` bytes
///
/// Returns 0 for a zero packet size, which callers treat as "no buffer".
pub fn round_up_to_mps(num_bytes: usize, mps: usize) -> usize {
    if mps == 0 {
        return 0;
    }
    num_bytes.div_ceil(mps) * mps
}
