//! USB host type definitions
//!
//! Identifiers, speeds and transfer classifications shared by the host
//! controller abstraction and the class driver.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device address assigned by the host controller on attach
///
/// Address 0 is the default address used during bus enumeration and never
/// identifies a configured device, so "no device" is modelled as
/// `Option<DeviceAddress>` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(pub u8);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to an opened device
///
/// Only valid between a successful open and the matching close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub u32);

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl fmt::Display for DeviceSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceSpeed::Low => "Low",
            DeviceSpeed::Full => "Full",
            DeviceSpeed::High => "High",
            DeviceSpeed::Super => "Super",
            DeviceSpeed::SuperPlus => "SuperPlus",
        };
        f.write_str(name)
    }
}

/// Endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    /// Decode from an endpoint's bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Data direction of an endpoint or control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or bmRequestType
    pub fn from_bit7(value: u8) -> Self {
        if value & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Completion status reported by the host controller for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Not yet completed (freshly allocated or still in flight)
    Pending,
    /// Transfer completed successfully
    Completed,
    /// Bus or protocol error
    Error,
    /// Transfer timed out in the controller
    TimedOut,
    /// Transfer was cancelled by halt/flush
    Cancelled,
    /// Endpoint returned STALL
    Stall,
    /// Device sent more data than requested
    Overflow,
    /// Isochronous packet skipped
    Skipped,
    /// Device was disconnected
    NoDevice,
}

impl TransferStatus {
    /// Whether the transfer finished successfully
    pub fn is_completed(self) -> bool {
        self == TransferStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_type_from_attributes() {
        assert_eq!(EndpointType::from_attributes(0x00), EndpointType::Control);
        assert_eq!(
            EndpointType::from_attributes(0x01),
            EndpointType::Isochronous
        );
        assert_eq!(EndpointType::from_attributes(0x02), EndpointType::Bulk);
        assert_eq!(EndpointType::from_attributes(0x03), EndpointType::Interrupt);
        // Synchronisation/usage bits must not change the transfer type
        assert_eq!(EndpointType::from_attributes(0x0D), EndpointType::Isochronous);
    }

    #[test]
    fn test_direction_bit() {
        assert_eq!(Direction::from_bit7(0x81), Direction::In);
        assert_eq!(Direction::from_bit7(0x01), Direction::Out);
        assert_eq!(Direction::from_bit7(0x00), Direction::Out);
    }

    #[test]
    fn test_transfer_status_completed() {
        assert!(TransferStatus::Completed.is_completed());
        assert!(!TransferStatus::Pending.is_completed());
        assert!(!TransferStatus::Stall.is_completed());
    }

    #[test]
    fn test_device_address_display() {
        assert_eq!(DeviceAddress(5).to_string(), "5");
    }
}
