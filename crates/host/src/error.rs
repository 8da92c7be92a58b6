//! Host controller error types

use protocol::{DescriptorError, DeviceAddress, DeviceHandle};
use thiserror::Error;

/// Errors reported by a [`crate::HostController`]
#[derive(Debug, Error)]
pub enum HostError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("No device at address {0}")]
    DeviceNotFound(DeviceAddress),

    #[error("Device handle {0:?} is not open")]
    InvalidHandle(DeviceHandle),

    #[error("Client is not registered")]
    InvalidClient,

    #[error("Client already registered")]
    ClientRegistered,

    #[error("Endpoint {0:#04x} is halted")]
    EndpointHalted(u8),

    #[error("Interface {0} is not claimed")]
    InterfaceNotClaimed(u8),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Host library is not installed")]
    NotInstalled,
}

impl HostError {
    /// Whether the error means the device went away underneath us
    pub fn is_no_device(&self) -> bool {
        matches!(self, HostError::Usb(rusb::Error::NoDevice))
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
