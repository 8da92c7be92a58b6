//! Descriptor error types

use thiserror::Error;

/// Errors raised while decoding USB descriptors and setup packets
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Buffer ended before the descriptor did
    #[error("Descriptor truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Descriptor type byte did not match what the caller asked for
    #[error("Unexpected descriptor type {found:#04x} (expected {expected:#04x})")]
    UnexpectedType { expected: u8, found: u8 },

    /// A descriptor header claims a length that cannot be walked
    #[error("Malformed descriptor at offset {offset}: bLength={length}")]
    Malformed { offset: usize, length: u8 },

    /// Interface/alternate setting pair is not present in the configuration
    #[error("Interface {number} (alt {alternate}) not found")]
    InterfaceNotFound { number: u8, alternate: u8 },

    /// Interface has fewer endpoints than the requested index
    #[error("Endpoint index {index} not found on interface {interface}")]
    EndpointNotFound { interface: u8, index: u8 },
}

/// Type alias for descriptor results
pub type Result<T> = std::result::Result<T, DescriptorError>;
