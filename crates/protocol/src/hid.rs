//! HID class constants and report helpers
//!
//! Report contents are never interpreted here. The helpers only classify the
//! leading usage page of a report descriptor and render raw bytes for logs.

use std::fmt::Write;

/// HID interface class code (https://www.usb.org/defined-class-codes)
pub const HID_CLASS: u8 = 0x03;

/// Class descriptor type: HID descriptor
pub const DESCRIPTOR_TYPE_HID: u8 = 0x21;
/// Class descriptor type: report descriptor
pub const DESCRIPTOR_TYPE_HID_REPORT: u8 = 0x22;

/// Upper bound requested when fetching a report descriptor
pub const MAX_REPORT_DESCRIPTOR_SIZE: usize = 1024;

/// Number of leading report bytes rendered by [`bit_dump`] in the poll path
pub const REPORT_DUMP_BYTES: usize = 11;

// Usage Page (Generic Desktop), Usage (Game Pad)
const GAMEPAD_PREFIX: [u8; 4] = [0x05, 0x01, 0x09, 0x05];
// Usage Page (Vendor Defined 0xFF00), Usage (0x01)
const VENDOR_DEFINED_PREFIX: [u8; 5] = [0x06, 0x00, 0xFF, 0x09, 0x01];

/// Coarse classification of a report descriptor by its first items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDescriptorKind {
    Gamepad,
    VendorDefined,
    Unknown,
}

impl ReportDescriptorKind {
    pub fn classify(descriptor: &[u8]) -> Self {
        if descriptor.starts_with(&GAMEPAD_PREFIX) {
            ReportDescriptorKind::Gamepad
        } else if descriptor.starts_with(&VENDOR_DEFINED_PREFIX) {
            ReportDescriptorKind::VendorDefined
        } else {
            ReportDescriptorKind::Unknown
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReportDescriptorKind::Gamepad => "HID Gamepad",
            ReportDescriptorKind::VendorDefined => "Vendor Defined",
            ReportDescriptorKind::Unknown => "Unknown",
        }
    }
}

/// Space separated upper-case hex, e.g. `05 01 09 05`
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// MSB-first bit rendering of at most `max_bytes` bytes
pub fn bit_dump(data: &[u8], max_bytes: usize) -> String {
    data.iter()
        .take(max_bytes)
        .map(|byte| format!("{:08b}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}
