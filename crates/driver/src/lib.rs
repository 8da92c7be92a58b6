//! USB HID host class driver
//!
//! Enumerates an attached HID device through a [`host::HostController`],
//! fetches its report descriptor over the control endpoint and polls its
//! interrupt IN endpoint. The dispatch loop, transfer bridge and per-stage
//! state live here; the binary wires them to libusb.

pub mod action;
pub mod bridge;
pub mod config;
pub mod driver;
pub mod error;
pub mod stages;
pub mod task;

pub use action::{Action, PendingActions};
pub use bridge::{TransferAttempt, TransferBridge, TransferError};
pub use config::{DriverConfig, OnFailure};
pub use driver::{ClaimedInterface, ClassDriver, DriverSettings, LoopControl, Progress};
pub use error::{DriverError, Result};
pub use task::{class_driver_task, spawn_class_driver, supervise};
