//! USB host controller abstraction for rust-usb-hid-host
//!
//! Class drivers are written against [`HostController`]. Two
//! implementations live here:
//!
//! - [`RusbHost`]: libusb through `rusb`, with hot-plug notifications and
//!   kernel driver detach around interface claims
//! - `MockHost`: a scripted controller for tests, behind the `test-utils`
//!   feature
//!
//! [`daemon`] holds the host daemon thread that installs the library and
//! keeps it alive while clients are registered.

pub mod controller;
pub mod daemon;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod rusb_host;

pub use controller::{
    ClientConfig, ClientEvent, ClientHandle, DeviceInfo, HostController, SubmitError, Transfer,
};
pub use daemon::{host_daemon_task, spawn_host_daemon};
pub use error::{HostError, Result};
#[cfg(any(test, feature = "test-utils"))]
pub use mock::{HostCall, MockCompletion, MockDevice, MockHost, MockOp};
pub use rusb_host::{DeviceListing, LibraryEvent, RusbHost, RusbLibrary, check_filter};
