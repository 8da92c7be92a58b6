//! Common utilities for rust-usb-hid-host
//!
//! This crate provides functionality shared by the host controller backend,
//! the class driver and the binary: error handling, logging setup, the
//! channels that connect the USB threads to each other and to the Tokio
//! runtime, transfer rate limiting, and test helpers (behind the
//! `test-utils` feature).

pub mod channel;
pub mod error;
pub mod logging;
pub mod rate_limiter;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{
    CompletionReceiver, CompletionSender, DriverEvent, EventPublisher, EventSubscriber,
    ReadySignal, WaitError, completion_slot, create_event_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use rate_limiter::{Clock, IntervalLimiter, ManualClock, RateLimitResult, SystemClock};
