//! Per-device state of the transfer handlers
//!
//! Both transfer actions are retried from the dispatch loop. Their state
//! (rate limiter, reusable transfer buffer, failure count) lives here and is
//! reset when the device is closed.

use common::{IntervalLimiter, RateLimitResult};
use host::Transfer;
use std::time::{Duration, Instant};

/// Rate limiting, buffer reuse and retry accounting for one transfer action
#[derive(Debug)]
pub struct TransferStage {
    limiter: IntervalLimiter,
    transfer: Option<Transfer>,
    failures: u32,
    max_retries: Option<u32>,
}

impl TransferStage {
    pub fn new(min_interval: Duration, max_retries: Option<u32>) -> Self {
        Self {
            limiter: IntervalLimiter::new(min_interval),
            transfer: None,
            failures: 0,
            max_retries,
        }
    }

    pub fn check(&self, now: Instant) -> RateLimitResult {
        self.limiter.check(now)
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.limiter.record(now);
    }

    /// Take the cached transfer for the next attempt
    pub fn take_transfer(&mut self) -> Option<Transfer> {
        self.transfer.take()
    }

    /// Keep a transfer that came back for reuse
    pub fn store_transfer(&mut self, transfer: Transfer) {
        self.transfer = Some(transfer);
    }

    pub fn has_transfer(&self) -> bool {
        self.transfer.is_some()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Count a failed attempt; true once the retry cap is reached
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.max_retries.is_some_and(|max| self.failures >= max)
    }

    pub fn reset(&mut self) {
        self.limiter.reset();
        self.transfer = None;
        self.failures = 0;
    }
}

/// HID report descriptor fetch over endpoint 0
#[derive(Debug)]
pub struct ControlStage {
    pub transfer: TransferStage,
    report_descriptor: Option<Vec<u8>>,
}

impl ControlStage {
    pub fn new(min_interval: Duration, max_retries: Option<u32>) -> Self {
        Self {
            transfer: TransferStage::new(min_interval, max_retries),
            report_descriptor: None,
        }
    }

    pub fn report_descriptor(&self) -> Option<&[u8]> {
        self.report_descriptor.as_deref()
    }

    pub fn set_report_descriptor(&mut self, descriptor: Vec<u8>) {
        self.report_descriptor = Some(descriptor);
    }

    pub fn reset(&mut self) {
        self.transfer.reset();
        self.report_descriptor = None;
    }
}

/// Interrupt IN polling
#[derive(Debug)]
pub struct PollStage {
    pub transfer: TransferStage,
    reports: u64,
}

impl PollStage {
    pub fn new(min_interval: Duration, max_retries: Option<u32>) -> Self {
        Self {
            transfer: TransferStage::new(min_interval, max_retries),
            reports: 0,
        }
    }

    /// Non-empty reports received from the current device
    pub fn reports(&self) -> u64 {
        self.reports
    }

    pub fn record_report(&mut self) {
        self.reports += 1;
    }

    pub fn reset(&mut self) {
        self.transfer.reset();
        self.reports = 0;
    }
}
