//! Driver configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::DriverSettings;

/// Smallest accepted report descriptor request (one 8-byte setup packet plus data)
const MIN_REPORT_DESCRIPTOR_MAX: usize = 16;
/// wLength is 16 bits and the setup packet shares the buffer
const MAX_REPORT_DESCRIPTOR_MAX: usize = u16::MAX as usize;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: GeneralSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub log_level: String,
    /// Exit once the device is closed; otherwise wait for the next one
    pub exit_on_detach: bool,
    /// Host events delivered per pump
    pub max_event_messages: usize,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            exit_on_detach: true,
            max_event_messages: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID allow-list, e.g. "0x1234:0x5678" or "0x1234:*" (empty = any)
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Transfer timing, all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Minimum spacing between attempts of the same transfer
    pub min_interval_ms: u64,
    pub acquire_timeout_ms: u64,
    pub pump_timeout_ms: u64,
    pub control_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    /// Report descriptor request size before rounding to bMaxPacketSize0
    pub report_descriptor_max: usize,
    /// Give a transfer stage up after this many consecutive failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: 8,
            acquire_timeout_ms: 100,
            pump_timeout_ms: 10,
            control_timeout_ms: 1000,
            poll_timeout_ms: 1000,
            report_descriptor_max: protocol::MAX_REPORT_DESCRIPTOR_SIZE,
            max_retries: None,
        }
    }
}

/// What the task does when the driver fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Tear down and return the error
    #[default]
    Terminate,
    /// Tear down and enumerate the device again
    Restart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub on_failure: OnFailure,
    pub max_restarts: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            on_failure: OnFailure::Terminate,
            max_restarts: 3,
        }
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/rust-usb-hid-host/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rust-usb-hid-host").join("driver.toml")
        } else {
            PathBuf::from(".config/rust-usb-hid-host/driver.toml")
        }
    }

    /// Runtime parameters for [`crate::driver::ClassDriver`]
    pub fn driver_settings(&self) -> DriverSettings {
        let t = &self.transfer;
        DriverSettings {
            min_transfer_interval: Duration::from_millis(t.min_interval_ms),
            acquire_timeout: Duration::from_millis(t.acquire_timeout_ms),
            pump_timeout: Duration::from_millis(t.pump_timeout_ms),
            control_timeout: Duration::from_millis(t.control_timeout_ms),
            poll_timeout: Duration::from_millis(t.poll_timeout_ms),
            report_descriptor_max: t.report_descriptor_max,
            max_retries: t.max_retries,
            exit_on_detach: self.driver.exit_on_detach,
            max_event_messages: self.driver.max_event_messages,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.driver.max_event_messages == 0 {
            return Err(anyhow!("max_event_messages must be at least 1"));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        let t = &self.transfer;
        for (name, value) in [
            ("acquire_timeout_ms", t.acquire_timeout_ms),
            ("pump_timeout_ms", t.pump_timeout_ms),
            ("control_timeout_ms", t.control_timeout_ms),
            ("poll_timeout_ms", t.poll_timeout_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }

        if !(MIN_REPORT_DESCRIPTOR_MAX..=MAX_REPORT_DESCRIPTOR_MAX).contains(&t.report_descriptor_max)
        {
            return Err(anyhow!(
                "report_descriptor_max {} out of range {}..={}",
                t.report_descriptor_max,
                MIN_REPORT_DESCRIPTOR_MAX,
                MAX_REPORT_DESCRIPTOR_MAX
            ));
        }

        if t.max_retries == Some(0) {
            return Err(anyhow!("max_retries must be at least 1 when set"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        let Some((vid, pid)) = filter.split_once(':') else {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        };
        if pid.contains(':') {
            return Err(anyhow!(
                "Invalid filter format '{}', expected exactly one ':'",
                filter
            ));
        }

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Expand `~` in a user supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.driver.log_level, "info");
        assert!(config.driver.exit_on_detach);
        assert!(config.usb.filters.is_empty());
        assert_eq!(config.transfer.min_interval_ms, 8);
        assert_eq!(config.supervisor.on_failure, OnFailure::Terminate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(DriverConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(DriverConfig::validate_filter("0x1234:*").is_ok());
        assert!(DriverConfig::validate_filter("*:0x5678").is_ok());
        assert!(DriverConfig::validate_filter("*:*").is_ok());
        assert!(DriverConfig::validate_filter("0xABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(DriverConfig::validate_filter("1234:5678").is_err());
        assert!(DriverConfig::validate_filter("0x1234").is_err());
        assert!(DriverConfig::validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(DriverConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(DriverConfig::validate_filter("0x12345:0x5678").is_err());
        assert!(DriverConfig::validate_filter("0x:0x5678").is_err());
    }

    #[test]
    fn test_driver_settings_conversion() {
        let mut config = DriverConfig::default();
        config.transfer.min_interval_ms = 16;
        config.transfer.max_retries = Some(4);
        config.driver.exit_on_detach = false;

        let settings = config.driver_settings();
        assert_eq!(settings.min_transfer_interval, Duration::from_millis(16));
        assert_eq!(settings.control_timeout, Duration::from_millis(1000));
        assert_eq!(settings.max_retries, Some(4));
        assert!(!settings.exit_on_detach);
        assert_eq!(settings.report_descriptor_max, 1024);
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let mut config = DriverConfig::default();
        config.transfer.pump_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.transfer.report_descriptor_max = 4;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.transfer.max_retries = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_path_without_tilde() {
        assert_eq!(expand_path("/tmp/driver.toml"), PathBuf::from("/tmp/driver.toml"));
    }
}
