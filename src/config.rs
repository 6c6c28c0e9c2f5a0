//! Driver configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `PCO_DAQ_`, nested keys split on `__`
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable configuration.
//!
//! # Example
//! ```no_run
//! use pco_daq::config::DriverConfig;
//!
//! let config = DriverConfig::load_from("config/pco.toml")?;
//! config.validate()?;
//! println!("Port: {}", config.driver.port_name);
//! # Ok::<(), pco_daq::error::DriverError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, DriverError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DriverConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub driver: QueueConfig,
    #[serde(default)]
    pub timing: TimerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Capacities of the queues and pools owned by one driver instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Name under which the driver is registered.
    #[serde(default = "default_port_name")]
    pub port_name: String,
    /// Number of hardware buffer slots handed to the SDK.
    #[serde(default = "default_hardware_buffers")]
    pub hardware_buffers: usize,
    /// Maximum number of image buffers outstanding at once (0 = unlimited).
    #[serde(default = "default_max_arrays")]
    pub max_arrays: usize,
    /// Capacity of the pending frame queue between hardware and state machine.
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
    /// Capacity of the state machine event queue.
    #[serde(default = "default_request_queue_capacity")]
    pub request_queue_capacity: usize,
}

/// Periods of the lifecycle timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerConfig {
    /// Delay before the first connection attempt.
    #[serde(with = "humantime_serde", default = "default_connect_period")]
    pub connect_period: Duration,
    /// Delay between failed connection attempts.
    #[serde(with = "humantime_serde", default = "default_reconnect_period")]
    pub reconnect_period: Duration,
    /// Delay after a reboot before reconnecting.
    #[serde(with = "humantime_serde", default = "default_reboot_period")]
    pub reboot_period: Duration,
    /// Status poll period while idle.
    #[serde(with = "humantime_serde", default = "default_status_poll_period")]
    pub status_poll_period: Duration,
    /// Status poll period while armed or acquiring.
    #[serde(with = "humantime_serde", default = "default_acquisition_poll_period")]
    pub acquisition_poll_period: Duration,
    /// Retry period for a software trigger the camera did not accept.
    #[serde(with = "humantime_serde", default = "default_trigger_retry_period")]
    pub trigger_retry_period: Duration,
}

fn default_name() -> String {
    "PCO camera driver".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port_name() -> String {
    "PCO1".to_string()
}

fn default_hardware_buffers() -> usize {
    4
}

fn default_max_arrays() -> usize {
    50
}

fn default_frame_queue_capacity() -> usize {
    50
}

fn default_request_queue_capacity() -> usize {
    32
}

fn default_connect_period() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_period() -> Duration {
    Duration::from_secs(5)
}

fn default_reboot_period() -> Duration {
    Duration::from_secs(10)
}

fn default_status_poll_period() -> Duration {
    Duration::from_secs(2)
}

fn default_acquisition_poll_period() -> Duration {
    Duration::from_secs(5)
}

fn default_trigger_retry_period() -> Duration {
    Duration::from_millis(10)
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            port_name: default_port_name(),
            hardware_buffers: default_hardware_buffers(),
            max_arrays: default_max_arrays(),
            frame_queue_capacity: default_frame_queue_capacity(),
            request_queue_capacity: default_request_queue_capacity(),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            connect_period: default_connect_period(),
            reconnect_period: default_reconnect_period(),
            reboot_period: default_reboot_period(),
            status_poll_period: default_status_poll_period(),
            acquisition_poll_period: default_acquisition_poll_period(),
            trigger_retry_period: default_trigger_retry_period(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a specific file path, then environment overrides.
    ///
    /// Example override: `PCO_DAQ_DRIVER__HARDWARE_BUFFERS=8`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path).extract().map_err(DriverError::from)
    }

    /// The layered provider, exposed so callers can merge extra sources.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(DriverConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PCO_DAQ_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DriverError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.driver.port_name.trim().is_empty() {
            return Err(DriverError::Configuration(
                "port_name must not be empty".to_string(),
            ));
        }
        if self.driver.hardware_buffers == 0 {
            return Err(DriverError::Configuration(
                "hardware_buffers must be at least 1".to_string(),
            ));
        }
        if self.driver.frame_queue_capacity == 0 {
            return Err(DriverError::Configuration(
                "frame_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.driver.request_queue_capacity == 0 {
            return Err(DriverError::Configuration(
                "request_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.timing.trigger_retry_period.is_zero() {
            return Err(DriverError::Configuration(
                "trigger_retry_period must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.driver.request_queue_capacity, 32);
        assert_eq!(config.timing.trigger_retry_period, Duration::from_millis(10));
        assert_eq!(config.timing.reboot_period, Duration::from_secs(10));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = DriverConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, DriverConfig::default());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[driver]
port_name = "PCO_EDGE"
hardware_buffers = 8

[timing]
reconnect_period = "15s"
trigger_retry_period = "25ms"
"#
        )
        .unwrap();

        let config = DriverConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.driver.port_name, "PCO_EDGE");
        assert_eq!(config.driver.hardware_buffers, 8);
        // untouched keys keep their defaults
        assert_eq!(config.driver.request_queue_capacity, 32);
        assert_eq!(config.timing.reconnect_period, Duration::from_secs(15));
        assert_eq!(config.timing.trigger_retry_period, Duration::from_millis(25));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = DriverConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.driver.hardware_buffers = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.driver.frame_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.timing.trigger_retry_period = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
