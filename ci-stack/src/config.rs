//! Daemon configuration file.
//!
//! Every field is optional; missing values fall back to the stack defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ci_protocol::{DEFAULT_LINK_BUFFER_SIZE, MIN_LINK_BUFFER_SIZE};
use serde::Deserialize;

use crate::ca_manager::CaManagerConfig;
use crate::resources::ApplicationConfig;
use crate::transport::TransportConfig;

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub ca: CaSection,
    #[serde(default)]
    pub datetime: DateTimeSection,
    #[serde(default, rename = "slot")]
    pub slots: Vec<SlotSection>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TransportSection {
    pub link_buffer_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
    pub max_poll_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CaSection {
    pub move_ca_descriptors: Option<bool>,
    pub resend_on_reply: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DateTimeSection {
    pub local_offset_minutes: Option<i16>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SlotSection {
    pub device: PathBuf,
    /// Slot number on the device, carried in the first byte of each frame.
    #[serde(default)]
    pub index: u8,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Transport settings with defaults filled in. The link buffer is
    /// clamped to the smallest size the link layer supports.
    pub fn transport_config(&self) -> TransportConfig {
        let defaults = TransportConfig::default();
        let t = &self.transport;
        TransportConfig {
            link_buffer_size: t
                .link_buffer_size
                .unwrap_or(DEFAULT_LINK_BUFFER_SIZE)
                .max(MIN_LINK_BUFFER_SIZE),
            poll_interval: t
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            response_timeout: t
                .response_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.response_timeout),
            max_poll_failures: t
                .max_poll_failures
                .unwrap_or(defaults.max_poll_failures)
                .max(1),
            max_tpdu_data: defaults.max_tpdu_data,
        }
    }

    pub fn application_config(&self) -> ApplicationConfig {
        let defaults = CaManagerConfig::default();
        ApplicationConfig {
            local_offset_minutes: self.datetime.local_offset_minutes,
            ca: CaManagerConfig {
                move_ca_descriptors: self
                    .ca
                    .move_ca_descriptors
                    .unwrap_or(defaults.move_ca_descriptors),
                resend_on_reply: self.ca.resend_on_reply.unwrap_or(defaults.resend_on_reply),
                capacity: defaults.capacity,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let transport = config.transport_config();
        assert_eq!(transport.link_buffer_size, DEFAULT_LINK_BUFFER_SIZE);
        assert_eq!(transport.poll_interval, Duration::from_millis(100));
        assert_eq!(transport.response_timeout, Duration::from_millis(300));
        assert_eq!(transport.max_poll_failures, 10);

        let app = config.application_config();
        assert_eq!(app.local_offset_minutes, None);
        assert!(!app.ca.move_ca_descriptors);
        assert!(app.ca.resend_on_reply);
        assert!(config.slots.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
            [logging]
            log_dir = "/var/log/ca"
            retention_days = 3
            level = "debug"

            [transport]
            link_buffer_size = 1024
            poll_interval_ms = 50
            response_timeout_ms = 500
            max_poll_failures = 4

            [ca]
            move_ca_descriptors = true
            resend_on_reply = false

            [datetime]
            local_offset_minutes = 540

            [[slot]]
            device = "/dev/dvb/adapter0/ca0"

            [[slot]]
            device = "/dev/dvb/adapter1/ca0"
            index = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.log_dir.as_deref(), Some("/var/log/ca"));
        assert_eq!(config.logging.retention_days, Some(3));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));

        let transport = config.transport_config();
        assert_eq!(transport.link_buffer_size, 1024);
        assert_eq!(transport.poll_interval, Duration::from_millis(50));
        assert_eq!(transport.response_timeout, Duration::from_millis(500));
        assert_eq!(transport.max_poll_failures, 4);

        let app = config.application_config();
        assert_eq!(app.local_offset_minutes, Some(540));
        assert!(app.ca.move_ca_descriptors);
        assert!(!app.ca.resend_on_reply);

        assert_eq!(config.slots.len(), 2);
        assert_eq!(config.slots[0].index, 0);
        assert_eq!(config.slots[1].device, PathBuf::from("/dev/dvb/adapter1/ca0"));
        assert_eq!(config.slots[1].index, 1);
    }

    #[test]
    fn test_link_buffer_clamped() {
        let config: Config = toml::from_str("[transport]\nlink_buffer_size = 4\n").unwrap();
        assert_eq!(config.transport_config().link_buffer_size, MIN_LINK_BUFFER_SIZE);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(toml::from_str::<Config>("[ca]\nresend_on_reply = \"yes\"\n").is_err());
    }
}
