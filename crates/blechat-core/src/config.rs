//! Session timings and limits

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::protocol::{MAX_MESSAGE_BYTES, REQUEST_MTU};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Timings and limits shared by all sessions
///
/// Durations are (de)serialized as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long the client waits for a connected/disconnected callback
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Pause before a reconnect attempt
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
    /// Delay between service discovery and the handshake write
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,
    /// Consecutive reconnects allowed before giving up
    pub max_retries: u32,
    pub request_mtu: u16,
    pub max_message_bytes: usize,
    /// Length of an interval-mode scan
    #[serde(with = "duration_ms")]
    pub scan_window: Duration,
    pub rssi_filter_enabled: bool,
    /// Peers weaker than this are not surfaced while the filter is on
    pub rssi_threshold: i16,
    /// Settle time between a session's destroyed signal and rebinding it
    #[serde(with = "duration_ms")]
    pub rebind_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(20),
            retry_backoff: Duration::from_secs(2),
            settle_delay: Duration::from_secs(2),
            max_retries: 5,
            request_mtu: REQUEST_MTU,
            max_message_bytes: MAX_MESSAGE_BYTES,
            scan_window: Duration::from_secs(5),
            rssi_filter_enabled: true,
            rssi_threshold: -60,
            rebind_delay: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    /// Enable or disable the RSSI filter
    pub fn with_rssi_filter(mut self, enabled: bool) -> Self {
        self.rssi_filter_enabled = enabled;
        self
    }

    pub fn with_rssi_threshold(mut self, threshold: i16) -> Self {
        self.rssi_threshold = threshold;
        self
    }

    pub fn with_rebind_delay(mut self, delay: Duration) -> Self {
        self.rebind_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "connection_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.scan_window.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "scan_window",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_message_bytes == 0 || self.max_message_bytes > MAX_MESSAGE_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "max_message_bytes",
                reason: format!("must be between 1 and {}", MAX_MESSAGE_BYTES),
            });
        }
        // 23 is the ATT minimum, 517 the largest MTU any stack will grant
        if !(23..=517).contains(&self.request_mtu) {
            return Err(ConfigError::InvalidValue {
                field: "request_mtu",
                reason: "must be between 23 and 517".to_string(),
            });
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol() {
        let config = SessionConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(20));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.request_mtu, 512);
        assert_eq!(config.max_message_bytes, 300);
        assert_eq!(config.rssi_threshold, -60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = SessionConfig::new().with_settle_delay(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["settle_delay"], 1500);
        assert_eq!(json["connection_timeout"], 20_000);
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"max_retries": 2}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.scan_window, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_oversized_message_limit() {
        let config = SessionConfig {
            max_message_bytes: 301,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "max_message_bytes",
                ..
            })
        ));
    }
}
