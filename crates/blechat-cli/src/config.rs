//! blechat CLI configuration
//!
//! Loaded from TOML, in this order of preference:
//! - the file given with `--config`
//! - `<config dir>/blechat/config.toml`
//! - built-in defaults
//!
//! Command-line flags are applied on top by the caller.

use std::fs;
use std::path::{Path, PathBuf};

use blechat_ble::BleConfig;
use blechat_core::{
    protocol::{check_advertising_size, DEFAULT_ADVERTISING_PAYLOAD},
    session::{FilterMode, ScanMode},
    SessionConfig,
};
use blechat_runtime::ChatSettings;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the blechat CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Session timings and limits
    pub session: SessionConfig,
    /// Adapter selection and local device settings
    pub ble: BleConfig,
    pub chat: ChatConfig,
}

/// What this device advertises and how it scans
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Service data carried in the advertisement
    pub advertising_payload: String,
    pub filter_mode: FilterMode,
    pub scan_mode: ScanMode,
    /// Scan as soon as the scanner is up
    pub scan_on_start: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            advertising_payload: DEFAULT_ADVERTISING_PAYLOAD.to_string(),
            filter_mode: FilterMode::ServiceFiltered,
            scan_mode: ScanMode::Interval,
            scan_on_start: true,
        }
    }
}

impl ChatConfig {
    pub fn settings(&self) -> ChatSettings {
        ChatSettings {
            advertising_payload: self.advertising_payload.as_bytes().to_vec(),
            filter_mode: self.filter_mode,
            scan_mode: self.scan_mode,
            scan_on_bind: self.scan_on_start,
        }
    }
}

impl AppConfig {
    /// Load from `path`, or from the default location when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }
        match Self::default_config_path() {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => {
                info!("Using default configuration");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", path.display());
        let text = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/blechat/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("blechat").join("config.toml"))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        debug!("Configuration written to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if self.ble.device_name.is_empty() {
            return Err(CliError::Config("ble.device_name must not be empty".to_string()));
        }
        check_advertising_size(
            self.chat.advertising_payload.as_bytes(),
            self.ble.max_advertising_data_len,
        )
        .map_err(|e| CliError::Config(format!("chat.advertising_payload: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chat.settings(), ChatSettings::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [session]
            max_retries = 2
            connection_timeout = 5000

            [chat]
            scan_mode = "continuous"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.max_retries, 2);
        assert_eq!(config.session.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.session.scan_window, Duration::from_secs(5));
        assert_eq!(config.chat.scan_mode, ScanMode::Continuous);
        assert_eq!(config.chat.filter_mode, FilterMode::ServiceFiltered);
        assert_eq!(config.ble, BleConfig::default());
    }

    #[test]
    fn test_oversized_payload_is_invalid() {
        let mut config = AppConfig::default();
        config.chat.advertising_payload = "x".repeat(config.ble.max_advertising_data_len);
        assert!(matches!(config.validate(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.ble.device_name = "kitchen".to_string();
        config.chat.filter_mode = FilterMode::Unfiltered;
        config.save_to_file(&path).unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
