//! Error handling for the blechat CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] blechat_runtime::RuntimeError),

    #[error("BLE error: {0}")]
    Ble(#[from] blechat_ble::BleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML encoding error: {0}")]
    TomlEncoding(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<blechat_core::ConfigError> for CliError {
    fn from(err: blechat_core::ConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}
