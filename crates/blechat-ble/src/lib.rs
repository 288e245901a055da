//! Bluetooth Low Energy radio for blechat
//!
//! Implements the runtime's `RadioAdapter` on the host Bluetooth stack, so the
//! sessions in `blechat-runtime` can drive a real adapter.
//!
//! ## Architecture
//!
//! - [`config`] - Adapter selection and local device settings
//! - [`error`] - Error types specific to the BLE radio
//! - `central` - Scanner and GATT client links over btleplug
//! - `peripheral` - Advertiser and GATT server links over BlueZ
//! - [`BleRadio`] - The adapter handing out those links
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blechat_ble::{BleConfig, BleRadio};
//! use blechat_runtime::RuntimeBuilder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let radio = BleRadio::new(BleConfig::new().with_device_name("kitchen")).await?;
//! let environment = radio.environment().await;
//!
//! let mut runtime = RuntimeBuilder::new(radio)
//!     .with_environment(environment)
//!     .build_and_start()
//!     .await?;
//! runtime.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: all four roles; the peripheral side uses `bluer` and BlueZ
//! - **Other platforms**: scanner and GATT client only. Binding the advertiser
//!   or the GATT server fails, and the orchestrator reports that binding as
//!   failed.

mod adapter;
mod central;
pub mod config;
pub mod error;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod peripheral;
        pub use peripheral::{BlueZAdvertiserLink, BlueZServerLink};
    }
}

pub use adapter::BleRadio;
pub use central::{BleClientLink, BleScannerLink};
pub use config::BleConfig;
pub use error::{BleError, Result};
