//! [`RadioAdapter`] over the host's Bluetooth stack

use async_trait::async_trait;
use blechat_core::orchestrator::{Capabilities, Environment};
use blechat_runtime::{
    AdvertiserLink, GattClientLink, GattServerLink, RadioAdapter, RadioError, ScannerLink,
};
#[cfg(not(target_os = "linux"))]
use blechat_core::ServiceKind;
use btleplug::api::{Central, Manager as _};
use btleplug::platform::{Adapter, Manager};
use tracing::{info, warn};

use crate::central::{BleClientLink, BleScannerLink};
use crate::config::BleConfig;
use crate::error::{BleError, Result};

/// The host adapter: btleplug for the central role and, on Linux, BlueZ for
/// the peripheral role
pub struct BleRadio {
    config: BleConfig,
    central: Adapter,
    #[cfg(target_os = "linux")]
    bluez: bluer::Adapter,
}

impl BleRadio {
    /// Open the adapter selected by `config`
    pub async fn new(config: BleConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let available = adapters.len();
        let central = adapters
            .into_iter()
            .nth(config.adapter_index)
            .ok_or(BleError::AdapterNotFound {
                index: config.adapter_index,
                available,
            })?;
        match central.adapter_info().await {
            Ok(info) => info!("BLE adapter initialized: {}", info),
            Err(err) => warn!("BLE adapter initialized without info: {}", err),
        }

        #[cfg(target_os = "linux")]
        let bluez = open_bluez(&config).await?;

        Ok(Self {
            config,
            central,
            #[cfg(target_os = "linux")]
            bluez,
        })
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    /// Radio state as the orchestrator needs it at startup
    ///
    /// Desktop hosts have no location or permission gate, so only the radio
    /// power is checked, and only where BlueZ can report it.
    pub async fn environment(&self) -> Environment {
        #[cfg(target_os = "linux")]
        let radio_enabled = match self.bluez.is_powered().await {
            Ok(powered) => powered,
            Err(err) => {
                warn!("Could not read adapter power state: {}", err);
                false
            }
        };
        #[cfg(not(target_os = "linux"))]
        let radio_enabled = true;

        Environment {
            radio_enabled,
            ..Environment::ready()
        }
    }
}

#[cfg(target_os = "linux")]
async fn open_bluez(config: &BleConfig) -> Result<bluer::Adapter> {
    let session = bluer::Session::new().await?;
    let names = session.adapter_names().await?;
    let name = names
        .get(config.adapter_index)
        .ok_or(BleError::AdapterNotFound {
            index: config.adapter_index,
            available: names.len(),
        })?;
    let adapter = session.adapter(name)?;
    if config.power_on && !adapter.is_powered().await? {
        info!("Powering on {}", name);
        adapter.set_powered(true).await?;
    }
    Ok(adapter)
}

#[async_trait]
impl RadioAdapter for BleRadio {
    /// The host stacks do not report controller features; BlueZ and the
    /// platform drivers fall back to software where the controller lacks them.
    async fn capabilities(&self) -> std::result::Result<Capabilities, RadioError> {
        Ok(Capabilities::full(self.config.max_advertising_data_len))
    }

    async fn advertiser(&self) -> std::result::Result<AdvertiserLink, RadioError> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                Ok(Box::new(crate::peripheral::BlueZAdvertiserLink::new(
                    self.bluez.clone(),
                    self.config.device_name.clone(),
                )))
            } else {
                warn!("{}", BleError::PeripheralUnsupported);
                Err(RadioError::NotSupported(ServiceKind::Advertiser))
            }
        }
    }

    async fn scanner(&self) -> std::result::Result<ScannerLink, RadioError> {
        Ok(Box::new(BleScannerLink::new(self.central.clone())))
    }

    async fn gatt_server(&self) -> std::result::Result<GattServerLink, RadioError> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                Ok(Box::new(crate::peripheral::BlueZServerLink::new(self.bluez.clone())))
            } else {
                warn!("{}", BleError::PeripheralUnsupported);
                Err(RadioError::NotSupported(ServiceKind::GattServer))
            }
        }
    }

    async fn gatt_client(&self) -> std::result::Result<GattClientLink, RadioError> {
        Ok(Box::new(BleClientLink::new(self.central.clone())))
    }
}
