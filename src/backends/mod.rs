//! Vendor backends and the factory that picks one from configuration.
//!
//! Each backend is an adapter implementing [`Microscope`] over a vendor
//! client trait. Where the clients come from is the job of a
//! [`VendorBridge`]: [`SimulatedBridge`] hands out in-process simulators,
//! [`NativeBridge`] stands for the vendor SDKs, which are not bundled.

mod sim;
pub mod tescan;
pub mod thermo;

pub use crate::config::Manufacturer;
pub use sim::SimControl;
pub use tescan::{SimulatedTescan, TescanClient, TescanMicroscope};
pub use thermo::{SimulatedThermo, ThermoClient, ThermoMicroscope};

use tracing::info;

use crate::config::SystemConfig;
use crate::error::{AppResult, HalError};
use crate::microscope::Microscope;

/// Source of vendor clients.
pub trait VendorBridge: Send + Sync {
    /// A fresh Thermo client.
    fn thermo_client(&self) -> AppResult<Box<dyn ThermoClient>>;

    /// A fresh TESCAN client.
    fn tescan_client(&self) -> AppResult<Box<dyn TescanClient>>;
}

/// Bridge handing out simulated clients.
///
/// The simulators are shared: every client it returns is a clone of the
/// same [`SimulatedThermo`] / [`SimulatedTescan`], and the handles are
/// available for inspection.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBridge {
    /// Thermo simulator.
    pub thermo: SimulatedThermo,
    /// TESCAN simulator.
    pub tescan: SimulatedTescan,
}

impl SimulatedBridge {
    /// Fresh simulators.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VendorBridge for SimulatedBridge {
    fn thermo_client(&self) -> AppResult<Box<dyn ThermoClient>> {
        Ok(Box::new(self.thermo.clone()))
    }

    fn tescan_client(&self) -> AppResult<Box<dyn TescanClient>> {
        Ok(Box::new(self.tescan.clone()))
    }
}

/// Bridge to the vendor SDKs. None is linked into this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBridge;

impl VendorBridge for NativeBridge {
    fn thermo_client(&self) -> AppResult<Box<dyn ThermoClient>> {
        Err(HalError::FeatureNotEnabled(
            "native Thermo AutoScript client".to_string(),
        ))
    }

    fn tescan_client(&self) -> AppResult<Box<dyn TescanClient>> {
        Err(HalError::FeatureNotEnabled(
            "native TESCAN Automation client".to_string(),
        ))
    }
}

/// Builds the adapter for the configured manufacturer. Nothing is connected.
pub fn create_microscope(
    system: &SystemConfig,
    bridge: &dyn VendorBridge,
) -> AppResult<Box<dyn Microscope>> {
    let microscope: Box<dyn Microscope> = match system.manufacturer {
        Manufacturer::Thermo => Box::new(ThermoMicroscope::new(bridge.thermo_client()?)),
        Manufacturer::Tescan => Box::new(TescanMicroscope::new(bridge.tescan_client()?)),
    };
    info!("Created {} backend", system.manufacturer);
    Ok(microscope)
}

/// Builds the adapter and connects it to the configured address and port.
///
/// Uses [`SimulatedBridge`] when `system.simulated` is set, otherwise `bridge`.
pub async fn connect_microscope(
    system: &SystemConfig,
    bridge: &dyn VendorBridge,
) -> AppResult<Box<dyn Microscope>> {
    let simulated = SimulatedBridge::new();
    let bridge: &dyn VendorBridge = if system.simulated { &simulated } else { bridge };

    let mut microscope = create_microscope(system, bridge)?;
    microscope
        .connect(&system.ip_address, system.port())
        .await?;
    Ok(microscope)
}
