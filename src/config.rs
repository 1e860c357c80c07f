//! Configuration loading using Figment.
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `FIBSEM_`, `__` separating nesting
//!
//! ```text
//! FIBSEM_SYSTEM__IP_ADDRESS=10.0.0.1
//! FIBSEM_SYSTEM__MANUFACTURER=tescan
//! FIBSEM_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```toml
//! [system]
//! manufacturer = "thermo"
//! ip_address = "10.0.0.1"
//! application_file = "Si"
//!
//! [calibration]
//! tilt_flat_to_electron = 27.0
//! tilt_flat_to_ion = 52.0
//! rotation_flat_to_electron = 49.0
//! rotation_flat_to_ion = 229.0
//!
//! [imaging]
//! beam_type = "electron"
//! resolution = "1536x1024"
//! dwell_time = 1.0e-6
//! hfw = 150.0e-6
//!
//! [milling]
//! milling_current = 2.0e-9
//! imaging_current = 20.0e-12
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{AppResult, HalError};
use crate::geometry::{angle_difference, REGIME_TOLERANCE_DEG};
use crate::state::{ImageSettings, MillingSettings, PatterningMode, SystemCalibration};

/// Supported instrument vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Manufacturer {
    /// Thermo Fisher (AutoScript-style API).
    Thermo,
    /// TESCAN (Automation API with DrawBeam).
    Tescan,
}

impl Manufacturer {
    /// Vendor's default control port.
    pub fn default_port(&self) -> u16 {
        match self {
            Manufacturer::Thermo => 7520,
            Manufacturer::Tescan => 8300,
        }
    }
}

impl fmt::Display for Manufacturer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Manufacturer::Thermo => f.write_str("Thermo"),
            Manufacturer::Tescan => f.write_str("Tescan"),
        }
    }
}

impl FromStr for Manufacturer {
    type Err = HalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thermo" => Ok(Manufacturer::Thermo),
            "tescan" => Ok(Manufacturer::Tescan),
            other => Err(HalError::ConfigValidation(format!(
                "Unknown manufacturer '{}'. Must be one of: thermo, tescan",
                other
            ))),
        }
    }
}

/// Connection and instrument selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Which backend to build.
    pub manufacturer: Manufacturer,
    /// Vendor control server address.
    pub ip_address: String,
    /// Vendor control port; the vendor default when absent.
    #[serde(default)]
    pub port: Option<u16>,
    /// Default patterning application file.
    #[serde(default = "default_application_file")]
    pub application_file: String,
    /// Use the in-process simulated vendor clients.
    #[serde(default)]
    pub simulated: bool,
}

impl SystemConfig {
    /// Configured port or the vendor default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.manufacturer.default_port())
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            manufacturer: Manufacturer::Thermo,
            ip_address: "10.0.0.1".to_string(),
            port: None,
            application_file: default_application_file(),
            simulated: false,
        }
    }
}

/// Default milling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MillingConfig {
    /// Beam parameters for the milling layer.
    #[serde(flatten)]
    pub settings: MillingSettings,
    /// Ion current restored by `finish_milling` (A).
    #[serde(default = "default_imaging_current")]
    pub imaging_current: f64,
    /// Patterning mode.
    #[serde(default)]
    pub mode: PatterningMode,
}

impl Default for MillingConfig {
    fn default() -> Self {
        Self {
            settings: MillingSettings::default(),
            imaging_current: default_imaging_current(),
            mode: PatterningMode::Serial,
        }
    }
}

/// Tracing output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines on the terminal.
    #[serde(default)]
    pub json: bool,
    /// Also write a log file into the session directory.
    #[serde(default = "default_log_file")]
    pub log_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_file: default_log_file(),
        }
    }
}

/// Everything a workflow needs besides the microscope itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MicroscopeSettings {
    /// Connection and backend selection.
    pub system: SystemConfig,
    /// Stage calibration (degrees).
    #[serde(default)]
    pub calibration: SystemCalibration,
    /// Default acquisition settings.
    #[serde(default)]
    pub imaging: ImageSettings,
    /// Default milling parameters.
    #[serde(default)]
    pub milling: MillingConfig,
    /// Tracing output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_application_file() -> String {
    "Si".to_string()
}

fn default_imaging_current() -> f64 {
    20.0e-12
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl MicroscopeSettings {
    /// Load from `config/system.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/system.toml")
    }

    /// Load from a specific TOML file, merged over built-in defaults and
    /// under `FIBSEM_` environment overrides, then validate.
    ///
    /// # Errors
    /// [`HalError::Config`] when extraction fails, [`HalError::ConfigValidation`]
    /// when the values are inconsistent.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FIBSEM_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse from a TOML string (no environment merge), then validate.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks after loading.
    ///
    /// - log level is one of trace, debug, info, warn, error
    /// - address non-empty, port non-zero
    /// - dwell times, hfw and currents positive and finite
    /// - calibration angles finite, rotation references far enough apart
    ///   that regime selection is unambiguous
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(HalError::ConfigValidation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.system.ip_address.trim().is_empty() {
            return Err(HalError::ConfigValidation(
                "system.ip_address cannot be empty".to_string(),
            ));
        }
        if self.system.port == Some(0) {
            return Err(HalError::ConfigValidation(
                "system.port must be > 0".to_string(),
            ));
        }

        let positive = [
            ("imaging.dwell_time", self.imaging.dwell_time),
            ("imaging.hfw", self.imaging.hfw),
            ("milling.milling_current", self.milling.settings.milling_current),
            ("milling.dwell_time", self.milling.settings.dwell_time),
            ("milling.imaging_current", self.milling.imaging_current),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(HalError::ConfigValidation(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        let cal = &self.calibration;
        let angles = [
            ("calibration.tilt_flat_to_electron", cal.tilt_flat_to_electron),
            ("calibration.tilt_flat_to_ion", cal.tilt_flat_to_ion),
            ("calibration.rotation_flat_to_electron", cal.rotation_flat_to_electron),
            ("calibration.rotation_flat_to_ion", cal.rotation_flat_to_ion),
        ];
        for (name, value) in angles {
            if !value.is_finite() {
                return Err(HalError::ConfigValidation(format!(
                    "{} must be finite, got {}",
                    name, value
                )));
            }
        }

        let separation = angle_difference(
            cal.rotation_flat_to_electron.to_radians(),
            cal.rotation_flat_to_ion.to_radians(),
        )
        .to_degrees();
        if separation < 2.0 * REGIME_TOLERANCE_DEG {
            return Err(HalError::ConfigValidation(format!(
                "Rotation references are {:.2} deg apart; they must differ by at least {:.1} deg",
                separation,
                2.0 * REGIME_TOLERANCE_DEG
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{BeamType, Resolution};
    use std::io::Write;

    #[test]
    fn test_config_validation_valid() {
        assert!(MicroscopeSettings::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = MicroscopeSettings::default();
        settings.logging.level = "loud".to_string();
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_rotation_references_too_close() {
        let mut settings = MicroscopeSettings::default();
        settings.calibration.rotation_flat_to_electron = 358.0;
        settings.calibration.rotation_flat_to_ion = 3.0;
        let result = settings.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Rotation references"));
    }

    #[test]
    fn test_non_positive_dwell() {
        let mut settings = MicroscopeSettings::default();
        settings.imaging.dwell_time = 0.0;
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .contains("imaging.dwell_time"));
    }

    #[test]
    fn test_from_toml_str() {
        let settings = MicroscopeSettings::from_toml_str(
            r#"
            [system]
            manufacturer = "tescan"
            ip_address = "192.168.0.5"

            [calibration]
            tilt_flat_to_electron = 6.0
            tilt_flat_to_ion = 52.0
            rotation_flat_to_electron = 0.0
            rotation_flat_to_ion = 180.0

            [imaging]
            beam_type = "ion"
            resolution = "768x512"
            dwell_time = 2.0e-6
            hfw = 80.0e-6

            [milling]
            milling_current = 1.0e-9
            mode = "Parallel"
            "#,
        )
        .unwrap();

        assert_eq!(settings.system.manufacturer, Manufacturer::Tescan);
        assert_eq!(settings.system.port(), 8300);
        assert_eq!(settings.system.application_file, "Si");
        assert_eq!(settings.calibration.tilt_flat_to_electron, 6.0);
        assert_eq!(settings.imaging.beam_type, BeamType::Ion);
        assert_eq!(settings.imaging.resolution, Resolution::new(768, 512));
        assert_eq!(settings.milling.settings.milling_current, 1.0e-9);
        assert_eq!(settings.milling.settings.spot_size, 5.0e-8);
        assert_eq!(settings.milling.mode, PatterningMode::Parallel);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[system]\nmanufacturer = \"thermo\"\nip_address = \"10.0.0.9\"\nport = 7521\nsimulated = true"
        )
        .unwrap();

        let settings = MicroscopeSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.system.manufacturer, Manufacturer::Thermo);
        assert_eq!(settings.system.port(), 7521);
        assert!(settings.system.simulated);
        assert_eq!(settings.calibration, SystemCalibration::default());
    }

    #[test]
    fn test_unknown_manufacturer_rejected() {
        let result = MicroscopeSettings::from_toml_str(
            "[system]\nmanufacturer = \"zeiss\"\nip_address = \"10.0.0.1\"\n",
        );
        assert!(matches!(result, Err(HalError::Config(_))));
        assert!("zeiss".parse::<Manufacturer>().is_err());
    }
}
