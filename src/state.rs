//! Device state model.
//!
//! Plain value types shared by every backend: beam identity, stage pose,
//! per-beam settings, the timestamped [`MicroscopeState`] snapshot, image
//! acquisition settings and results, and milling pattern descriptions.
//!
//! All linear quantities are metres and all angles radians. Vendor
//! adapters convert at their edge; nothing in here knows about vendors.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HalError;

/// Imaging/milling beam identity.
///
/// Vendors expose several detector channels per column; the interface only
/// distinguishes the two beams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeamType {
    /// Scanning electron beam.
    Electron,
    /// Focused ion beam.
    Ion,
}

impl BeamType {
    /// Both beams, electron first.
    pub const ALL: [BeamType; 2] = [BeamType::Electron, BeamType::Ion];

    /// Uppercase beam name, as used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            BeamType::Electron => "ELECTRON",
            BeamType::Ion => "ION",
        }
    }

    /// Index used for per-beam tables.
    pub fn index(&self) -> usize {
        match self {
            BeamType::Electron => 0,
            BeamType::Ion => 1,
        }
    }

    /// The other beam.
    pub fn other(&self) -> BeamType {
        match self {
            BeamType::Electron => BeamType::Ion,
            BeamType::Ion => BeamType::Electron,
        }
    }
}

impl fmt::Display for BeamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BeamType {
    type Err = HalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "electron" | "eb" | "sem" => Ok(BeamType::Electron),
            "ion" | "ib" | "fib" => Ok(BeamType::Ion),
            other => Err(HalError::ConfigValidation(format!(
                "Unknown beam type '{}'",
                other
            ))),
        }
    }
}

/// Stage coordinate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSystem {
    /// Stage frame, independent of sample conventions.
    #[default]
    Raw,
    /// Sample-relative frame.
    Specimen,
}

/// Stage pose.
///
/// Used both for absolute positions and for relative deltas. A pose is a
/// value: motion produces a new one, nothing mutates it in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    /// X (m).
    pub x: f64,
    /// Y (m).
    pub y: f64,
    /// Z (m).
    pub z: f64,
    /// Rotation (rad).
    pub r: f64,
    /// Tilt (rad).
    pub t: f64,
    /// Frame the values are expressed in.
    pub coordinate_system: CoordinateSystem,
}

impl StagePosition {
    /// A pose in the RAW frame.
    pub fn raw(x: f64, y: f64, z: f64, r: f64, t: f64) -> Self {
        Self {
            x,
            y,
            z,
            r,
            t,
            coordinate_system: CoordinateSystem::Raw,
        }
    }

    /// A pure translation delta.
    pub fn translation(x: f64, y: f64, z: f64) -> Self {
        Self::raw(x, y, z, 0.0, 0.0)
    }

    /// This pose offset by `delta`, axis by axis.
    pub fn offset_by(&self, delta: &StagePosition) -> StagePosition {
        StagePosition {
            x: self.x + delta.x,
            y: self.y + delta.y,
            z: self.z + delta.z,
            r: self.r + delta.r,
            t: self.t + delta.t,
            coordinate_system: self.coordinate_system,
        }
    }

    /// The inverse delta.
    pub fn negated(&self) -> StagePosition {
        StagePosition {
            x: -self.x,
            y: -self.y,
            z: -self.z,
            r: -self.r,
            t: -self.t,
            coordinate_system: self.coordinate_system,
        }
    }

    /// Axis-wise comparison within separate linear and angular tolerances.
    pub fn approx_eq(&self, other: &StagePosition, linear_tol: f64, angular_tol: f64) -> bool {
        (self.x - other.x).abs() <= linear_tol
            && (self.y - other.y).abs() <= linear_tol
            && (self.z - other.z).abs() <= linear_tol
            && (self.r - other.r).abs() <= angular_tol
            && (self.t - other.t).abs() <= angular_tol
    }
}

impl Default for StagePosition {
    fn default() -> Self {
        Self::raw(0.0, 0.0, 0.0, 0.0, 0.0)
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x={:.4e}m y={:.4e}m z={:.4e}m r={:.4}rad t={:.4}rad ({:?})",
            self.x, self.y, self.z, self.r, self.t, self.coordinate_system
        )
    }
}

/// 2-D point, used for stigmation and beam shift.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// X component.
    pub x: f64,
    /// Y component.
    pub y: f64,
}

impl Point {
    /// Creates a point.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[allow(clippy::expect_used)]
static RESOLUTION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s*[xX]\s*(\d+)\s*$").expect("resolution pattern compiles")
});

/// Scan resolution in pixels.
///
/// Serialised as the `"WxH"` string vendors use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Creates a resolution.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1536, 1024)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = HalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = RESOLUTION_PATTERN.captures(s).ok_or_else(|| {
            HalError::ConfigValidation(format!("Invalid resolution '{}', expected WxH", s))
        })?;
        let parse = |idx: usize| -> Result<u32, HalError> {
            caps[idx]
                .parse::<u32>()
                .map_err(|e| HalError::ConfigValidation(format!("Invalid resolution '{}': {}", s, e)))
        };
        let resolution = Resolution::new(parse(1)?, parse(2)?);
        if resolution.width == 0 || resolution.height == 0 {
            return Err(HalError::ConfigValidation(format!(
                "Invalid resolution '{}': dimensions must be non-zero",
                s
            )));
        }
        Ok(resolution)
    }
}

impl Serialize for Resolution {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One beam's configuration at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamSettings {
    /// Beam these settings belong to.
    pub beam_type: BeamType,
    /// Working distance (m).
    pub working_distance: f64,
    /// Beam current (A).
    pub beam_current: f64,
    /// Horizontal field width (m).
    pub hfw: f64,
    /// Scan resolution.
    pub resolution: Resolution,
    /// Pixel dwell time (s).
    pub dwell_time: f64,
    /// Stigmator setting, when the vendor reports it.
    #[serde(default)]
    pub stigmation: Option<Point>,
    /// Beam/image shift, when the vendor reports it.
    #[serde(default)]
    pub shift: Option<Point>,
}

impl BeamSettings {
    /// Field-wise comparison with a relative tolerance on the floats.
    pub fn approx_eq(&self, other: &BeamSettings, rel_tol: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= rel_tol * a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
        self.beam_type == other.beam_type
            && close(self.working_distance, other.working_distance)
            && close(self.beam_current, other.beam_current)
            && close(self.hfw, other.hfw)
            && self.resolution == other.resolution
            && close(self.dwell_time, other.dwell_time)
    }
}

/// Timestamped snapshot of stage pose and both beams.
///
/// The unit of save/restore. Built once by an adapter and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroscopeState {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Stage pose in the RAW frame.
    pub absolute_position: StagePosition,
    /// Electron beam settings.
    pub electron_beam: BeamSettings,
    /// Ion beam settings.
    pub ion_beam: BeamSettings,
}

impl MicroscopeState {
    /// Settings for `beam`.
    pub fn beam(&self, beam: BeamType) -> &BeamSettings {
        match beam {
            BeamType::Electron => &self.electron_beam,
            BeamType::Ion => &self.ion_beam,
        }
    }

    /// Compares pose and both beams, ignoring the timestamp.
    pub fn approx_eq(&self, other: &MicroscopeState, linear_tol: f64, rel_tol: f64) -> bool {
        self.absolute_position
            .approx_eq(&other.absolute_position, linear_tol, linear_tol)
            && self.electron_beam.approx_eq(&other.electron_beam, rel_tol)
            && self.ion_beam.approx_eq(&other.ion_beam, rel_tol)
    }
}

/// Acquisition parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSettings {
    /// Beam to image with.
    pub beam_type: BeamType,
    /// Scan resolution.
    pub resolution: Resolution,
    /// Pixel dwell time (s).
    pub dwell_time: f64,
    /// Requested horizontal field width (m). Clamped to device limits on acquisition.
    pub hfw: f64,
    /// Run auto contrast/brightness before acquiring.
    #[serde(default)]
    pub autocontrast: bool,
    /// Free-form label for persisted snapshots.
    #[serde(default)]
    pub label: String,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            beam_type: BeamType::Electron,
            resolution: Resolution::default(),
            dwell_time: 1.0e-6,
            hfw: 150.0e-6,
            autocontrast: false,
            label: String::new(),
        }
    }
}

/// Pixel buffer of one frame, 8-bit grayscale, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// `width * height` bytes.
    pub pixels: Bytes,
}

impl ImageData {
    /// Wraps a buffer, checking its length against the dimensions.
    pub fn new(width: u32, height: u32, pixels: Bytes) -> Result<Self, HalError> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(HalError::hardware(
                "image_data",
                format!(
                    "buffer size mismatch: expected {} bytes for {}x{}, got {}",
                    expected,
                    width,
                    height,
                    pixels.len()
                ),
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Resolution matching the buffer.
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// An acquired frame with the settings and instrument state that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Pixel buffer.
    pub data: ImageData,
    /// Settings actually used (hfw after clamping, resolution of the buffer).
    pub settings: ImageSettings,
    /// Instrument state at capture time.
    pub state: MicroscopeState,
}

/// Vendor pattern scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScanDirection {
    /// Scan from bottom to top.
    #[default]
    BottomToTop,
    /// Scan from top to bottom.
    TopToBottom,
    /// Scan from left to right.
    LeftToRight,
    /// Scan from right to left.
    RightToLeft,
}

impl ScanDirection {
    /// Vendor spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanDirection::BottomToTop => "BottomToTop",
            ScanDirection::TopToBottom => "TopToBottom",
            ScanDirection::LeftToRight => "LeftToRight",
            ScanDirection::RightToLeft => "RightToLeft",
        }
    }
}

/// One rectangle or cleaning cross-section queued into the milling layer.
///
/// Centre and extents are in metres in the ion image plane; rotation in
/// radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MillingPattern {
    /// Centre x (m).
    pub centre_x: f64,
    /// Centre y (m).
    pub centre_y: f64,
    /// Width (m).
    pub width: f64,
    /// Height (m).
    pub height: f64,
    /// Milling depth (m).
    pub depth: f64,
    /// Rotation (rad).
    #[serde(default)]
    pub rotation: f64,
    /// Scan direction.
    #[serde(default)]
    pub scan_direction: ScanDirection,
    /// Use a cleaning cross-section instead of a plain rectangle.
    #[serde(default)]
    pub cleaning_cross_section: bool,
}

/// Whether queued patterns are milled one after another or together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PatterningMode {
    /// One pattern at a time.
    #[default]
    Serial,
    /// All patterns interleaved.
    Parallel,
}

impl PatterningMode {
    /// Vendor spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatterningMode::Serial => "Serial",
            PatterningMode::Parallel => "Parallel",
        }
    }
}

/// Beam parameters for a milling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MillingSettings {
    /// Ion beam current while milling (A).
    pub milling_current: f64,
    /// Spot size (m).
    #[serde(default = "default_spot_size")]
    pub spot_size: f64,
    /// Sputter rate, volume per dose (m^3/C).
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Pattern dwell time (s).
    #[serde(default = "default_milling_dwell")]
    pub dwell_time: f64,
}

fn default_spot_size() -> f64 {
    5.0e-8
}

fn default_rate() -> f64 {
    3.0e-3
}

fn default_milling_dwell() -> f64 {
    1.0e-6
}

impl Default for MillingSettings {
    fn default() -> Self {
        Self {
            milling_current: 2.0e-9,
            spot_size: default_spot_size(),
            rate: default_rate(),
            dwell_time: default_milling_dwell(),
        }
    }
}

/// Per-installation stage calibration, in degrees as it appears in
/// configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemCalibration {
    /// Sample holder pre-tilt: stage tilt that makes the sample face the electron column.
    pub tilt_flat_to_electron: f64,
    /// Stage tilt that makes the sample face the ion column.
    pub tilt_flat_to_ion: f64,
    /// Rotation of the electron-facing mounting regime.
    pub rotation_flat_to_electron: f64,
    /// Rotation of the ion-facing mounting regime.
    pub rotation_flat_to_ion: f64,
}

impl Default for SystemCalibration {
    fn default() -> Self {
        Self {
            tilt_flat_to_electron: 27.0,
            tilt_flat_to_ion: 52.0,
            rotation_flat_to_electron: 49.0,
            rotation_flat_to_ion: 229.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parsing() {
        let res: Resolution = "1536x1024".parse().unwrap();
        assert_eq!(res, Resolution::new(1536, 1024));
        let res: Resolution = " 768 X 512 ".parse().unwrap();
        assert_eq!(res, Resolution::new(768, 512));
        assert!("1536".parse::<Resolution>().is_err());
        assert!("0x512".parse::<Resolution>().is_err());
        assert_eq!(Resolution::new(3072, 2048).to_string(), "3072x2048");
    }

    #[test]
    fn test_resolution_serializes_as_string() {
        let json = serde_json::to_string(&Resolution::new(1536, 1024)).unwrap();
        assert_eq!(json, "\"1536x1024\"");
        let back: Resolution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Resolution::new(1536, 1024));
    }

    #[test]
    fn test_stage_offset_and_negation() {
        let pose = StagePosition::raw(1e-3, 2e-3, 3e-3, 0.1, 0.2);
        let delta = StagePosition::raw(1e-6, -1e-6, 5e-7, 0.01, -0.02);
        let moved = pose.offset_by(&delta);
        let back = moved.offset_by(&delta.negated());
        assert!(back.approx_eq(&pose, 1e-12, 1e-12));
        assert_eq!(moved.coordinate_system, CoordinateSystem::Raw);
    }

    #[test]
    fn test_beam_type_parsing() {
        assert_eq!("ion".parse::<BeamType>().unwrap(), BeamType::Ion);
        assert_eq!("ELECTRON".parse::<BeamType>().unwrap(), BeamType::Electron);
        assert!("proton".parse::<BeamType>().is_err());
        assert_eq!(BeamType::Electron.other(), BeamType::Ion);
    }

    #[test]
    fn test_image_data_length_check() {
        assert!(ImageData::new(4, 2, Bytes::from(vec![0u8; 8])).is_ok());
        assert!(ImageData::new(4, 2, Bytes::from(vec![0u8; 7])).is_err());
    }

    #[test]
    fn test_state_json_is_flat_records() {
        let settings = |beam_type| BeamSettings {
            beam_type,
            working_distance: 4.0e-3,
            beam_current: 1.0e-10,
            hfw: 150e-6,
            resolution: Resolution::default(),
            dwell_time: 1e-6,
            stigmation: None,
            shift: Some(Point::new(0.0, 0.0)),
        };
        let state = MicroscopeState {
            timestamp: Utc::now(),
            absolute_position: StagePosition::raw(0.0, 0.0, 4e-3, 0.0, 0.0),
            electron_beam: settings(BeamType::Electron),
            ion_beam: settings(BeamType::Ion),
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["electron_beam"]["beam_type"], "electron");
        assert_eq!(value["ion_beam"]["resolution"], "1536x1024");
        assert_eq!(value["absolute_position"]["coordinate_system"], "raw");

        let back: MicroscopeState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }
}
