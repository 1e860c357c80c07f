//! Stage motion correction.
//!
//! Converts a desired displacement in the image plane into a relative stage
//! move. X maps straight through. Y has to be corrected for the sample
//! holder pre-tilt, for which of the two mounting regimes the stage rotation
//! is in, and for the beam the image was taken with: the ion column views the
//! sample at an extra fixed tilt relative to the electron column.
//!
//! Everything here is pure: no device access, no logging side effects beyond
//! `tracing` diagnostics.
//!
//! # Example
//!
//! ```
//! use fibsem_hal::geometry::corrected_yz_move;
//! use fibsem_hal::state::{BeamType, StagePosition, SystemCalibration};
//!
//! let calibration = SystemCalibration {
//!     tilt_flat_to_electron: 6.0,
//!     tilt_flat_to_ion: 52.0,
//!     rotation_flat_to_electron: 0.0,
//!     rotation_flat_to_ion: 180.0,
//! };
//! let pose = StagePosition::raw(0.0, 0.0, 0.0, 0.0, 6f64.to_radians());
//! let delta = corrected_yz_move(&calibration, &pose, 10e-6, BeamType::Electron)?;
//! assert!((delta.y - 9.945e-6).abs() < 1e-9);
//! assert!((delta.z - 1.045e-6).abs() < 1e-9);
//! # Ok::<(), fibsem_hal::error::HalError>(())
//! ```

use std::f64::consts::TAU;

use crate::error::{AppResult, HalError};
use crate::state::{BeamType, StagePosition, SystemCalibration};

// =============================================================================
// Constants
// =============================================================================

/// Angular tolerance (degrees) for deciding which mounting regime the stage is in.
pub const REGIME_TOLERANCE_DEG: f64 = 5.0;

/// Default tolerance (degrees) for [`rotation_angle_is_larger`].
pub const LARGE_ROTATION_TOLERANCE_DEG: f64 = 90.0;

/// Below this, `cos(tilt + adjustment)` is treated as zero.
pub const DEGENERATE_COSINE_EPSILON: f64 = 1.0e-6;

/// Reserved for a future per-beam scale calibration.
const SCALE_FACTOR: f64 = 1.0;

// =============================================================================
// Angle arithmetic
// =============================================================================

/// Circular distance between two angles (radians), in `[0, π]`.
///
/// Both angles are wrapped into `[0, 2π)` first, so any multiple of 2π added
/// to either input leaves the result unchanged.
pub fn angle_difference(angle1: f64, angle2: f64) -> f64 {
    let a1 = angle1.rem_euclid(TAU);
    let a2 = angle2.rem_euclid(TAU);

    let large = a1.max(a2);
    let small = a1.min(a2);

    (large - small).min(TAU + small - large)
}

/// True when the circular distance exceeds `tolerance_deg` degrees.
pub fn rotation_angle_is_larger(angle1: f64, angle2: f64, tolerance_deg: f64) -> bool {
    angle_difference(angle1, angle2) > tolerance_deg.to_radians()
}

/// True when the circular distance is below `tolerance_deg` degrees.
pub fn rotation_angle_is_smaller(angle1: f64, angle2: f64, tolerance_deg: f64) -> bool {
    angle_difference(angle1, angle2) < tolerance_deg.to_radians()
}

// =============================================================================
// Regime selection
// =============================================================================

/// Pre-tilt sign for the mounting regime the stage rotation `rotation` (rad) is in.
///
/// `+1` near `rotation_flat_to_electron`, `-1` near `rotation_flat_to_ion`.
/// Within tolerance of both, the closer reference wins and an exact tie goes
/// to the electron regime. Outside tolerance of both, `+1`.
pub fn pretilt_sign(calibration: &SystemCalibration, rotation: f64) -> f64 {
    let rotation = rotation.rem_euclid(TAU);
    let electron_ref = calibration.rotation_flat_to_electron.to_radians().rem_euclid(TAU);
    let ion_ref = calibration.rotation_flat_to_ion.to_radians().rem_euclid(TAU);

    let near_electron = rotation_angle_is_smaller(rotation, electron_ref, REGIME_TOLERANCE_DEG);
    let near_ion = rotation_angle_is_smaller(rotation, ion_ref, REGIME_TOLERANCE_DEG);

    match (near_electron, near_ion) {
        (true, false) => 1.0,
        (false, true) => -1.0,
        (true, true) => {
            if angle_difference(rotation, ion_ref) < angle_difference(rotation, electron_ref) {
                -1.0
            } else {
                1.0
            }
        }
        (false, false) => {
            tracing::debug!(
                rotation_deg = rotation.to_degrees(),
                "stage rotation matches neither mounting regime, assuming electron regime"
            );
            1.0
        }
    }
}

// =============================================================================
// Corrected moves
// =============================================================================

/// Relative move for an image-plane x displacement (m). No correction needed.
pub fn corrected_x_move(expected_x: f64) -> StagePosition {
    StagePosition::translation(expected_x, 0.0, 0.0)
}

/// Relative move for an image-plane y displacement (m), corrected for pre-tilt.
///
/// `current` supplies the stage rotation (regime) and tilt. Returns a delta
/// with only `y` and `z` set.
///
/// # Errors
/// [`HalError::DegenerateGeometry`] when the perspective cosine is within
/// [`DEGENERATE_COSINE_EPSILON`] of zero (tilt near ±90° from the view axis),
/// or when a NaN or infinite input would make the move non-finite.
pub fn corrected_yz_move(
    calibration: &SystemCalibration,
    current: &StagePosition,
    expected_y: f64,
    beam_type: BeamType,
) -> AppResult<StagePosition> {
    let tilt_flat_to_electron = calibration.tilt_flat_to_electron.to_radians();
    let tilt_flat_to_ion = calibration.tilt_flat_to_ion.to_radians();

    let sign = pretilt_sign(calibration, current.r);
    let corrected_pretilt = sign * tilt_flat_to_electron;

    // perspective vs sample frame
    let adjustment = match beam_type {
        BeamType::Electron => -corrected_pretilt,
        BeamType::Ion => -corrected_pretilt - tilt_flat_to_ion,
    };

    let degenerate = |cosine: f64| HalError::DegenerateGeometry {
        tilt: current.t,
        adjustment,
        cosine,
    };

    let cosine = (current.t + adjustment).cos();
    if !cosine.is_finite() || cosine.abs() < DEGENERATE_COSINE_EPSILON {
        return Err(degenerate(cosine));
    }

    let y_sample_move = expected_y * SCALE_FACTOR / cosine;
    let y_move = y_sample_move * corrected_pretilt.cos();
    let z_move = y_sample_move * corrected_pretilt.sin();
    if !y_move.is_finite() || !z_move.is_finite() {
        return Err(degenerate(cosine));
    }

    tracing::debug!(
        beam = %beam_type,
        sign,
        corrected_pretilt,
        adjustment,
        y_move,
        z_move,
        "corrected y stage movement"
    );

    Ok(StagePosition::translation(0.0, y_move, z_move))
}

/// Full relative move for an image-plane displacement `(dx, dy)`.
pub fn corrected_stage_move(
    calibration: &SystemCalibration,
    current: &StagePosition,
    dx: f64,
    dy: f64,
    beam_type: BeamType,
) -> AppResult<StagePosition> {
    let x_move = corrected_x_move(dx);
    let yz_move = corrected_yz_move(calibration, current, dy, beam_type)?;
    Ok(StagePosition::translation(x_move.x, yz_move.y, yz_move.z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn calibration() -> SystemCalibration {
        SystemCalibration {
            tilt_flat_to_electron: 6.0,
            tilt_flat_to_ion: 52.0,
            rotation_flat_to_electron: 0.0,
            rotation_flat_to_ion: 180.0,
        }
    }

    #[test]
    fn test_angle_difference_basic() {
        assert!((angle_difference(0.0, PI / 2.0) - PI / 2.0).abs() < 1e-12);
        // wraps the short way round
        assert!((angle_difference(10f64.to_radians(), 350f64.to_radians()) - 20f64.to_radians()).abs() < 1e-12);
        assert!((angle_difference(-PI / 4.0, PI / 4.0) - PI / 2.0).abs() < 1e-12);
        assert!((angle_difference(0.0, PI) - PI).abs() < 1e-12);
    }

    #[test]
    fn test_rotation_predicates() {
        let a = 0.0;
        let b = 3f64.to_radians();
        assert!(rotation_angle_is_smaller(a, b, REGIME_TOLERANCE_DEG));
        assert!(!rotation_angle_is_larger(a, b, REGIME_TOLERANCE_DEG));
        assert!(rotation_angle_is_larger(0.0, PI, LARGE_ROTATION_TOLERANCE_DEG));
    }

    #[test]
    fn test_x_move_is_identity() {
        let delta = corrected_x_move(12e-6);
        assert_eq!(delta, StagePosition::translation(12e-6, 0.0, 0.0));
    }

    #[test]
    fn test_electron_scenario() {
        let pose = StagePosition::raw(0.0, 0.0, 0.0, 0.0, 6f64.to_radians());
        let delta = corrected_yz_move(&calibration(), &pose, 10e-6, BeamType::Electron).unwrap();

        assert_eq!(delta.x, 0.0);
        assert!((delta.y - 10e-6 * 6f64.to_radians().cos()).abs() < 1e-15);
        assert!((delta.z - 10e-6 * 6f64.to_radians().sin()).abs() < 1e-15);
        assert!((delta.y - 9.945e-6).abs() < 1e-9);
        assert!((delta.z - 1.045e-6).abs() < 1e-9);
    }

    #[test]
    fn test_ion_regime_flips_sign() {
        let pose = StagePosition::raw(0.0, 0.0, 0.0, PI, 0.0);
        let delta = corrected_yz_move(&calibration(), &pose, 10e-6, BeamType::Electron).unwrap();
        // corrected pretilt = -6 deg, adjustment = +6 deg
        let expected_sample = 10e-6 / 6f64.to_radians().cos();
        assert!((delta.y - expected_sample * (-6f64).to_radians().cos()).abs() < 1e-15);
        assert!(delta.z < 0.0);
    }

    #[test]
    fn test_ion_beam_perspective() {
        let pose = StagePosition::raw(0.0, 0.0, 0.0, 0.0, 52f64.to_radians());
        let delta = corrected_yz_move(&calibration(), &pose, 10e-6, BeamType::Ion).unwrap();
        // adjustment = -6 - 52 deg, tilt 52 deg => cos(-6 deg)
        let expected_sample = 10e-6 / (-6f64).to_radians().cos();
        assert!((delta.y - expected_sample * 6f64.to_radians().cos()).abs() < 1e-15);
        assert!((delta.z - expected_sample * 6f64.to_radians().sin()).abs() < 1e-15);
    }

    #[test]
    fn test_degenerate_geometry() {
        // tilt + adjustment = 90 deg
        let pose = StagePosition::raw(0.0, 0.0, 0.0, 0.0, 96f64.to_radians());
        let err = corrected_yz_move(&calibration(), &pose, 10e-6, BeamType::Electron).unwrap_err();
        assert!(matches!(err, HalError::DegenerateGeometry { .. }));
    }

    #[test]
    fn test_non_finite_inputs_are_degenerate() {
        let nan_tilt = StagePosition::raw(0.0, 0.0, 0.0, 0.0, f64::NAN);
        let err = corrected_yz_move(&calibration(), &nan_tilt, 10e-6, BeamType::Electron).unwrap_err();
        assert!(matches!(err, HalError::DegenerateGeometry { cosine, .. } if cosine.is_nan()));

        let flat = StagePosition::default();
        for expected_y in [f64::NAN, f64::INFINITY] {
            let err = corrected_yz_move(&calibration(), &flat, expected_y, BeamType::Ion).unwrap_err();
            assert!(matches!(err, HalError::DegenerateGeometry { .. }));
        }
    }

    #[test]
    fn test_pretilt_sign_regimes() {
        let cal = calibration();
        assert_eq!(pretilt_sign(&cal, 0.0), 1.0);
        assert_eq!(pretilt_sign(&cal, 4f64.to_radians()), 1.0);
        assert_eq!(pretilt_sign(&cal, PI), -1.0);
        assert_eq!(pretilt_sign(&cal, PI + 2.0 * TAU), -1.0);
        // neither regime
        assert_eq!(pretilt_sign(&cal, PI / 2.0), 1.0);
    }

    #[test]
    fn test_pretilt_sign_overlapping_references() {
        let cal = SystemCalibration {
            rotation_flat_to_electron: 0.0,
            rotation_flat_to_ion: 6.0,
            ..calibration()
        };
        // closer to ion
        assert_eq!(pretilt_sign(&cal, 5f64.to_radians()), -1.0);
        // closer to electron
        assert_eq!(pretilt_sign(&cal, 1f64.to_radians()), 1.0);
        // exact tie prefers electron
        assert_eq!(pretilt_sign(&cal, 3f64.to_radians()), 1.0);
    }

    #[test]
    fn test_full_corrected_move() {
        let pose = StagePosition::raw(0.0, 0.0, 0.0, 0.0, 6f64.to_radians());
        let delta =
            corrected_stage_move(&calibration(), &pose, 5e-6, 10e-6, BeamType::Electron).unwrap();
        assert_eq!(delta.x, 5e-6);
        assert!((delta.y - 9.945e-6).abs() < 1e-9);
        assert_eq!(delta.r, 0.0);
        assert_eq!(delta.t, 0.0);
    }
}
