//! Property-based tests for the stage-motion geometry.
//!
//! Run with: cargo test --test geometry_properties

use std::f64::consts::{PI, TAU};

use fibsem_hal::geometry::{angle_difference, corrected_stage_move, corrected_yz_move, pretilt_sign};
use fibsem_hal::state::{BeamType, StagePosition, SystemCalibration};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

fn arb_angle() -> impl Strategy<Value = f64> {
    -100.0..100.0f64
}

/// Calibrations whose rotation references are at least 10 degrees apart.
fn arb_calibration() -> impl Strategy<Value = SystemCalibration> {
    (0.0..360.0f64, 10.0..=350.0f64, 1.0..40.0f64, 30.0..60.0f64).prop_map(
        |(electron, separation, pretilt, ion_tilt)| SystemCalibration {
            tilt_flat_to_electron: pretilt,
            tilt_flat_to_ion: ion_tilt,
            rotation_flat_to_electron: electron,
            rotation_flat_to_ion: electron + separation,
        },
    )
}

// =============================================================================
// Angle wrap
// =============================================================================

proptest! {
    #[test]
    fn angle_difference_ignores_full_turns(a1 in arb_angle(), a2 in arb_angle()) {
        let base = angle_difference(a1, a2);
        prop_assert!((angle_difference(a1 + TAU, a2) - base).abs() < 1e-9);
        prop_assert!((angle_difference(a1, a2 - TAU) - base).abs() < 1e-9);
    }

    #[test]
    fn angle_difference_is_symmetric(a1 in arb_angle(), a2 in arb_angle()) {
        prop_assert_eq!(angle_difference(a1, a2), angle_difference(a2, a1));
    }

    #[test]
    fn angle_difference_is_bounded(a1 in arb_angle(), a2 in arb_angle()) {
        let d = angle_difference(a1, a2);
        prop_assert!(d >= 0.0);
        prop_assert!(d <= PI + 1e-12);
    }
}

// =============================================================================
// Pre-tilt sign
// =============================================================================

proptest! {
    #[test]
    fn sign_is_positive_at_electron_reference(cal in arb_calibration()) {
        let rotation = cal.rotation_flat_to_electron.to_radians();
        prop_assert_eq!(pretilt_sign(&cal, rotation), 1.0);
    }

    #[test]
    fn sign_is_negative_at_ion_reference(cal in arb_calibration()) {
        let rotation = cal.rotation_flat_to_ion.to_radians();
        prop_assert_eq!(pretilt_sign(&cal, rotation), -1.0);
    }

    #[test]
    fn z_follows_regime(cal in arb_calibration(), dy in 1e-7..1e-4f64) {
        let at_electron = StagePosition::raw(0.0, 0.0, 0.0, cal.rotation_flat_to_electron.to_radians(), 0.0);
        let at_ion = StagePosition::raw(0.0, 0.0, 0.0, cal.rotation_flat_to_ion.to_radians(), 0.0);

        let up = corrected_yz_move(&cal, &at_electron, dy, BeamType::Electron).unwrap();
        let down = corrected_yz_move(&cal, &at_ion, dy, BeamType::Electron).unwrap();

        prop_assert!(up.z > 0.0);
        prop_assert!(down.z < 0.0);
        prop_assert!((up.y - down.y).abs() < 1e-15);
    }

    #[test]
    fn x_passes_through(cal in arb_calibration(), dx in -1e-4..1e-4f64, beam in prop_oneof![Just(BeamType::Electron), Just(BeamType::Ion)]) {
        let current = StagePosition::raw(0.0, 0.0, 0.0, cal.rotation_flat_to_electron.to_radians(), 0.0);
        let delta = corrected_stage_move(&cal, &current, dx, 0.0, beam).unwrap();
        prop_assert_eq!(delta.x, dx);
        prop_assert_eq!(delta.y, 0.0);
        prop_assert_eq!(delta.r, 0.0);
        prop_assert_eq!(delta.t, 0.0);
    }
}

#[test]
fn documented_scenario() {
    let cal = SystemCalibration {
        tilt_flat_to_electron: 6.0,
        tilt_flat_to_ion: 52.0,
        rotation_flat_to_electron: 0.0,
        rotation_flat_to_ion: 180.0,
    };
    let current = StagePosition::raw(0.0, 0.0, 0.0, 0.0, 6f64.to_radians());
    let delta = corrected_yz_move(&cal, &current, 10e-6, BeamType::Electron).unwrap();
    assert!((delta.y - 9.945e-6).abs() < 1e-9);
    assert!((delta.z - 1.045e-6).abs() < 1e-9);
}
