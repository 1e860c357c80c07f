//! TESCAN adapter against the simulated Automation server.

use std::time::Duration;

use fibsem_hal::backends::tescan::{Column, StageLimits, TescanStagePosition};
use fibsem_hal::backends::{SimulatedTescan, TescanMicroscope};
use fibsem_hal::error::{LimitBound, StageAxis};
use fibsem_hal::microscope::Microscope;
use fibsem_hal::state::{
    BeamType, ImageSettings, MillingPattern, MillingSettings, PatterningMode, Point, Resolution,
    StagePosition,
};
use fibsem_hal::HalError;

async fn setup() -> (TescanMicroscope, SimulatedTescan) {
    let sim = SimulatedTescan::new();
    let mut scope = TescanMicroscope::new(Box::new(sim.clone()))
        .with_poll_interval(Duration::from_millis(1));
    scope.connect("192.168.0.5", 8300).await.unwrap();
    (scope, sim)
}

#[tokio::test]
async fn stage_position_is_converted_to_metres_and_radians() {
    let (mut scope, sim) = setup().await;
    sim.set_native_position(TescanStagePosition {
        x: 1.0,
        y: -2.0,
        z: 12.5,
        r: 90.0,
        t: 30.0,
    });

    let pos = scope.get_stage_position().await.unwrap();
    assert!((pos.x - 1.0e-3).abs() < 1e-12);
    assert!((pos.y + 2.0e-3).abs() < 1e-12);
    assert!((pos.z - 12.5e-3).abs() < 1e-12);
    assert!((pos.r - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    assert!((pos.t - std::f64::consts::FRAC_PI_6).abs() < 1e-12);
}

#[tokio::test]
async fn lower_limit_violation_reports_axis_and_clamps() {
    let (mut scope, sim) = setup().await;
    sim.set_limits(StageLimits([
        -10.0, 10.0, -10.0, 10.0, 1.0, 20.0, -180.0, 180.0, -10.0, 60.0,
    ]));

    let target = StagePosition::raw(0.0, 0.0, 0.5e-3, 0.0, (-20f64).to_radians());
    let err = scope.move_stage_absolute(&target).await.unwrap_err();
    let violation = err.as_limit_violation().unwrap();

    assert_eq!(violation.axis, StageAxis::Z);
    assert_eq!(violation.bound, LimitBound::Lower);
    assert!((violation.limit - 1.0e-3).abs() < 1e-12);
    assert!((violation.clamped.z - 1.0e-3).abs() < 1e-12);
    assert!((violation.clamped.t - (-10f64).to_radians()).abs() < 1e-12);

    // retrying at the boundary succeeds
    scope.move_stage_absolute(&violation.clamped).await.unwrap();
    assert!((sim.native_position().z - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn relative_move_past_limit_does_not_move() {
    let (mut scope, sim) = setup().await;
    let before = sim.native_position();

    let err = scope
        .move_stage_relative(&StagePosition::translation(0.0, 0.1, 0.0))
        .await
        .unwrap_err();
    assert!(matches!(err, HalError::LimitViolation(_)));
    assert_eq!(sim.native_position(), before);
}

#[tokio::test]
async fn acquisition_selects_channel_and_records_header() {
    let (mut scope, sim) = setup().await;
    sim.set_header(Column::Sem, (0.1, -0.2), (0.002, 0.001));

    let settings = ImageSettings {
        beam_type: BeamType::Electron,
        resolution: Resolution::new(48, 32),
        dwell_time: 500e-9,
        hfw: 10.0,
        ..ImageSettings::default()
    };
    let image = scope.acquire_image(&settings).await.unwrap();

    assert_eq!(sim.detector(Column::Sem), Some(0));
    // clamped to the SEM maximum of 5 mm
    assert!((image.settings.hfw - 5e-3).abs() < 1e-12);
    assert_eq!(image.data.pixels.len(), 48 * 32);

    let electron = &image.state.electron_beam;
    assert_eq!(electron.stigmation, Some(Point::new(0.1, -0.2)));
    let shift = electron.shift.unwrap();
    assert!((shift.x - 2e-6).abs() < 1e-15);
    assert!((shift.y - 1e-6).abs() < 1e-15);
    assert!((electron.dwell_time - 500e-9).abs() < 1e-15);
    assert!(image.state.ion_beam.stigmation.is_none());
}

#[tokio::test]
async fn beam_current_uses_picoamps() {
    let (mut scope, sim) = setup().await;
    let state = scope.get_current_state().await.unwrap();
    assert!((state.ion_beam.beam_current - 20e-12).abs() < 1e-24);

    scope.finish_milling(30e-12).await.unwrap();
    assert!((sim.current_pa(Column::Fib) - 30.0).abs() < 1e-9);
}

#[tokio::test]
async fn drawbeam_layer_carries_settings_and_shapes() {
    let (mut scope, sim) = setup().await;
    let settings = MillingSettings {
        milling_current: 1e-9,
        ..MillingSettings::default()
    };
    scope
        .setup_milling("Si", PatterningMode::Parallel, 100e-6, &settings)
        .await
        .unwrap();
    scope
        .draw_rectangle(&MillingPattern {
            centre_x: 1e-6,
            centre_y: -1e-6,
            width: 8e-6,
            height: 3e-6,
            depth: 2e-6,
            rotation: std::f64::consts::FRAC_PI_4,
            scan_direction: Default::default(),
            cleaning_cross_section: false,
        })
        .await
        .unwrap();

    let layer = scope.layer().unwrap().clone();
    assert!(layer.parallel);
    assert_eq!(layer.spot_size, 5e-8);
    assert_eq!(layer.rate, 3e-3);
    assert_eq!(layer.write_field_size, 100e-6);
    assert!((layer.shapes[0].rotation - 45.0).abs() < 1e-9);

    scope.run_milling(2e-9, false).await.unwrap();
    assert!(sim.is_beam_on(Column::Fib));
    assert!((sim.current_pa(Column::Fib) - 2000.0).abs() < 1e-6);
    assert!(sim.loaded_layer().is_none());

    let jobs = sim.completed_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].beam_current, 2e-9);
    assert_eq!(jobs[0].shapes.len(), 1);
    assert!(scope.layer().unwrap().shapes.is_empty());
}

#[tokio::test]
async fn setup_again_discards_queued_shapes() {
    let (mut scope, _sim) = setup().await;
    let settings = MillingSettings::default();
    scope
        .setup_milling("Si", PatterningMode::Serial, 80e-6, &settings)
        .await
        .unwrap();
    scope
        .draw_rectangle(&MillingPattern {
            centre_x: 0.0,
            centre_y: 0.0,
            width: 1e-6,
            height: 1e-6,
            depth: 1e-6,
            rotation: 0.0,
            scan_direction: Default::default(),
            cleaning_cross_section: false,
        })
        .await
        .unwrap();

    scope
        .setup_milling("Si", PatterningMode::Serial, 80e-6, &settings)
        .await
        .unwrap();
    assert!(scope.layer().unwrap().shapes.is_empty());
}

#[tokio::test]
async fn stable_move_does_not_link() {
    let (mut scope, _sim) = setup().await;
    assert!(!scope.link_stage().await.unwrap());
}
