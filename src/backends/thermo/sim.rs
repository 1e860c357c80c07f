//! In-process Thermo emulation.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{PatterningState, ThermoClient};
use crate::backends::sim::{lock, synthetic_frame, SimControl};
use crate::error::{AppResult, HalError};
use crate::state::{
    BeamType, CoordinateSystem, ImageData, MillingPattern, PatterningMode, Point, Resolution,
    StagePosition,
};

/// Number of `patterning_state` polls a started job stays running.
const DEFAULT_POLLS_TO_FINISH: u32 = 2;

#[derive(Debug, Clone)]
struct SimBeam {
    current: f64,
    hfw: f64,
    hfw_limits: (f64, f64),
    resolution: Resolution,
    dwell_time: f64,
    working_distance: f64,
    stigmator: Point,
    shift: Point,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    active_view: Option<BeamType>,
    active_device: Option<BeamType>,
    beams: [SimBeam; 2],
    coordinate_system: CoordinateSystem,
    /// Always stored in the RAW frame.
    stage: StagePosition,
    /// SPECIMEN z = RAW z - offset.
    specimen_z_offset: f64,
    linked: bool,
    default_beam: BeamType,
    application_file: String,
    patterning_mode: PatterningMode,
    patterns: Vec<MillingPattern>,
    patterning: PatterningState,
    polls_remaining: u32,
    polls_to_finish: u32,
}

impl Default for SimState {
    fn default() -> Self {
        let electron = SimBeam {
            current: 50e-12,
            hfw: 150e-6,
            hfw_limits: (1e-6, 2.7e-3),
            resolution: Resolution::default(),
            dwell_time: 1e-6,
            working_distance: 4.0e-3,
            stigmator: Point::default(),
            shift: Point::default(),
        };
        let ion = SimBeam {
            current: 20e-12,
            hfw: 150e-6,
            hfw_limits: (1e-6, 900e-6),
            working_distance: 16.5e-3,
            ..electron.clone()
        };
        Self {
            connected: false,
            active_view: None,
            active_device: None,
            beams: [electron, ion],
            coordinate_system: CoordinateSystem::Specimen,
            stage: StagePosition::raw(0.0, 0.0, 4.0e-3, 0.0, 0.0),
            specimen_z_offset: 1.0e-3,
            linked: false,
            default_beam: BeamType::Electron,
            application_file: String::new(),
            patterning_mode: PatterningMode::Serial,
            patterns: Vec::new(),
            patterning: PatterningState::Idle,
            polls_remaining: 0,
            polls_to_finish: DEFAULT_POLLS_TO_FINISH,
        }
    }
}

/// Simulated Thermo control server.
///
/// Clones share state, so a test can keep a handle after giving one to
/// [`super::ThermoMicroscope`].
///
/// # Example
///
/// ```
/// use fibsem_hal::backends::thermo::{SimulatedThermo, ThermoMicroscope};
/// use fibsem_hal::microscope::Microscope;
///
/// # tokio_test::block_on(async {
/// let sim = SimulatedThermo::new();
/// let mut scope = ThermoMicroscope::new(Box::new(sim.clone()));
/// scope.connect("127.0.0.1", 7520).await.unwrap();
/// assert!(sim.is_connected());
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct SimulatedThermo {
    state: Arc<Mutex<SimState>>,
    control: SimControl,
}

impl SimulatedThermo {
    /// A disconnected simulator with the stage at the origin and z = 4 mm.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency, failure injection and call log.
    pub fn control(&self) -> &SimControl {
        &self.control
    }

    /// Whether a client session is open.
    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Current stage coordinate system.
    pub fn current_coordinate_system(&self) -> CoordinateSystem {
        lock(&self.state).coordinate_system
    }

    /// Stage pose in the RAW frame.
    pub fn raw_position(&self) -> StagePosition {
        lock(&self.state).stage
    }

    /// Teleports the stage.
    pub fn set_raw_position(&self, position: StagePosition) {
        lock(&self.state).stage = StagePosition {
            coordinate_system: CoordinateSystem::Raw,
            ..position
        };
    }

    /// Beam currently shown in the active view.
    pub fn active_view(&self) -> Option<BeamType> {
        lock(&self.state).active_view
    }

    /// Beam currently selected as the imaging device.
    pub fn active_device(&self) -> Option<BeamType> {
        lock(&self.state).active_device
    }

    /// Beam and application file patterns are created with.
    pub fn patterning_defaults(&self) -> (BeamType, String) {
        let state = lock(&self.state);
        (state.default_beam, state.application_file.clone())
    }

    /// hfw limits of `beam`.
    pub fn hfw_limits(&self, beam: BeamType) -> (f64, f64) {
        lock(&self.state).beams[beam.index()].hfw_limits
    }

    /// Beam current of `beam`.
    pub fn beam_current_of(&self, beam: BeamType) -> f64 {
        lock(&self.state).beams[beam.index()].current
    }

    /// Working distance of `beam`.
    pub fn working_distance_of(&self, beam: BeamType) -> f64 {
        lock(&self.state).beams[beam.index()].working_distance
    }

    /// Patterns currently queued.
    pub fn pattern_count(&self) -> usize {
        lock(&self.state).patterns.len()
    }

    /// Current patterning mode.
    pub fn patterning_mode(&self) -> PatterningMode {
        lock(&self.state).patterning_mode
    }

    /// Whether the stage has been linked since the last motion.
    pub fn is_linked(&self) -> bool {
        lock(&self.state).linked
    }

    /// How many status polls a started job takes to finish.
    pub fn set_polls_to_finish(&self, polls: u32) {
        lock(&self.state).polls_to_finish = polls;
    }

    fn with_connected<T>(&self, operation: &'static str, f: impl FnOnce(&mut SimState) -> T) -> AppResult<T> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(HalError::hardware(operation, "client is not connected"));
        }
        Ok(f(&mut state))
    }

    fn with_beam<T>(
        &self,
        operation: &'static str,
        beam: BeamType,
        f: impl FnOnce(&mut SimBeam) -> T,
    ) -> AppResult<T> {
        self.with_connected(operation, |state| f(&mut state.beams[beam.index()]))
    }
}

#[async_trait]
impl ThermoClient for SimulatedThermo {
    async fn connect(&mut self, address: &str, port: u16) -> AppResult<()> {
        self.control.call("connect", format!("{}:{}", address, port)).await?;
        if self.control.connections_refused() {
            return Err(HalError::hardware("connect", "connection refused"));
        }
        lock(&self.state).connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.control.call("disconnect", String::new()).await?;
        lock(&self.state).connected = false;
        Ok(())
    }

    async fn set_active_view(&mut self, beam: BeamType) -> AppResult<()> {
        self.control.call("set_active_view", beam.to_string()).await?;
        self.with_connected("set_active_view", |s| s.active_view = Some(beam))
    }

    async fn set_active_device(&mut self, beam: BeamType) -> AppResult<()> {
        self.control.call("set_active_device", beam.to_string()).await?;
        self.with_connected("set_active_device", |s| s.active_device = Some(beam))
    }

    async fn beam_current(&mut self, beam: BeamType) -> AppResult<f64> {
        self.control.call("beam_current", beam.to_string()).await?;
        self.with_beam("beam_current", beam, |b| b.current)
    }

    async fn set_beam_current(&mut self, beam: BeamType, current: f64) -> AppResult<()> {
        self.control
            .call("set_beam_current", format!("{} {:e}", beam, current))
            .await?;
        self.with_beam("set_beam_current", beam, |b| b.current = current)
    }

    async fn horizontal_field_width(&mut self, beam: BeamType) -> AppResult<f64> {
        self.control.call("horizontal_field_width", beam.to_string()).await?;
        self.with_beam("horizontal_field_width", beam, |b| b.hfw)
    }

    async fn set_horizontal_field_width(&mut self, beam: BeamType, hfw: f64) -> AppResult<()> {
        self.control
            .call("set_horizontal_field_width", format!("{} {:e}", beam, hfw))
            .await?;
        self.with_connected("set_horizontal_field_width", |s| {
            let b = &mut s.beams[beam.index()];
            if hfw < b.hfw_limits.0 || hfw > b.hfw_limits.1 {
                Err(HalError::hardware(
                    "set_horizontal_field_width",
                    format!("{:e} outside [{:e}, {:e}]", hfw, b.hfw_limits.0, b.hfw_limits.1),
                ))
            } else {
                b.hfw = hfw;
                Ok(())
            }
        })?
    }

    async fn horizontal_field_width_limits(&mut self, beam: BeamType) -> AppResult<(f64, f64)> {
        self.control
            .call("horizontal_field_width_limits", beam.to_string())
            .await?;
        self.with_beam("horizontal_field_width_limits", beam, |b| b.hfw_limits)
    }

    async fn scanning_resolution(&mut self, beam: BeamType) -> AppResult<Resolution> {
        self.control.call("scanning_resolution", beam.to_string()).await?;
        self.with_beam("scanning_resolution", beam, |b| b.resolution)
    }

    async fn set_scanning_resolution(&mut self, beam: BeamType, resolution: Resolution) -> AppResult<()> {
        self.control
            .call("set_scanning_resolution", format!("{} {}", beam, resolution))
            .await?;
        self.with_beam("set_scanning_resolution", beam, |b| b.resolution = resolution)
    }

    async fn dwell_time(&mut self, beam: BeamType) -> AppResult<f64> {
        self.control.call("dwell_time", beam.to_string()).await?;
        self.with_beam("dwell_time", beam, |b| b.dwell_time)
    }

    async fn set_dwell_time(&mut self, beam: BeamType, dwell_time: f64) -> AppResult<()> {
        self.control
            .call("set_dwell_time", format!("{} {:e}", beam, dwell_time))
            .await?;
        self.with_beam("set_dwell_time", beam, |b| b.dwell_time = dwell_time)
    }

    async fn working_distance(&mut self, beam: BeamType) -> AppResult<f64> {
        self.control.call("working_distance", beam.to_string()).await?;
        self.with_beam("working_distance", beam, |b| b.working_distance)
    }

    async fn set_working_distance(&mut self, beam: BeamType, working_distance: f64) -> AppResult<()> {
        self.control
            .call("set_working_distance", format!("{} {:e}", beam, working_distance))
            .await?;
        self.with_beam("set_working_distance", beam, |b| {
            b.working_distance = working_distance
        })
    }

    async fn stigmator(&mut self, beam: BeamType) -> AppResult<Point> {
        self.control.call("stigmator", beam.to_string()).await?;
        self.with_beam("stigmator", beam, |b| b.stigmator)
    }

    async fn beam_shift(&mut self, beam: BeamType) -> AppResult<Point> {
        self.control.call("beam_shift", beam.to_string()).await?;
        self.with_beam("beam_shift", beam, |b| b.shift)
    }

    async fn set_beam_shift(&mut self, beam: BeamType, shift: Point) -> AppResult<()> {
        self.control
            .call("set_beam_shift", format!("{} ({:e}, {:e})", beam, shift.x, shift.y))
            .await?;
        self.with_beam("set_beam_shift", beam, |b| b.shift = shift)
    }

    async fn auto_contrast(&mut self, beam: BeamType) -> AppResult<()> {
        self.control.call("auto_contrast", beam.to_string()).await?;
        self.with_connected("auto_contrast", |_| ())
    }

    async fn grab_frame(&mut self, resolution: Resolution, dwell_time: f64) -> AppResult<ImageData> {
        self.control
            .call("grab_frame", format!("{} {:e}", resolution, dwell_time))
            .await?;
        let view = self.with_connected("grab_frame", |s| s.active_view)?;
        if view.is_none() {
            return Err(HalError::hardware("grab_frame", "no active view selected"));
        }
        synthetic_frame(resolution)
    }

    async fn coordinate_system(&mut self) -> AppResult<CoordinateSystem> {
        self.control.call("coordinate_system", String::new()).await?;
        self.with_connected("coordinate_system", |s| s.coordinate_system)
    }

    async fn set_coordinate_system(&mut self, system: CoordinateSystem) -> AppResult<()> {
        self.control
            .call("set_coordinate_system", format!("{:?}", system))
            .await?;
        self.with_connected("set_coordinate_system", |s| s.coordinate_system = system)
    }

    async fn stage_position(&mut self) -> AppResult<StagePosition> {
        self.control.call("stage_position", String::new()).await?;
        self.with_connected("stage_position", |s| match s.coordinate_system {
            CoordinateSystem::Raw => s.stage,
            CoordinateSystem::Specimen => StagePosition {
                z: s.stage.z - s.specimen_z_offset,
                coordinate_system: CoordinateSystem::Specimen,
                ..s.stage
            },
        })
    }

    async fn stage_absolute_move(&mut self, position: &StagePosition) -> AppResult<()> {
        self.control
            .call("stage_absolute_move", position.to_string())
            .await?;
        self.with_connected("stage_absolute_move", |s| {
            let z = match position.coordinate_system {
                CoordinateSystem::Raw => position.z,
                CoordinateSystem::Specimen => position.z + s.specimen_z_offset,
            };
            s.stage = StagePosition {
                z,
                coordinate_system: CoordinateSystem::Raw,
                ..*position
            };
            s.linked = false;
        })
    }

    async fn stage_relative_move(&mut self, delta: &StagePosition) -> AppResult<()> {
        self.control
            .call("stage_relative_move", delta.to_string())
            .await?;
        self.with_connected("stage_relative_move", |s| {
            s.stage = s.stage.offset_by(delta);
            s.linked = false;
        })
    }

    async fn stage_link(&mut self) -> AppResult<bool> {
        self.control.call("stage_link", String::new()).await?;
        self.with_connected("stage_link", |s| {
            s.linked = true;
            true
        })
    }

    async fn set_default_beam(&mut self, beam: BeamType) -> AppResult<()> {
        self.control.call("set_default_beam", beam.to_string()).await?;
        self.with_connected("set_default_beam", |s| s.default_beam = beam)
    }

    async fn set_default_application_file(&mut self, application_file: &str) -> AppResult<()> {
        self.control
            .call("set_default_application_file", application_file.to_string())
            .await?;
        self.with_connected("set_default_application_file", |s| {
            s.application_file = application_file.to_string()
        })
    }

    async fn set_patterning_mode(&mut self, mode: PatterningMode) -> AppResult<()> {
        self.control
            .call("set_patterning_mode", mode.as_str().to_string())
            .await?;
        self.with_connected("set_patterning_mode", |s| s.patterning_mode = mode)
    }

    async fn clear_patterns(&mut self) -> AppResult<()> {
        self.control.call("clear_patterns", String::new()).await?;
        self.with_connected("clear_patterns", |s| s.patterns.clear())
    }

    async fn create_rectangle(&mut self, pattern: &MillingPattern) -> AppResult<()> {
        self.control
            .call("create_rectangle", format!("{:e}x{:e}", pattern.width, pattern.height))
            .await?;
        self.with_connected("create_rectangle", |s| s.patterns.push(pattern.clone()))
    }

    async fn create_cleaning_cross_section(&mut self, pattern: &MillingPattern) -> AppResult<()> {
        self.control
            .call(
                "create_cleaning_cross_section",
                format!("{:e}x{:e}", pattern.width, pattern.height),
            )
            .await?;
        self.with_connected("create_cleaning_cross_section", |s| {
            s.patterns.push(pattern.clone())
        })
    }

    async fn patterning_state(&mut self) -> AppResult<PatterningState> {
        self.control.call("patterning_state", String::new()).await?;
        self.with_connected("patterning_state", |s| {
            if s.patterning == PatterningState::Running {
                if s.polls_remaining == 0 {
                    s.patterning = PatterningState::Idle;
                } else {
                    s.polls_remaining -= 1;
                }
            }
            s.patterning
        })
    }

    async fn start_patterning(&mut self) -> AppResult<()> {
        self.control.call("start_patterning", String::new()).await?;
        self.with_connected("start_patterning", |s| {
            s.patterning = PatterningState::Running;
            s.polls_remaining = s.polls_to_finish;
        })
    }

    async fn run_patterning(&mut self) -> AppResult<()> {
        self.control.call("run_patterning", String::new()).await?;
        self.with_connected("run_patterning", |s| s.patterning = PatterningState::Idle)
    }

    async fn stop_patterning(&mut self) -> AppResult<()> {
        self.control.call("stop_patterning", String::new()).await?;
        self.with_connected("stop_patterning", |s| s.patterning = PatterningState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_specimen_frame_offsets_z() {
        let mut sim = SimulatedThermo::new();
        sim.connect("127.0.0.1", 7520).await.unwrap();

        let specimen = sim.stage_position().await.unwrap();
        sim.set_coordinate_system(CoordinateSystem::Raw).await.unwrap();
        let raw = sim.stage_position().await.unwrap();
        assert!((raw.z - specimen.z - 1.0e-3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_calls_fail_when_disconnected() {
        let mut sim = SimulatedThermo::new();
        assert!(sim.beam_current(BeamType::Electron).await.is_err());
    }

    #[tokio::test]
    async fn test_started_job_drains_after_polls() {
        let mut sim = SimulatedThermo::new();
        sim.connect("127.0.0.1", 7520).await.unwrap();
        sim.set_polls_to_finish(1);
        sim.start_patterning().await.unwrap();
        assert_eq!(sim.patterning_state().await.unwrap(), PatterningState::Running);
        assert_eq!(sim.patterning_state().await.unwrap(), PatterningState::Idle);
    }
}
