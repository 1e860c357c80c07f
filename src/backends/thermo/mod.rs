//! Thermo Fisher backend.
//!
//! The vendor API works in SI units, so no scaling happens here. What the
//! adapter does normalise:
//! - the stage defaults to the SPECIMEN frame; reads switch to RAW and back
//! - imaging needs the active view and device set to the beam first
//! - hfw requests are clamped to the beam's reported limits
//!
//! Stage travel limits are left to the vendor.

mod sim;

pub use sim::SimulatedThermo;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, HalError};
use crate::microscope::{
    cleanup_result, ImageCache, LogFault, Microscope, MillingLifecycle, MillingState,
};
use crate::state::{
    BeamSettings, BeamType, CoordinateSystem, Image, ImageData, ImageSettings, MicroscopeState,
    MillingPattern, MillingSettings, PatterningMode, Point, Resolution, StagePosition,
};

/// State of the vendor patterning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatterningState {
    /// Nothing running.
    Idle,
    /// Working through the queue.
    Running,
    /// Paused by the operator.
    Paused,
}

const BACKEND: &str = "thermo";

/// Thermo control API, as seen by the adapter.
///
/// Quantities are SI. Per-beam calls address the beam's column directly;
/// `grab_frame` images on the active view.
#[async_trait]
pub trait ThermoClient: Send + Sync {
    /// Opens the control session.
    async fn connect(&mut self, address: &str, port: u16) -> AppResult<()>;
    /// Closes the control session.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Routes view-level calls such as `grab_frame` to `beam`.
    async fn set_active_view(&mut self, beam: BeamType) -> AppResult<()>;
    /// Selects the detector device paired with `beam`.
    async fn set_active_device(&mut self, beam: BeamType) -> AppResult<()>;

    /// Beam current (A).
    async fn beam_current(&mut self, beam: BeamType) -> AppResult<f64>;
    /// Sets the beam current (A).
    async fn set_beam_current(&mut self, beam: BeamType, current: f64) -> AppResult<()>;
    /// Horizontal field width (m).
    async fn horizontal_field_width(&mut self, beam: BeamType) -> AppResult<f64>;
    /// Sets the horizontal field width (m).
    async fn set_horizontal_field_width(&mut self, beam: BeamType, hfw: f64) -> AppResult<()>;
    /// `(min, max)` hfw for `beam` (m).
    async fn horizontal_field_width_limits(&mut self, beam: BeamType) -> AppResult<(f64, f64)>;
    /// Scan resolution.
    async fn scanning_resolution(&mut self, beam: BeamType) -> AppResult<Resolution>;
    /// Sets the scan resolution.
    async fn set_scanning_resolution(&mut self, beam: BeamType, resolution: Resolution) -> AppResult<()>;
    /// Per-pixel dwell time (s).
    async fn dwell_time(&mut self, beam: BeamType) -> AppResult<f64>;
    /// Sets the per-pixel dwell time (s).
    async fn set_dwell_time(&mut self, beam: BeamType, dwell_time: f64) -> AppResult<()>;
    /// Working distance (m).
    async fn working_distance(&mut self, beam: BeamType) -> AppResult<f64>;
    /// Sets the working distance (m).
    async fn set_working_distance(&mut self, beam: BeamType, working_distance: f64) -> AppResult<()>;
    /// Stigmator setting.
    async fn stigmator(&mut self, beam: BeamType) -> AppResult<Point>;
    /// Beam shift (m).
    async fn beam_shift(&mut self, beam: BeamType) -> AppResult<Point>;
    /// Sets the beam shift (m).
    async fn set_beam_shift(&mut self, beam: BeamType, shift: Point) -> AppResult<()>;
    /// Runs the vendor's automatic contrast and brightness routine.
    async fn auto_contrast(&mut self, beam: BeamType) -> AppResult<()>;

    /// Grabs one frame on the active view.
    async fn grab_frame(&mut self, resolution: Resolution, dwell_time: f64) -> AppResult<ImageData>;

    /// Frame the stage currently reports in.
    async fn coordinate_system(&mut self) -> AppResult<CoordinateSystem>;
    /// Switches the stage reporting frame.
    async fn set_coordinate_system(&mut self, system: CoordinateSystem) -> AppResult<()>;
    /// Stage pose in the current coordinate system.
    async fn stage_position(&mut self) -> AppResult<StagePosition>;
    /// Absolute move in the position's own coordinate system. Blocks until done.
    async fn stage_absolute_move(&mut self, position: &StagePosition) -> AppResult<()>;
    /// Relative move. Blocks until done.
    async fn stage_relative_move(&mut self, delta: &StagePosition) -> AppResult<()>;
    /// Couples stage z to the electron working distance.
    async fn stage_link(&mut self) -> AppResult<bool>;

    /// Beam that new patterns are milled with.
    async fn set_default_beam(&mut self, beam: BeamType) -> AppResult<()>;
    /// Application file that supplies the layer parameters of new patterns.
    async fn set_default_application_file(&mut self, application_file: &str) -> AppResult<()>;
    /// Serial or parallel execution of the queue.
    async fn set_patterning_mode(&mut self, mode: PatterningMode) -> AppResult<()>;
    /// Empties the pattern queue.
    async fn clear_patterns(&mut self) -> AppResult<()>;
    /// Queues a regular rectangle.
    async fn create_rectangle(&mut self, pattern: &MillingPattern) -> AppResult<()>;
    /// Queues a cleaning cross-section.
    async fn create_cleaning_cross_section(&mut self, pattern: &MillingPattern) -> AppResult<()>;
    /// Current state of the patterning engine.
    async fn patterning_state(&mut self) -> AppResult<PatterningState>;
    /// Starts the queue and returns.
    async fn start_patterning(&mut self) -> AppResult<()>;
    /// Runs the queue to completion.
    async fn run_patterning(&mut self) -> AppResult<()>;
    /// Aborts the running queue.
    async fn stop_patterning(&mut self) -> AppResult<()>;
}

/// Thermo adapter.
pub struct ThermoMicroscope {
    client: Box<dyn ThermoClient>,
    connected: bool,
    images: ImageCache,
    milling: MillingLifecycle,
}

impl ThermoMicroscope {
    /// Wraps a vendor client. Nothing is opened until [`Microscope::connect`].
    pub fn new(client: Box<dyn ThermoClient>) -> Self {
        Self {
            client,
            connected: false,
            images: ImageCache::new(),
            milling: MillingLifecycle::new(),
        }
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(HalError::NotConnected)
        }
    }

    async fn beam_settings(&mut self, beam: BeamType) -> AppResult<BeamSettings> {
        Ok(BeamSettings {
            beam_type: beam,
            working_distance: self
                .client
                .working_distance(beam)
                .await
                .log_fault(BACKEND, || format!("working_distance({})", beam))?,
            beam_current: self
                .client
                .beam_current(beam)
                .await
                .log_fault(BACKEND, || format!("beam_current({})", beam))?,
            hfw: self
                .client
                .horizontal_field_width(beam)
                .await
                .log_fault(BACKEND, || format!("horizontal_field_width({})", beam))?,
            resolution: self
                .client
                .scanning_resolution(beam)
                .await
                .log_fault(BACKEND, || format!("scanning_resolution({})", beam))?,
            dwell_time: self
                .client
                .dwell_time(beam)
                .await
                .log_fault(BACKEND, || format!("dwell_time({})", beam))?,
            stigmation: Some(
                self.client
                    .stigmator(beam)
                    .await
                    .log_fault(BACKEND, || format!("stigmator({})", beam))?,
            ),
            shift: Some(
                self.client
                    .beam_shift(beam)
                    .await
                    .log_fault(BACKEND, || format!("beam_shift({})", beam))?,
            ),
        })
    }

    async fn restore_beam(&mut self, settings: &BeamSettings) -> AppResult<()> {
        let beam = settings.beam_type;
        self.client
            .set_working_distance(beam, settings.working_distance)
            .await
            .log_fault(BACKEND, || {
                format!("set_working_distance({}, {:.3e} m)", beam, settings.working_distance)
            })?;
        self.client
            .set_beam_current(beam, settings.beam_current)
            .await
            .log_fault(BACKEND, || {
                format!("set_beam_current({}, {:.3e} A)", beam, settings.beam_current)
            })?;
        self.client
            .set_horizontal_field_width(beam, settings.hfw)
            .await
            .log_fault(BACKEND, || {
                format!("set_horizontal_field_width({}, {:.3e} m)", beam, settings.hfw)
            })?;
        self.client
            .set_scanning_resolution(beam, settings.resolution)
            .await
            .log_fault(BACKEND, || {
                format!("set_scanning_resolution({}, {})", beam, settings.resolution)
            })?;
        self.client
            .set_dwell_time(beam, settings.dwell_time)
            .await
            .log_fault(BACKEND, || {
                format!("set_dwell_time({}, {:.3e} s)", beam, settings.dwell_time)
            })?;
        debug!("Restored {} beam settings", beam);
        Ok(())
    }

    async fn select_view(&mut self, beam: BeamType) -> AppResult<()> {
        self.client
            .set_active_view(beam)
            .await
            .log_fault(BACKEND, || format!("set_active_view({})", beam))
    }

    async fn set_stage_frame(&mut self, system: CoordinateSystem) -> AppResult<()> {
        self.client
            .set_coordinate_system(system)
            .await
            .log_fault(BACKEND, || format!("set_coordinate_system({:?})", system))
    }

    async fn clear_queue(&mut self) -> AppResult<()> {
        self.client
            .clear_patterns()
            .await
            .log_fault(BACKEND, || "clear_patterns()")
    }

    async fn set_ion_current(&mut self, current: f64) -> AppResult<()> {
        self.client
            .set_beam_current(BeamType::Ion, current)
            .await
            .log_fault(BACKEND, || format!("set_beam_current(ION, {:.3e} A)", current))
    }

    async fn set_mode(&mut self, mode: PatterningMode) -> AppResult<()> {
        self.client
            .set_patterning_mode(mode)
            .await
            .log_fault(BACKEND, || format!("set_patterning_mode({})", mode.as_str()))
    }

    async fn stop_queue(&mut self) -> AppResult<()> {
        self.client
            .stop_patterning()
            .await
            .log_fault(BACKEND, || "stop_patterning()")
    }
}

#[async_trait]
impl Microscope for ThermoMicroscope {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self, address: &str, port: u16) -> AppResult<()> {
        info!("Connecting to Thermo microscope at {}:{}", address, port);
        match self.client.connect(address, port).await {
            Ok(()) => {
                self.connected = true;
                info!("Connected to Thermo microscope at {}:{}", address, port);
                Ok(())
            }
            Err(e) => {
                self.connected = false;
                error!("Unable to connect to Thermo microscope at {}:{}: {}", address, port, e);
                Err(HalError::Connection {
                    address: address.to_string(),
                    port,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.client
            .disconnect()
            .await
            .log_fault(BACKEND, || "disconnect()")?;
        self.connected = false;
        info!("Disconnected from Thermo microscope");
        Ok(())
    }

    async fn acquire_image(&mut self, settings: &ImageSettings) -> AppResult<Image> {
        self.ensure_connected()?;
        let beam = settings.beam_type;

        self.select_view(beam).await?;
        self.client
            .set_active_device(beam)
            .await
            .log_fault(BACKEND, || format!("set_active_device({})", beam))?;
        if settings.autocontrast {
            self.client
                .auto_contrast(beam)
                .await
                .log_fault(BACKEND, || format!("auto_contrast({})", beam))?;
        }

        let (min_hfw, max_hfw) = self
            .client
            .horizontal_field_width_limits(beam)
            .await
            .log_fault(BACKEND, || format!("horizontal_field_width_limits({})", beam))?;
        let hfw = settings.hfw.clamp(min_hfw, max_hfw);
        if hfw != settings.hfw {
            debug!(
                "Requested hfw {:.3e} m outside [{:.3e}, {:.3e}], using {:.3e} m",
                settings.hfw, min_hfw, max_hfw, hfw
            );
        }
        self.client
            .set_horizontal_field_width(beam, hfw)
            .await
            .log_fault(BACKEND, || format!("set_horizontal_field_width({}, {:.3e} m)", beam, hfw))?;

        let data = self
            .client
            .grab_frame(settings.resolution, settings.dwell_time)
            .await
            .log_fault(BACKEND, || {
                format!(
                    "grab_frame on {} beam ({}, dwell {:.3e} s)",
                    beam, settings.resolution, settings.dwell_time
                )
            })?;
        let state = self.get_current_state().await?;

        let image = Image {
            settings: ImageSettings {
                hfw,
                resolution: data.resolution(),
                ..settings.clone()
            },
            data,
            state,
        };
        self.images.store(image.clone());
        info!("Acquired {} image ({})", beam, image.settings.resolution);
        Ok(image)
    }

    async fn last_image(&self, beam: BeamType) -> AppResult<Image> {
        self.ensure_connected()?;
        self.images.latest(beam)
    }

    async fn autocontrast(&mut self, beam: BeamType) -> AppResult<()> {
        self.ensure_connected()?;
        self.select_view(beam).await?;
        self.client
            .auto_contrast(beam)
            .await
            .log_fault(BACKEND, || format!("auto_contrast({})", beam))?;
        info!("Auto contrast triggered on {} beam", beam);
        Ok(())
    }

    async fn reset_beam_shifts(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        for beam in BeamType::ALL {
            self.client
                .set_beam_shift(beam, Point::default())
                .await
                .log_fault(BACKEND, || format!("set_beam_shift({}, (0, 0))", beam))?;
        }
        debug!("Beam shifts reset");
        Ok(())
    }

    async fn get_stage_position(&mut self) -> AppResult<StagePosition> {
        self.ensure_connected()?;
        self.set_stage_frame(CoordinateSystem::Raw).await?;
        let read = self
            .client
            .stage_position()
            .await
            .log_fault(BACKEND, || "stage_position()");
        let restore = self.set_stage_frame(CoordinateSystem::Specimen).await;

        let position = read?;
        restore?;
        Ok(StagePosition {
            coordinate_system: CoordinateSystem::Raw,
            ..position
        })
    }

    async fn get_current_state(&mut self) -> AppResult<MicroscopeState> {
        self.ensure_connected()?;
        let absolute_position = self.get_stage_position().await?;
        let electron_beam = self.beam_settings(BeamType::Electron).await?;
        let ion_beam = self.beam_settings(BeamType::Ion).await?;
        Ok(MicroscopeState {
            timestamp: Utc::now(),
            absolute_position,
            electron_beam,
            ion_beam,
        })
    }

    async fn move_stage_absolute(&mut self, position: &StagePosition) -> AppResult<()> {
        self.ensure_connected()?;
        let target = StagePosition {
            coordinate_system: CoordinateSystem::Raw,
            ..*position
        };
        info!("Moving stage to {}", target);
        self.client
            .stage_absolute_move(&target)
            .await
            .log_fault(BACKEND, || format!("Absolute stage move to {}", target))
    }

    async fn move_stage_relative(&mut self, delta: &StagePosition) -> AppResult<()> {
        self.ensure_connected()?;
        let delta = StagePosition {
            coordinate_system: CoordinateSystem::Raw,
            ..*delta
        };
        info!("Moving stage by {}", delta);
        self.client
            .stage_relative_move(&delta)
            .await
            .log_fault(BACKEND, || format!("Relative stage move by {}", delta))
    }

    async fn working_distance(&mut self, beam: BeamType) -> AppResult<f64> {
        self.ensure_connected()?;
        self.client
            .working_distance(beam)
            .await
            .log_fault(BACKEND, || format!("working_distance({})", beam))
    }

    async fn set_working_distance(&mut self, beam: BeamType, working_distance: f64) -> AppResult<()> {
        self.ensure_connected()?;
        self.client
            .set_working_distance(beam, working_distance)
            .await
            .log_fault(BACKEND, || {
                format!("set_working_distance({}, {:.3e} m)", beam, working_distance)
            })
    }

    async fn link_stage(&mut self) -> AppResult<bool> {
        self.ensure_connected()?;
        let linked = self
            .client
            .stage_link()
            .await
            .log_fault(BACKEND, || "stage_link()")?;
        debug!("Stage link: {}", linked);
        Ok(linked)
    }

    async fn setup_milling(
        &mut self,
        application_file: &str,
        mode: PatterningMode,
        hfw: f64,
        settings: &MillingSettings,
    ) -> AppResult<()> {
        self.ensure_connected()?;
        self.milling.check_setup()?;

        self.select_view(BeamType::Ion).await?;
        self.client
            .set_default_beam(BeamType::Ion)
            .await
            .log_fault(BACKEND, || "set_default_beam(ION)")?;
        self.client
            .set_default_application_file(application_file)
            .await
            .log_fault(BACKEND, || {
                format!("set_default_application_file('{}')", application_file)
            })?;
        self.set_mode(mode).await?;
        self.clear_queue().await?;
        self.client
            .set_horizontal_field_width(BeamType::Ion, hfw)
            .await
            .log_fault(BACKEND, || format!("set_horizontal_field_width(ION, {:.3e} m)", hfw))?;

        self.milling.configured();
        info!(
            "Milling configured: application file '{}', {} mode, hfw {:.3e} m",
            application_file,
            mode.as_str(),
            hfw
        );
        debug!(
            "Layer parameters come from the application file; ignoring spot {:.3e} m, rate {:.3e}, dwell {:.3e} s",
            settings.spot_size, settings.rate, settings.dwell_time
        );
        Ok(())
    }

    async fn draw_rectangle(&mut self, pattern: &MillingPattern) -> AppResult<()> {
        self.ensure_connected()?;
        self.milling.check_draw()?;

        if pattern.cleaning_cross_section {
            self.client
                .create_cleaning_cross_section(pattern)
                .await
                .log_fault(BACKEND, || format!("create_cleaning_cross_section({:?})", pattern))?;
        } else {
            self.client
                .create_rectangle(pattern)
                .await
                .log_fault(BACKEND, || format!("create_rectangle({:?})", pattern))?;
        }

        self.milling.pattern_added();
        debug!(
            "Queued {:.3e} x {:.3e} m pattern at ({:.3e}, {:.3e})",
            pattern.width, pattern.height, pattern.centre_x, pattern.centre_y
        );
        Ok(())
    }

    async fn run_milling(&mut self, milling_current: f64, asynchronous: bool) -> AppResult<()> {
        self.ensure_connected()?;
        self.milling.check_run()?;

        self.select_view(BeamType::Ion).await?;
        self.set_ion_current(milling_current).await?;

        info!(
            "Running milling at {:.3e} A ({})",
            milling_current,
            if asynchronous { "asynchronous" } else { "blocking" }
        );
        if asynchronous {
            self.client
                .start_patterning()
                .await
                .log_fault(BACKEND, || format!("start_patterning() at {:.3e} A", milling_current))?;
            self.milling.started();
        } else {
            self.client
                .run_patterning()
                .await
                .log_fault(BACKEND, || format!("run_patterning() at {:.3e} A", milling_current))?;
            self.clear_queue().await?;
            self.milling.idle();
            info!("Milling finished");
        }
        Ok(())
    }

    async fn stop_milling(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        self.milling.check_stop()?;
        self.stop_queue().await?;
        self.clear_queue().await?;
        self.milling.stopped();
        info!("Milling stopped");
        Ok(())
    }

    async fn milling_state(&mut self) -> AppResult<MillingState> {
        self.ensure_connected()?;
        if self.milling.state() == MillingState::Running
            && self
                .client
                .patterning_state()
                .await
                .log_fault(BACKEND, || "patterning_state()")?
                == PatterningState::Idle
        {
            self.clear_queue().await?;
            self.milling.idle();
            info!("Milling finished");
        }
        Ok(self.milling.state())
    }

    async fn finish_milling(&mut self, imaging_current: f64) -> AppResult<()> {
        if !self.connected && self.milling.state() == MillingState::Idle {
            debug!("Milling already idle on a disconnected adapter; nothing to clean up");
            return Ok(());
        }
        self.ensure_connected()?;
        let mut failures = Vec::new();

        if self.milling.state() == MillingState::Running {
            if let Err(e) = self.stop_queue().await {
                failures.push(e);
            }
        }
        if let Err(e) = self.clear_queue().await {
            failures.push(e);
        }
        if let Err(e) = self.set_ion_current(imaging_current).await {
            failures.push(e);
        }
        if let Err(e) = self.set_mode(PatterningMode::Serial).await {
            failures.push(e);
        }

        self.milling.idle();
        if failures.is_empty() {
            info!("Milling cleanup complete, imaging current {:.3e} A", imaging_current);
        } else {
            warn!("Milling cleanup finished with {} failed step(s)", failures.len());
        }
        cleanup_result(failures)
    }

    async fn set_microscope_state(&mut self, state: &MicroscopeState) -> AppResult<()> {
        self.ensure_connected()?;
        info!("Restoring microscope state from {}", state.timestamp);
        self.move_stage_absolute(&state.absolute_position).await?;
        self.restore_beam(&state.electron_beam).await?;
        self.restore_beam(&state.ion_beam).await?;
        self.client
            .stage_link()
            .await
            .log_fault(BACKEND, || "stage_link()")?;
        info!("Microscope state restored");
        Ok(())
    }
}
