//! TESCAN backend.
//!
//! The Automation API speaks millimetres, degrees, picoamps and nanosecond
//! dwell times on two separate columns (SEM and FIB). This adapter converts
//! at the boundary and adds what the vendor leaves out:
//! - absolute moves are checked against the stage travel limits before
//!   anything moves, and rejected with a [`LimitViolation`]
//! - relative moves are read-modify-write, since there is no native call
//! - resolution and dwell time have no readback, so the last values used
//!   per beam are remembered
//! - milling goes through a DrawBeam etching layer built locally and loaded
//!   when the job runs

mod sim;

pub use sim::SimulatedTescan;

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, HalError, LimitBound, LimitViolation, StageAxis};
use crate::microscope::{
    cleanup_result, ImageCache, LogFault, Microscope, MillingLifecycle, MillingState,
};
use crate::state::{
    BeamSettings, BeamType, CoordinateSystem, Image, ImageData, ImageSettings, MicroscopeState,
    MillingPattern, MillingSettings, PatterningMode, Point, Resolution, StagePosition,
};
use crate::units::{
    DEGREES_TO_RADIANS, METRE_TO_MILLIMETRE, MILLIMETRE_TO_METRE, NANO_TO_SI, PICO_TO_SI,
    RADIANS_TO_DEGREES, SI_TO_NANO, SI_TO_PICO,
};

/// Detector channel used for imaging on both columns.
pub const DETECTOR_CHANNEL: u32 = 0;

/// Default interval between DrawBeam status polls while waiting for a job.
pub const DEFAULT_MILLING_POLL_INTERVAL: Duration = Duration::from_millis(200);

const BACKEND: &str = "tescan";

// =============================================================================
// Vendor types
// =============================================================================

/// Electron-optical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// Scanning electron microscope column.
    Sem,
    /// Focused ion beam column.
    Fib,
}

impl From<BeamType> for Column {
    fn from(beam: BeamType) -> Self {
        match beam {
            BeamType::Electron => Column::Sem,
            BeamType::Ion => Column::Fib,
        }
    }
}

impl Column {
    /// Index used for per-column tables.
    pub fn index(&self) -> usize {
        match self {
            Column::Sem => 0,
            Column::Fib => 1,
        }
    }
}

/// Stage pose in vendor units: millimetres and degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TescanStagePosition {
    /// X (mm).
    pub x: f64,
    /// Y (mm).
    pub y: f64,
    /// Z (mm).
    pub z: f64,
    /// Rotation (deg).
    pub r: f64,
    /// Tilt (deg).
    pub t: f64,
}

impl TescanStagePosition {
    /// Converts an interface pose (m, rad).
    pub fn from_interface(position: &StagePosition) -> Self {
        Self {
            x: position.x * METRE_TO_MILLIMETRE,
            y: position.y * METRE_TO_MILLIMETRE,
            z: position.z * METRE_TO_MILLIMETRE,
            r: position.r * RADIANS_TO_DEGREES,
            t: position.t * RADIANS_TO_DEGREES,
        }
    }

    /// Converts to an interface pose (m, rad) in the RAW frame.
    pub fn to_interface(&self) -> StagePosition {
        StagePosition::raw(
            self.x * MILLIMETRE_TO_METRE,
            self.y * MILLIMETRE_TO_METRE,
            self.z * MILLIMETRE_TO_METRE,
            self.r * DEGREES_TO_RADIANS,
            self.t * DEGREES_TO_RADIANS,
        )
    }
}

/// Stage travel limits as reported by `GetLimits`:
/// `[x_min, x_max, y_min, y_max, z_min, z_max, r_min, r_max, t_min, t_max]`
/// in millimetres and degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageLimits(pub [f64; 10]);

impl StageLimits {
    /// `(min, max)` of `axis` in interface units.
    pub fn range(&self, axis: StageAxis) -> (f64, f64) {
        let (idx, scale) = match axis {
            StageAxis::X => (0, MILLIMETRE_TO_METRE),
            StageAxis::Y => (2, MILLIMETRE_TO_METRE),
            StageAxis::Z => (4, MILLIMETRE_TO_METRE),
            StageAxis::R => (6, DEGREES_TO_RADIANS),
            StageAxis::T => (8, DEGREES_TO_RADIANS),
        };
        (self.0[idx] * scale, self.0[idx + 1] * scale)
    }

    /// Checks `position` (interface units) axis by axis in x, y, z, r, t
    /// order. The first out-of-range axis is reported; the clamped payload
    /// has every axis brought into range. NaN is out of range and is reported
    /// against the lower bound.
    pub fn check(&self, position: &StagePosition) -> Result<(), LimitViolation> {
        let mut clamped = *position;
        let mut first = None;

        for axis in StageAxis::ALL {
            let (min, max) = self.range(axis);
            let value = axis_value(&mut clamped, axis);
            let requested = *value;
            let bound = if (min..=max).contains(&requested) {
                None
            } else if requested > max {
                *value = max;
                Some((LimitBound::Upper, max))
            } else {
                *value = min;
                Some((LimitBound::Lower, min))
            };
            if let (None, Some((bound, limit))) = (first, bound) {
                first = Some((axis, bound, requested, limit));
            }
        }

        match first {
            None => Ok(()),
            Some((axis, bound, requested, limit)) => Err(LimitViolation {
                axis,
                bound,
                requested,
                limit,
                clamped,
            }),
        }
    }
}

fn axis_value(position: &mut StagePosition, axis: StageAxis) -> &mut f64 {
    match axis {
        StageAxis::X => &mut position.x,
        StageAxis::Y => &mut position.y,
        StageAxis::Z => &mut position.z,
        StageAxis::R => &mut position.r,
        StageAxis::T => &mut position.t,
    }
}

/// Metadata the vendor attaches to every acquired frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameHeader {
    /// Stigmator (x, y).
    pub stigmator: (f64, f64),
    /// Image shift (x, y) in millimetres.
    pub image_shift: (f64, f64),
}

/// An acquired frame with its header.
#[derive(Debug, Clone, PartialEq)]
pub struct TescanFrame {
    /// Pixels.
    pub image: ImageData,
    /// Column metadata at capture time.
    pub header: FrameHeader,
}

/// One filled rectangle in a DrawBeam layer.
///
/// Geometry in metres, rotation in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct RectangleShape {
    /// Centre x (m).
    pub centre_x: f64,
    /// Centre y (m).
    pub centre_y: f64,
    /// Depth (m).
    pub depth: f64,
    /// Width (m).
    pub width: f64,
    /// Height (m).
    pub height: f64,
    /// Rotation (deg).
    pub rotation: f64,
    /// Polishing cross-section rather than a plain fill.
    pub polish: bool,
}

impl From<&MillingPattern> for RectangleShape {
    fn from(pattern: &MillingPattern) -> Self {
        Self {
            centre_x: pattern.centre_x,
            centre_y: pattern.centre_y,
            depth: pattern.depth,
            width: pattern.width,
            height: pattern.height,
            rotation: pattern.rotation * RADIANS_TO_DEGREES,
            polish: pattern.cleaning_cross_section,
        }
    }
}

/// DrawBeam etching layer. Parameters are SI.
#[derive(Debug, Clone, PartialEq)]
pub struct EtchingLayer {
    /// Layer name.
    pub name: String,
    /// Write field size (m).
    pub write_field_size: f64,
    /// Beam current (A).
    pub beam_current: f64,
    /// Spot size (m).
    pub spot_size: f64,
    /// Volume per dose (m^3/C).
    pub rate: f64,
    /// Dwell time (s).
    pub dwell_time: f64,
    /// Mill all shapes together.
    pub parallel: bool,
    /// Queued shapes.
    pub shapes: Vec<RectangleShape>,
}

/// DrawBeam job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawBeamStatus {
    /// No job running.
    Idle,
    /// Job in progress.
    Running,
    /// Job paused.
    Paused,
}

/// TESCAN Automation API, as seen by the adapter. Vendor units throughout.
#[async_trait]
pub trait TescanClient: Send + Sync {
    /// Opens the Automation session.
    async fn connect(&mut self, address: &str, port: u16) -> AppResult<()>;
    /// Closes the Automation session.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Stops scanning on `column`; required before detector or acquisition calls.
    async fn stop_scan(&mut self, column: Column) -> AppResult<()>;
    /// Assigns the column's secondary-electron detector to `channel`.
    async fn select_detector(&mut self, column: Column, channel: u32) -> AppResult<()>;
    /// Automatic signal (contrast and brightness) on `channel`.
    async fn auto_signal(&mut self, column: Column, channel: u32) -> AppResult<()>;
    /// Field of view (mm).
    async fn view_field(&mut self, column: Column) -> AppResult<f64>;
    /// Sets the field of view (mm).
    async fn set_view_field(&mut self, column: Column, view_field_mm: f64) -> AppResult<()>;
    /// `(min, max)` field of view (mm).
    async fn view_field_limits(&mut self, column: Column) -> AppResult<(f64, f64)>;
    /// Working distance (mm).
    async fn working_distance(&mut self, column: Column) -> AppResult<f64>;
    /// Sets the working distance (mm).
    async fn set_working_distance(&mut self, column: Column, working_distance_mm: f64) -> AppResult<()>;
    /// Probe current (pA).
    async fn probe_current(&mut self, column: Column) -> AppResult<f64>;
    /// Sets the probe current (pA).
    async fn set_probe_current(&mut self, column: Column, current_pa: f64) -> AppResult<()>;
    /// Switches the column's beam on. A no-op when already on.
    async fn beam_on(&mut self, column: Column) -> AppResult<()>;
    /// Scans one frame on `channel` with the dwell time in nanoseconds.
    async fn acquire_image_from_channel(
        &mut self,
        column: Column,
        channel: u32,
        width: u32,
        height: u32,
        dwell_ns: f64,
    ) -> AppResult<TescanFrame>;

    /// Stage pose (mm, deg).
    async fn stage_position(&mut self) -> AppResult<TescanStagePosition>;
    /// Calibrated travel limits of every axis.
    async fn stage_limits(&mut self) -> AppResult<StageLimits>;
    /// Blocks until the stage has arrived.
    async fn stage_move_to(&mut self, position: &TescanStagePosition) -> AppResult<()>;

    /// Loads a DrawBeam layer, replacing any loaded one.
    async fn load_layer(&mut self, layer: &EtchingLayer) -> AppResult<()>;
    /// Starts the loaded layer and returns.
    async fn start(&mut self) -> AppResult<()>;
    /// Aborts the running job.
    async fn stop(&mut self) -> AppResult<()>;
    /// DrawBeam job status.
    async fn status(&mut self) -> AppResult<DrawBeamStatus>;
    /// Unloads the current layer.
    async fn unload_layer(&mut self) -> AppResult<()>;
}

// =============================================================================
// Adapter
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct ScanSettings {
    resolution: Resolution,
    dwell_time: f64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        let defaults = ImageSettings::default();
        Self {
            resolution: defaults.resolution,
            dwell_time: defaults.dwell_time,
        }
    }
}

/// TESCAN adapter.
pub struct TescanMicroscope {
    client: Box<dyn TescanClient>,
    connected: bool,
    images: ImageCache,
    milling: MillingLifecycle,
    layer: Option<EtchingLayer>,
    scan: [ScanSettings; 2],
    headers: [Option<FrameHeader>; 2],
    poll_interval: Duration,
}

impl TescanMicroscope {
    /// Wraps a vendor client. Nothing is opened until [`Microscope::connect`].
    pub fn new(client: Box<dyn TescanClient>) -> Self {
        Self {
            client,
            connected: false,
            images: ImageCache::new(),
            milling: MillingLifecycle::new(),
            layer: None,
            scan: [ScanSettings::default(); 2],
            headers: [None; 2],
            poll_interval: DEFAULT_MILLING_POLL_INTERVAL,
        }
    }

    /// Sets how often a blocking `run_milling` polls DrawBeam.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Layer being built, if milling is configured.
    pub fn layer(&self) -> Option<&EtchingLayer> {
        self.layer.as_ref()
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(HalError::NotConnected)
        }
    }

    async fn working_distance_mm(&mut self, column: Column) -> AppResult<f64> {
        self.client
            .working_distance(column)
            .await
            .log_fault(BACKEND, || format!("working_distance({:?})", column))
    }

    async fn set_probe_current_pa(&mut self, column: Column, current_pa: f64) -> AppResult<()> {
        self.client
            .set_probe_current(column, current_pa)
            .await
            .log_fault(BACKEND, || format!("set_probe_current({:?}, {:.3} pA)", column, current_pa))
    }

    async fn beam_settings(&mut self, beam: BeamType) -> AppResult<BeamSettings> {
        let column = Column::from(beam);
        let scan = self.scan[beam.index()];
        let header = self.headers[beam.index()];
        let working_distance_mm = self.working_distance_mm(column).await?;
        let current_pa = self
            .client
            .probe_current(column)
            .await
            .log_fault(BACKEND, || format!("probe_current({:?})", column))?;
        let view_field_mm = self
            .client
            .view_field(column)
            .await
            .log_fault(BACKEND, || format!("view_field({:?})", column))?;
        Ok(BeamSettings {
            beam_type: beam,
            working_distance: working_distance_mm * MILLIMETRE_TO_METRE,
            beam_current: current_pa * PICO_TO_SI,
            hfw: view_field_mm * MILLIMETRE_TO_METRE,
            resolution: scan.resolution,
            dwell_time: scan.dwell_time,
            stigmation: header.map(|h| Point::new(h.stigmator.0, h.stigmator.1)),
            shift: header.map(|h| {
                Point::new(
                    h.image_shift.0 * MILLIMETRE_TO_METRE,
                    h.image_shift.1 * MILLIMETRE_TO_METRE,
                )
            }),
        })
    }

    async fn restore_beam(&mut self, settings: &BeamSettings) -> AppResult<()> {
        let beam = settings.beam_type;
        let column = Column::from(beam);
        let working_distance_mm = settings.working_distance * METRE_TO_MILLIMETRE;
        self.client
            .set_working_distance(column, working_distance_mm)
            .await
            .log_fault(BACKEND, || {
                format!("set_working_distance({:?}, {:.4} mm)", column, working_distance_mm)
            })?;
        self.set_probe_current_pa(column, settings.beam_current * SI_TO_PICO)
            .await?;
        let view_field_mm = settings.hfw * METRE_TO_MILLIMETRE;
        self.client
            .set_view_field(column, view_field_mm)
            .await
            .log_fault(BACKEND, || {
                format!("set_view_field({:?}, {:.4} mm)", column, view_field_mm)
            })?;
        self.scan[beam.index()] = ScanSettings {
            resolution: settings.resolution,
            dwell_time: settings.dwell_time,
        };
        debug!("Restored {} beam settings", beam);
        Ok(())
    }

    async fn drawbeam_status(&mut self) -> AppResult<DrawBeamStatus> {
        self.client
            .status()
            .await
            .log_fault(BACKEND, || "DrawBeam status()")
    }

    async fn unload_layer(&mut self) -> AppResult<()> {
        self.client
            .unload_layer()
            .await
            .log_fault(BACKEND, || "DrawBeam unload_layer()")
    }

    async fn stop_drawbeam(&mut self) -> AppResult<()> {
        self.client
            .stop()
            .await
            .log_fault(BACKEND, || "DrawBeam stop()")
    }

    /// Unloads the layer and empties its queue after a job ends.
    async fn job_finished(&mut self) -> AppResult<()> {
        self.unload_layer().await?;
        if let Some(layer) = self.layer.as_mut() {
            layer.shapes.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl Microscope for TescanMicroscope {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self, address: &str, port: u16) -> AppResult<()> {
        info!("Connecting to TESCAN microscope at {}:{}", address, port);
        match self.client.connect(address, port).await {
            Ok(()) => {
                self.connected = true;
                info!("Connected to TESCAN microscope at {}:{}", address, port);
                Ok(())
            }
            Err(e) => {
                self.connected = false;
                error!("Unable to connect to TESCAN microscope at {}:{}: {}", address, port, e);
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
        info!("Disconnected from TESCAN microscope");
        Ok(())
    }

    async fn acquire_image(&mut self, settings: &ImageSettings) -> AppResult<Image> {
        self.ensure_connected()?;
        let beam = settings.beam_type;
        let column = Column::from(beam);

        self.client
            .beam_on(column)
            .await
            .log_fault(BACKEND, || format!("beam_on({:?})", column))?;
        self.client
            .stop_scan(column)
            .await
            .log_fault(BACKEND, || format!("stop_scan({:?})", column))?;
        self.client
            .select_detector(column, DETECTOR_CHANNEL)
            .await
            .log_fault(BACKEND, || {
                format!("select_detector({:?}, channel {})", column, DETECTOR_CHANNEL)
            })?;
        if settings.autocontrast {
            self.client
                .auto_signal(column, DETECTOR_CHANNEL)
                .await
                .log_fault(BACKEND, || {
                    format!("auto_signal({:?}, channel {})", column, DETECTOR_CHANNEL)
                })?;
        }

        let (min_mm, max_mm) = self
            .client
            .view_field_limits(column)
            .await
            .log_fault(BACKEND, || format!("view_field_limits({:?})", column))?;
        let requested_mm = settings.hfw * METRE_TO_MILLIMETRE;
        let view_field_mm = requested_mm.clamp(min_mm, max_mm);
        if view_field_mm != requested_mm {
            debug!(
                "Requested view field {:.4} mm outside [{:.4}, {:.4}] mm, using {:.4} mm",
                requested_mm, min_mm, max_mm, view_field_mm
            );
        }
        self.client
            .set_view_field(column, view_field_mm)
            .await
            .log_fault(BACKEND, || {
                format!("set_view_field({:?}, {:.4} mm)", column, view_field_mm)
            })?;
        let hfw = view_field_mm * MILLIMETRE_TO_METRE;

        let dwell_ns = settings.dwell_time * SI_TO_NANO;
        debug!("Dwell {:.3e} s -> {:.1} ns", settings.dwell_time, dwell_ns);
        let frame = self
            .client
            .acquire_image_from_channel(
                column,
                DETECTOR_CHANNEL,
                settings.resolution.width,
                settings.resolution.height,
                dwell_ns,
            )
            .await
            .log_fault(BACKEND, || {
                format!(
                    "AcquireImageFromChannel on {} beam ({}, dwell {:.1} ns)",
                    beam, settings.resolution, dwell_ns
                )
            })?;

        self.scan[beam.index()] = ScanSettings {
            resolution: frame.image.resolution(),
            dwell_time: dwell_ns * NANO_TO_SI,
        };
        self.headers[beam.index()] = Some(frame.header);
        let state = self.get_current_state().await?;

        let image = Image {
            settings: ImageSettings {
                hfw,
                resolution: frame.image.resolution(),
                ..settings.clone()
            },
            data: frame.image,
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
        let column = Column::from(beam);
        self.client
            .auto_signal(column, DETECTOR_CHANNEL)
            .await
            .log_fault(BACKEND, || {
                format!("auto_signal({:?}, channel {})", column, DETECTOR_CHANNEL)
            })?;
        info!("Auto signal triggered on {} beam", beam);
        Ok(())
    }

    async fn reset_beam_shifts(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        debug!("TESCAN exposes no beam shift control; nothing to reset");
        Ok(())
    }

    async fn get_stage_position(&mut self) -> AppResult<StagePosition> {
        self.ensure_connected()?;
        let native = self
            .client
            .stage_position()
            .await
            .log_fault(BACKEND, || "stage_position()")?;
        debug!(
            "Stage at {:.4} mm, {:.4} mm, {:.4} mm, {:.3} deg, {:.3} deg",
            native.x, native.y, native.z, native.r, native.t
        );
        Ok(native.to_interface())
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

        let limits = self
            .client
            .stage_limits()
            .await
            .log_fault(BACKEND, || format!("stage_limits() before move to {}", target))?;
        if let Err(violation) = limits.check(&target) {
            warn!("Rejected stage move to {}: {}", target, violation);
            return Err(HalError::limit(violation));
        }

        info!("Moving stage to {}", target);
        let native = TescanStagePosition::from_interface(&target);
        self.client
            .stage_move_to(&native)
            .await
            .log_fault(BACKEND, || format!("MoveTo {:?}", native))
    }

    async fn move_stage_relative(&mut self, delta: &StagePosition) -> AppResult<()> {
        self.ensure_connected()?;
        let current = self.get_stage_position().await?;
        let target = current.offset_by(delta);
        debug!("Relative move by {} resolves to {}", delta, target);
        self.move_stage_absolute(&target).await
    }

    async fn working_distance(&mut self, beam: BeamType) -> AppResult<f64> {
        self.ensure_connected()?;
        Ok(self.working_distance_mm(Column::from(beam)).await? * MILLIMETRE_TO_METRE)
    }

    async fn set_working_distance(&mut self, beam: BeamType, working_distance: f64) -> AppResult<()> {
        self.ensure_connected()?;
        let column = Column::from(beam);
        let working_distance_mm = working_distance * METRE_TO_MILLIMETRE;
        self.client
            .set_working_distance(column, working_distance_mm)
            .await
            .log_fault(BACKEND, || {
                format!("set_working_distance({:?}, {:.4} mm)", column, working_distance_mm)
            })
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

        self.layer = Some(EtchingLayer {
            name: "Layer".to_string(),
            write_field_size: hfw,
            beam_current: settings.milling_current,
            spot_size: settings.spot_size,
            rate: settings.rate,
            dwell_time: settings.dwell_time,
            parallel: mode != PatterningMode::Serial,
            shapes: Vec::new(),
        });
        self.milling.configured();

        info!(
            "Milling configured: {} mode, write field {:.3e} m",
            mode.as_str(),
            hfw
        );
        debug!(
            "Application file '{}' not used by DrawBeam; layer spot {:.3e} m, rate {:.3e}, dwell {:.3e} s",
            application_file, settings.spot_size, settings.rate, settings.dwell_time
        );
        Ok(())
    }

    async fn draw_rectangle(&mut self, pattern: &MillingPattern) -> AppResult<()> {
        self.ensure_connected()?;
        self.milling.check_draw()?;
        let layer = self
            .layer
            .as_mut()
            .ok_or_else(|| HalError::invalid_transition("draw_rectangle", "no layer"))?;

        let shape = RectangleShape::from(pattern);
        debug!(
            "Queued {:.3e} x {:.3e} m rectangle at ({:.3e}, {:.3e}), {:.2} deg",
            shape.width, shape.height, shape.centre_x, shape.centre_y, shape.rotation
        );
        layer.shapes.push(shape);
        self.milling.pattern_added();
        Ok(())
    }

    async fn run_milling(&mut self, milling_current: f64, asynchronous: bool) -> AppResult<()> {
        self.ensure_connected()?;
        self.milling.check_run()?;
        let mut layer = self
            .layer
            .clone()
            .ok_or_else(|| HalError::invalid_transition("run_milling", "no layer"))?;
        layer.beam_current = milling_current;
        let shapes = layer.shapes.len();

        self.client
            .beam_on(Column::Fib)
            .await
            .log_fault(BACKEND, || "beam_on(Fib)")?;
        self.set_probe_current_pa(Column::Fib, milling_current * SI_TO_PICO)
            .await?;
        self.client
            .load_layer(&layer)
            .await
            .log_fault(BACKEND, || {
                format!("DrawBeam load_layer('{}', {} shapes)", layer.name, shapes)
            })?;
        self.client
            .start()
            .await
            .log_fault(BACKEND, || format!("DrawBeam start() with {} shapes", shapes))?;
        self.milling.started();
        info!(
            "Milling started at {:.3e} A with {} shapes",
            milling_current, shapes
        );

        if asynchronous {
            return Ok(());
        }

        loop {
            if self.drawbeam_status().await? == DrawBeamStatus::Idle {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        self.job_finished().await?;
        self.milling.idle();
        info!("Milling finished");
        Ok(())
    }

    async fn stop_milling(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        self.milling.check_stop()?;
        self.stop_drawbeam().await?;
        self.job_finished().await?;
        self.milling.stopped();
        info!("Milling stopped");
        Ok(())
    }

    async fn milling_state(&mut self) -> AppResult<MillingState> {
        self.ensure_connected()?;
        if self.milling.state() == MillingState::Running
            && self.drawbeam_status().await? == DrawBeamStatus::Idle
        {
            self.job_finished().await?;
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
            if let Err(e) = self.stop_drawbeam().await {
                failures.push(e);
            }
        }
        if let Err(e) = self.unload_layer().await {
            failures.push(e);
        }
        if let Err(e) = self
            .set_probe_current_pa(Column::Fib, imaging_current * SI_TO_PICO)
            .await
        {
            failures.push(e);
        }

        self.layer = None;
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
        info!("Microscope state restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn limits() -> StageLimits {
        StageLimits([-50.0, 50.0, -40.0, 40.0, 0.0, 60.0, -180.0, 180.0, -30.0, 90.0])
    }

    #[test]
    fn test_stage_position_unit_conversion() {
        let native = TescanStagePosition {
            x: 1.5,
            y: -2.0,
            z: 10.0,
            r: 180.0,
            t: 45.0,
        };
        let pos = native.to_interface();
        assert!((pos.x - 1.5e-3).abs() < 1e-15);
        assert!((pos.r - std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(pos.coordinate_system, CoordinateSystem::Raw);

        let back = TescanStagePosition::from_interface(&pos);
        assert!((back.t - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_limits_accept_in_range() {
        let pos = StagePosition::raw(0.01, -0.01, 0.02, 0.5, 0.2);
        assert!(limits().check(&pos).is_ok());
    }

    #[test]
    fn test_limits_report_first_axis_and_clamp_all() {
        let pos = StagePosition::raw(0.0, 0.045, -0.001, 0.0, 100f64.to_radians());
        let violation = limits().check(&pos).unwrap_err();
        assert_eq!(violation.axis, StageAxis::Y);
        assert_eq!(violation.bound, LimitBound::Upper);
        assert!((violation.limit - 0.040).abs() < 1e-12);
        assert!((violation.requested - 0.045).abs() < 1e-12);
        assert!((violation.clamped.y - 0.040).abs() < 1e-12);
        assert_eq!(violation.clamped.z, 0.0);
        assert!((violation.clamped.t - 90f64.to_radians()).abs() < 1e-12);
    }

    #[test]
    fn test_limits_reject_nan() {
        let violation = limits()
            .check(&StagePosition::raw(f64::NAN, 0.0, 0.01, 0.0, 0.0))
            .unwrap_err();
        assert_eq!(violation.axis, StageAxis::X);
        assert_eq!(violation.bound, LimitBound::Lower);
        assert!(violation.requested.is_nan());
        assert!((violation.clamped.x + 0.050).abs() < 1e-12);

        let pos = StagePosition::raw(0.0, 0.0, 0.01, 0.0, f64::NAN);
        assert_eq!(limits().check(&pos).unwrap_err().axis, StageAxis::T);
    }

    #[test]
    fn test_rectangle_rotation_in_degrees() {
        let pattern = MillingPattern {
            centre_x: 1e-6,
            centre_y: 0.0,
            width: 10e-6,
            height: 2e-6,
            depth: 1e-6,
            rotation: std::f64::consts::FRAC_PI_2,
            scan_direction: Default::default(),
            cleaning_cross_section: true,
        };
        let shape = RectangleShape::from(&pattern);
        assert!((shape.rotation - 90.0).abs() < 1e-9);
        assert!(shape.polish);
        assert_eq!(shape.width, 10e-6);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_absolute_move_outside_limits_does_not_move() {
        let sim = SimulatedTescan::new();
        let mut scope = TescanMicroscope::new(Box::new(sim.clone()));
        scope.connect("127.0.0.1", 8300).await.unwrap();
        let before = sim.native_position();

        let err = scope
            .move_stage_absolute(&StagePosition::raw(1.0, 0.0, 0.01, 0.0, 0.0))
            .await
            .unwrap_err();
        let violation = err.as_limit_violation().unwrap();
        assert_eq!(violation.axis, StageAxis::X);
        assert_eq!(violation.bound, LimitBound::Upper);
        assert_eq!(sim.native_position(), before);
        assert!(!sim
            .control()
            .call_log()
            .iter()
            .any(|c| c.starts_with("stage_move_to")));
        assert!(logs_contain("upper x limit reached"));
    }

    async fn connected() -> (TescanMicroscope, SimulatedTescan) {
        let sim = SimulatedTescan::new();
        let mut scope = TescanMicroscope::new(Box::new(sim.clone()));
        scope.connect("127.0.0.1", 8300).await.unwrap();
        (scope, sim)
    }

    #[tokio::test]
    async fn test_nan_move_never_reaches_stage() {
        let (mut scope, sim) = connected().await;
        let before = sim.native_position();

        let err = scope
            .move_stage_absolute(&StagePosition::raw(f64::NAN, 0.0, 0.01, 0.0, 0.0))
            .await
            .unwrap_err();
        assert_eq!(err.as_limit_violation().unwrap().axis, StageAxis::X);
        assert_eq!(sim.native_position(), before);
        assert!(!sim
            .control()
            .call_log()
            .iter()
            .any(|c| c.starts_with("stage_move_to")));
    }

    #[tokio::test]
    async fn test_ion_acquire_switches_beam_on() {
        let (mut scope, sim) = connected().await;
        assert!(!sim.is_beam_on(Column::Fib));

        let settings = ImageSettings {
            beam_type: BeamType::Ion,
            resolution: Resolution::new(16, 16),
            ..ImageSettings::default()
        };
        scope.acquire_image(&settings).await.unwrap();
        assert!(sim.is_beam_on(Column::Fib));

        let log = sim.control().call_log();
        let beam_on = log.iter().position(|c| c == "beam_on: FIB").unwrap();
        let stop_scan = log.iter().position(|c| c == "stop_scan: FIB").unwrap();
        assert!(beam_on < stop_scan);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_milling_fault_is_logged() {
        let (mut scope, sim) = connected().await;
        scope
            .setup_milling("Si", PatterningMode::Serial, 80e-6, &MillingSettings::default())
            .await
            .unwrap();
        sim.control().inject_failure("load_layer");

        let result = scope.run_milling(2e-9, true).await;
        assert!(matches!(
            result,
            Err(HalError::Hardware { operation: "load_layer", .. })
        ));
        assert!(logs_contain("tescan DrawBeam load_layer('Layer', 0 shapes) failed"));
        assert!(logs_contain("Injected failure"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_restore_fault_is_logged_with_arguments() {
        let (mut scope, sim) = connected().await;
        let state = scope.get_current_state().await.unwrap();
        sim.control().inject_failure("set_working_distance");

        assert!(scope.set_microscope_state(&state).await.is_err());
        assert!(logs_contain("ERROR"));
        assert!(logs_contain("tescan set_working_distance(Sem"));
        assert!(logs_contain("Injected failure"));
    }

    #[tokio::test]
    async fn test_finish_milling_when_idle_and_disconnected() {
        let mut scope = TescanMicroscope::new(Box::new(SimulatedTescan::new()));
        scope.finish_milling(20e-12).await.unwrap();
        assert_eq!(scope.milling.state(), MillingState::Idle);
        assert!(scope.layer().is_none());
    }

    #[tokio::test]
    async fn test_acquire_uses_vendor_units() {
        let sim = SimulatedTescan::new();
        let mut scope = TescanMicroscope::new(Box::new(sim.clone()));
        scope.connect("127.0.0.1", 8300).await.unwrap();

        let settings = ImageSettings {
            beam_type: BeamType::Ion,
            resolution: Resolution::new(32, 16),
            dwell_time: 2e-6,
            hfw: 100e-6,
            ..ImageSettings::default()
        };
        let image = scope.acquire_image(&settings).await.unwrap();
        assert!((sim.view_field_mm(Column::Fib) - 0.1).abs() < 1e-12);
        assert_eq!(image.state.ion_beam.resolution, Resolution::new(32, 16));
        assert!((image.state.ion_beam.dwell_time - 2e-6).abs() < 1e-15);
        assert!(sim
            .control()
            .call_log()
            .iter()
            .any(|c| c == "acquire_image_from_channel: FIB ch0 32x16 2000ns"));
    }
}
