//! Microscope capability interface.
//!
//! [`Microscope`] is the contract every vendor backend implements. Workflow
//! code holds a `Box<dyn Microscope>` (see [`crate::backends::create_microscope`])
//! and never branches on vendor identity.
//!
//! ## Concurrency
//!
//! Every operation takes `&mut self`: one adapter owns one vendor session, and
//! the session is not reentrant, so the borrow checker enforces at most one
//! in-flight command per adapter. Operations complete when the vendor
//! acknowledges, except `run_milling(.., true)` which returns as soon as the
//! job has started; poll [`Microscope::milling_state`] before touching the ion
//! beam again. A running job is aborted with [`Microscope::stop_milling`], not
//! by dropping futures.
//!
//! ## Milling lifecycle
//!
//! ```text
//! Idle --setup_milling--> Configured --draw_rectangle--> Configured
//! Configured --run_milling(async)--> Running --(job drained)--> Idle
//! Configured --run_milling(blocking)--> Idle
//! Configured | Running --finish_milling--> Idle
//! ```

use async_trait::async_trait;
use std::fmt;

use crate::config::MicroscopeSettings;
use crate::error::{AppResult, HalError};
use crate::geometry;
use crate::state::{
    BeamType, Image, ImageSettings, MicroscopeState, MillingPattern, MillingSettings,
    PatterningMode, StagePosition,
};

// =============================================================================
// Milling lifecycle
// =============================================================================

/// Where an adapter is in the milling sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MillingState {
    /// No layer configured.
    Idle,
    /// Layer configured; holds the number of queued patterns.
    Configured {
        /// Patterns queued so far.
        patterns: usize,
    },
    /// Job started asynchronously and not yet observed to finish.
    Running,
}

impl fmt::Display for MillingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MillingState::Idle => f.write_str("Idle"),
            MillingState::Configured { patterns } => {
                write!(f, "Configured ({} patterns)", patterns)
            }
            MillingState::Running => f.write_str("Running"),
        }
    }
}

/// Milling state machine shared by the backends.
///
/// Backends check the transition first, talk to the vendor, then commit.
#[derive(Debug, Clone)]
pub struct MillingLifecycle {
    state: MillingState,
}

impl Default for MillingLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl MillingLifecycle {
    /// Starts idle.
    pub fn new() -> Self {
        Self {
            state: MillingState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> MillingState {
        self.state
    }

    /// `setup_milling` is valid from Idle or Configured.
    pub fn check_setup(&self) -> AppResult<()> {
        match self.state {
            MillingState::Idle | MillingState::Configured { .. } => Ok(()),
            MillingState::Running => Err(HalError::invalid_transition("setup_milling", self.state)),
        }
    }

    /// Enters Configured with an empty pattern queue.
    pub fn configured(&mut self) {
        self.state = MillingState::Configured { patterns: 0 };
    }

    /// `draw_rectangle` is valid only while Configured.
    pub fn check_draw(&self) -> AppResult<()> {
        match self.state {
            MillingState::Configured { .. } => Ok(()),
            _ => Err(HalError::invalid_transition("draw_rectangle", self.state)),
        }
    }

    /// Records one more queued pattern.
    pub fn pattern_added(&mut self) {
        if let MillingState::Configured { patterns } = self.state {
            self.state = MillingState::Configured {
                patterns: patterns + 1,
            };
        }
    }

    /// `run_milling` is valid only while Configured.
    pub fn check_run(&self) -> AppResult<()> {
        match self.state {
            MillingState::Configured { .. } => Ok(()),
            _ => Err(HalError::invalid_transition("run_milling", self.state)),
        }
    }

    /// Job started without waiting.
    pub fn started(&mut self) {
        self.state = MillingState::Running;
    }

    /// `stop_milling` is valid only while Running.
    pub fn check_stop(&self) -> AppResult<()> {
        match self.state {
            MillingState::Running => Ok(()),
            _ => Err(HalError::invalid_transition("stop_milling", self.state)),
        }
    }

    /// Job aborted; the layer stays configured but its queue is gone.
    pub fn stopped(&mut self) {
        self.state = MillingState::Configured { patterns: 0 };
    }

    /// Job drained, or cleanup finished.
    pub fn idle(&mut self) {
        self.state = MillingState::Idle;
    }
}

// =============================================================================
// Per-beam image cache
// =============================================================================

/// Last captured image per beam.
///
/// Written only by an adapter's capture path, as a whole [`Image`], so a
/// reader never sees pixels from one capture next to state from another.
#[derive(Debug, Clone, Default)]
pub struct ImageCache {
    images: [Option<Image>; 2],
}

impl ImageCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cached image for the image's own beam.
    pub fn store(&mut self, image: Image) {
        let slot = image.settings.beam_type.index();
        self.images[slot] = Some(image);
    }

    /// Most recent image for `beam`, if any.
    pub fn get(&self, beam: BeamType) -> Option<&Image> {
        self.images[beam.index()].as_ref()
    }

    /// Cloned image for `beam`, or [`HalError::NoCachedImage`].
    pub fn latest(&self, beam: BeamType) -> AppResult<Image> {
        self.get(beam).cloned().ok_or(HalError::NoCachedImage(beam))
    }
}

// =============================================================================
// Capability trait
// =============================================================================

/// Vendor-neutral FIB-SEM control surface.
///
/// All positions are RAW-frame metres/radians, all beam quantities SI.
#[async_trait]
pub trait Microscope: Send + Sync {
    /// Short backend name, for logs.
    fn name(&self) -> &'static str;

    /// Whether a vendor session is open.
    fn is_connected(&self) -> bool;

    /// Opens the vendor session.
    ///
    /// On failure the error is logged, the adapter stays disconnected and
    /// inert, and [`HalError::Connection`] is returned for the caller to act
    /// on. Nothing is retried.
    async fn connect(&mut self, address: &str, port: u16) -> AppResult<()>;

    /// Closes the vendor session. A no-op when already disconnected.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Selects beam and detector, clamps hfw to device limits, grabs a frame
    /// and stamps it with a fresh [`MicroscopeState`]. Changes the active
    /// view on the instrument. The result also becomes the cached last image.
    async fn acquire_image(&mut self, settings: &ImageSettings) -> AppResult<Image>;

    /// Most recently acquired image for `beam`, without acquiring.
    ///
    /// # Errors
    /// [`HalError::NoCachedImage`] when nothing has been captured with `beam`.
    async fn last_image(&self, beam: BeamType) -> AppResult<Image>;

    /// Triggers the vendor's auto contrast/brightness. Fire-and-forget.
    async fn autocontrast(&mut self, beam: BeamType) -> AppResult<()>;

    /// Zeroes the beam shift of both beams where the vendor supports it.
    async fn reset_beam_shifts(&mut self) -> AppResult<()>;

    /// Stage pose in the RAW frame.
    async fn get_stage_position(&mut self) -> AppResult<StagePosition>;

    /// Snapshot of stage pose and both beams at one logical instant.
    async fn get_current_state(&mut self) -> AppResult<MicroscopeState>;

    /// Moves to an absolute RAW pose and waits for completion.
    async fn move_stage_absolute(&mut self, position: &StagePosition) -> AppResult<()>;

    /// Moves by a RAW delta and waits for completion.
    async fn move_stage_relative(&mut self, delta: &StagePosition) -> AppResult<()>;

    /// Working distance of `beam` (m).
    async fn working_distance(&mut self, beam: BeamType) -> AppResult<f64>;

    /// Sets the working distance of `beam` (m).
    async fn set_working_distance(&mut self, beam: BeamType, working_distance: f64) -> AppResult<()>;

    /// Re-couples stage z and working distance after a move.
    ///
    /// Returns `false` when the backend has no such coupling.
    async fn link_stage(&mut self) -> AppResult<bool> {
        Ok(false)
    }

    /// Moves the stage so the sample shifts by `(dx, dy)` in the `beam` image
    /// while keeping the electron working distance.
    ///
    /// Snapshot WD, compute the corrected delta, move relatively, restore WD,
    /// then run [`Microscope::link_stage`].
    async fn stable_move(
        &mut self,
        settings: &MicroscopeSettings,
        dx: f64,
        dy: f64,
        beam: BeamType,
    ) -> AppResult<()> {
        let wd = self.working_distance(BeamType::Electron).await?;

        let current = self.get_stage_position().await?;
        let delta = geometry::corrected_stage_move(&settings.calibration, &current, dx, dy, beam)?;

        tracing::info!(backend = self.name(), beam = %beam, "moving stage: {}", delta);
        self.move_stage_relative(&delta).await?;

        self.set_working_distance(BeamType::Electron, wd).await?;
        self.link_stage().await?;
        Ok(())
    }

    /// Configures the ion milling layer and clears any queued patterns.
    async fn setup_milling(
        &mut self,
        application_file: &str,
        mode: PatterningMode,
        hfw: f64,
        settings: &MillingSettings,
    ) -> AppResult<()>;

    /// Queues one rectangle or cleaning cross-section.
    async fn draw_rectangle(&mut self, pattern: &MillingPattern) -> AppResult<()>;

    /// Switches to `milling_current` and runs the queued patterns.
    ///
    /// With `asynchronous` the call returns once the job has started;
    /// otherwise it waits for the job to drain and clears the patterns.
    async fn run_milling(&mut self, milling_current: f64, asynchronous: bool) -> AppResult<()>;

    /// Aborts a running job through the vendor's explicit stop.
    async fn stop_milling(&mut self) -> AppResult<()>;

    /// Lifecycle state, polling the vendor while a job is running.
    async fn milling_state(&mut self) -> AppResult<MillingState>;

    /// Clears patterns, restores `imaging_current` and resets the patterning
    /// mode. Attempts every step whatever the earlier outcome, and succeeds
    /// when already idle, connected or not.
    async fn finish_milling(&mut self, imaging_current: f64) -> AppResult<()>;

    /// Restores the stage pose, then working distance, current, hfw,
    /// resolution and dwell time of the electron beam and then the ion beam.
    async fn set_microscope_state(&mut self, state: &MicroscopeState) -> AppResult<()>;
}

/// Collects the failures of a multi-step cleanup.
pub(crate) fn cleanup_result(failures: Vec<HalError>) -> AppResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(HalError::CleanupFailed(failures))
    }
}

/// Logs a failed vendor call with its arguments before the error propagates.
pub(crate) trait LogFault<T> {
    /// Emits `error!` naming `backend` and the call rendered by `call` when
    /// `self` is an error, then hands `self` back unchanged.
    fn log_fault<D: fmt::Display>(self, backend: &str, call: impl FnOnce() -> D) -> AppResult<T>;
}

impl<T> LogFault<T> for AppResult<T> {
    fn log_fault<D: fmt::Display>(self, backend: &str, call: impl FnOnce() -> D) -> AppResult<T> {
        if let Err(e) = &self {
            tracing::error!("{} {} failed: {}", backend, call(), e);
        }
        self
    }
}
