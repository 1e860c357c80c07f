//! In-process TESCAN emulation, in vendor units.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{
    Column, DrawBeamStatus, EtchingLayer, FrameHeader, StageLimits, TescanClient, TescanFrame,
    TescanStagePosition,
};
use crate::backends::sim::{lock, synthetic_frame, SimControl};
use crate::error::{AppResult, HalError};
use crate::state::Resolution;

const DEFAULT_POLLS_TO_FINISH: u32 = 2;

/// Encoder resolution the simulated stage tolerates at its limits (mm, deg).
const LIMIT_SLACK: f64 = 1e-9;

#[derive(Debug, Clone)]
struct SimColumn {
    view_field_mm: f64,
    view_field_limits_mm: (f64, f64),
    working_distance_mm: f64,
    current_pa: f64,
    stigmator: (f64, f64),
    image_shift_mm: (f64, f64),
    detector: Option<u32>,
    beam_on: bool,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    columns: [SimColumn; 2],
    stage: TescanStagePosition,
    limits: StageLimits,
    loaded: Option<EtchingLayer>,
    status: DrawBeamStatus,
    polls_remaining: u32,
    polls_to_finish: u32,
    completed_jobs: Vec<EtchingLayer>,
}

impl Default for SimState {
    fn default() -> Self {
        let sem = SimColumn {
            view_field_mm: 0.15,
            view_field_limits_mm: (0.001, 5.0),
            working_distance_mm: 6.0,
            current_pa: 100.0,
            stigmator: (0.0, 0.0),
            image_shift_mm: (0.0, 0.0),
            detector: None,
            beam_on: true,
        };
        let fib = SimColumn {
            view_field_limits_mm: (0.001, 1.0),
            working_distance_mm: 9.0,
            current_pa: 20.0,
            beam_on: false,
            ..sem.clone()
        };
        Self {
            connected: false,
            columns: [sem, fib],
            stage: TescanStagePosition {
                x: 0.0,
                y: 0.0,
                z: 10.0,
                r: 0.0,
                t: 0.0,
            },
            limits: StageLimits([-50.0, 50.0, -40.0, 40.0, 0.0, 60.0, -180.0, 180.0, -30.0, 90.0]),
            loaded: None,
            status: DrawBeamStatus::Idle,
            polls_remaining: 0,
            polls_to_finish: DEFAULT_POLLS_TO_FINISH,
            completed_jobs: Vec::new(),
        }
    }
}

/// Simulated TESCAN Automation server.
///
/// Clones share state. The stage enforces its own limits, so a move the
/// adapter should have rejected shows up as a hardware error here.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTescan {
    state: Arc<Mutex<SimState>>,
    control: SimControl,
}

impl SimulatedTescan {
    /// A disconnected simulator with the stage at z = 10 mm.
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

    /// Stage pose in mm/deg.
    pub fn native_position(&self) -> TescanStagePosition {
        lock(&self.state).stage
    }

    /// Teleports the stage.
    pub fn set_native_position(&self, position: TescanStagePosition) {
        lock(&self.state).stage = position;
    }

    /// Replaces the travel limits.
    pub fn set_limits(&self, limits: StageLimits) {
        lock(&self.state).limits = limits;
    }

    /// Field of view of `column` (mm).
    pub fn view_field_mm(&self, column: Column) -> f64 {
        lock(&self.state).columns[column.index()].view_field_mm
    }

    /// Probe current of `column` (pA).
    pub fn current_pa(&self, column: Column) -> f64 {
        lock(&self.state).columns[column.index()].current_pa
    }

    /// Working distance of `column` (mm).
    pub fn working_distance_mm(&self, column: Column) -> f64 {
        lock(&self.state).columns[column.index()].working_distance_mm
    }

    /// Selected detector channel of `column`.
    pub fn detector(&self, column: Column) -> Option<u32> {
        lock(&self.state).columns[column.index()].detector
    }

    /// Whether the beam of `column` is on.
    pub fn is_beam_on(&self, column: Column) -> bool {
        lock(&self.state).columns[column.index()].beam_on
    }

    /// Sets the stigmator and image shift reported in frame headers.
    pub fn set_header(&self, column: Column, stigmator: (f64, f64), image_shift_mm: (f64, f64)) {
        let mut state = lock(&self.state);
        let col = &mut state.columns[column.index()];
        col.stigmator = stigmator;
        col.image_shift_mm = image_shift_mm;
    }

    /// Layer currently loaded into DrawBeam.
    pub fn loaded_layer(&self) -> Option<EtchingLayer> {
        lock(&self.state).loaded.clone()
    }

    /// Layers that ran to completion.
    pub fn completed_jobs(&self) -> Vec<EtchingLayer> {
        lock(&self.state).completed_jobs.clone()
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

    fn with_column<T>(
        &self,
        operation: &'static str,
        column: Column,
        f: impl FnOnce(&mut SimColumn) -> T,
    ) -> AppResult<T> {
        self.with_connected(operation, |state| f(&mut state.columns[column.index()]))
    }
}

fn column_name(column: Column) -> &'static str {
    match column {
        Column::Sem => "SEM",
        Column::Fib => "FIB",
    }
}

#[async_trait]
impl TescanClient for SimulatedTescan {
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

    async fn stop_scan(&mut self, column: Column) -> AppResult<()> {
        self.control.call("stop_scan", column_name(column).to_string()).await?;
        self.with_connected("stop_scan", |_| ())
    }

    async fn select_detector(&mut self, column: Column, channel: u32) -> AppResult<()> {
        self.control
            .call("select_detector", format!("{} ch{}", column_name(column), channel))
            .await?;
        self.with_column("select_detector", column, |c| c.detector = Some(channel))
    }

    async fn auto_signal(&mut self, column: Column, channel: u32) -> AppResult<()> {
        self.control
            .call("auto_signal", format!("{} ch{}", column_name(column), channel))
            .await?;
        self.with_connected("auto_signal", |_| ())
    }

    async fn view_field(&mut self, column: Column) -> AppResult<f64> {
        self.control.call("view_field", column_name(column).to_string()).await?;
        self.with_column("view_field", column, |c| c.view_field_mm)
    }

    async fn set_view_field(&mut self, column: Column, view_field_mm: f64) -> AppResult<()> {
        self.control
            .call("set_view_field", format!("{} {}", column_name(column), view_field_mm))
            .await?;
        self.with_column("set_view_field", column, |c| {
            let (min, max) = c.view_field_limits_mm;
            if view_field_mm < min || view_field_mm > max {
                Err(HalError::hardware(
                    "set_view_field",
                    format!("{} mm outside [{}, {}]", view_field_mm, min, max),
                ))
            } else {
                c.view_field_mm = view_field_mm;
                Ok(())
            }
        })?
    }

    async fn view_field_limits(&mut self, column: Column) -> AppResult<(f64, f64)> {
        self.control
            .call("view_field_limits", column_name(column).to_string())
            .await?;
        self.with_column("view_field_limits", column, |c| c.view_field_limits_mm)
    }

    async fn working_distance(&mut self, column: Column) -> AppResult<f64> {
        self.control
            .call("working_distance", column_name(column).to_string())
            .await?;
        self.with_column("working_distance", column, |c| c.working_distance_mm)
    }

    async fn set_working_distance(&mut self, column: Column, working_distance_mm: f64) -> AppResult<()> {
        self.control
            .call(
                "set_working_distance",
                format!("{} {}", column_name(column), working_distance_mm),
            )
            .await?;
        self.with_column("set_working_distance", column, |c| {
            c.working_distance_mm = working_distance_mm
        })
    }

    async fn probe_current(&mut self, column: Column) -> AppResult<f64> {
        self.control.call("probe_current", column_name(column).to_string()).await?;
        self.with_column("probe_current", column, |c| c.current_pa)
    }

    async fn set_probe_current(&mut self, column: Column, current_pa: f64) -> AppResult<()> {
        self.control
            .call("set_probe_current", format!("{} {}", column_name(column), current_pa))
            .await?;
        self.with_column("set_probe_current", column, |c| c.current_pa = current_pa)
    }

    async fn beam_on(&mut self, column: Column) -> AppResult<()> {
        self.control.call("beam_on", column_name(column).to_string()).await?;
        self.with_column("beam_on", column, |c| c.beam_on = true)
    }

    async fn acquire_image_from_channel(
        &mut self,
        column: Column,
        channel: u32,
        width: u32,
        height: u32,
        dwell_ns: f64,
    ) -> AppResult<TescanFrame> {
        self.control
            .call(
                "acquire_image_from_channel",
                format!(
                    "{} ch{} {}x{} {:.0}ns",
                    column_name(column),
                    channel,
                    width,
                    height,
                    dwell_ns
                ),
            )
            .await?;
        let header = self.with_column("acquire_image_from_channel", column, |c| {
            if !c.beam_on {
                Err(HalError::hardware("acquire_image_from_channel", "beam is off"))
            } else if c.detector == Some(channel) {
                Ok(FrameHeader {
                    stigmator: c.stigmator,
                    image_shift: c.image_shift_mm,
                })
            } else {
                Err(HalError::hardware(
                    "acquire_image_from_channel",
                    format!("no detector assigned to channel {}", channel),
                ))
            }
        })??;
        let image = synthetic_frame(Resolution::new(width, height))?;
        Ok(TescanFrame { image, header })
    }

    async fn stage_position(&mut self) -> AppResult<TescanStagePosition> {
        self.control.call("stage_position", String::new()).await?;
        self.with_connected("stage_position", |s| s.stage)
    }

    async fn stage_limits(&mut self) -> AppResult<StageLimits> {
        self.control.call("stage_limits", String::new()).await?;
        self.with_connected("stage_limits", |s| s.limits)
    }

    async fn stage_move_to(&mut self, position: &TescanStagePosition) -> AppResult<()> {
        self.control
            .call(
                "stage_move_to",
                format!(
                    "{:.4} {:.4} {:.4} {:.3} {:.3}",
                    position.x, position.y, position.z, position.r, position.t
                ),
            )
            .await?;
        self.with_connected("stage_move_to", |s| {
            let l = s.limits.0;
            let values = [position.x, position.y, position.z, position.r, position.t];
            let in_range = values
                .iter()
                .enumerate()
                .all(|(i, v)| *v >= l[2 * i] - LIMIT_SLACK && *v <= l[2 * i + 1] + LIMIT_SLACK);
            if in_range {
                s.stage = *position;
                Ok(())
            } else {
                Err(HalError::hardware("stage_move_to", "position outside stage limits"))
            }
        })?
    }

    async fn load_layer(&mut self, layer: &EtchingLayer) -> AppResult<()> {
        self.control
            .call("load_layer", format!("{} ({} shapes)", layer.name, layer.shapes.len()))
            .await?;
        self.with_connected("load_layer", |s| s.loaded = Some(layer.clone()))
    }

    async fn start(&mut self) -> AppResult<()> {
        self.control.call("start", String::new()).await?;
        self.with_connected("start", |s| {
            if s.loaded.is_none() {
                return Err(HalError::hardware("start", "no layer loaded"));
            }
            s.status = DrawBeamStatus::Running;
            s.polls_remaining = s.polls_to_finish;
            Ok(())
        })?
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.control.call("stop", String::new()).await?;
        self.with_connected("stop", |s| s.status = DrawBeamStatus::Idle)
    }

    async fn status(&mut self) -> AppResult<DrawBeamStatus> {
        self.control.call("status", String::new()).await?;
        self.with_connected("status", |s| {
            if s.status == DrawBeamStatus::Running {
                if s.polls_remaining == 0 {
                    s.status = DrawBeamStatus::Idle;
                    if let Some(layer) = s.loaded.clone() {
                        s.completed_jobs.push(layer);
                    }
                } else {
                    s.polls_remaining -= 1;
                }
            }
            s.status
        })
    }

    async fn unload_layer(&mut self) -> AppResult<()> {
        self.control.call("unload_layer", String::new()).await?;
        self.with_connected("unload_layer", |s| s.loaded = None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_rejects_out_of_range_move() {
        let mut sim = SimulatedTescan::new();
        sim.connect("127.0.0.1", 8300).await.unwrap();
        let target = TescanStagePosition {
            x: 60.0,
            y: 0.0,
            z: 10.0,
            r: 0.0,
            t: 0.0,
        };
        assert!(sim.stage_move_to(&target).await.is_err());
        assert_eq!(sim.native_position().x, 0.0);
    }

    #[tokio::test]
    async fn test_acquire_requires_detector() {
        let mut sim = SimulatedTescan::new();
        sim.connect("127.0.0.1", 8300).await.unwrap();
        assert!(sim
            .acquire_image_from_channel(Column::Sem, 0, 8, 8, 1000.0)
            .await
            .is_err());
        sim.select_detector(Column::Sem, 0).await.unwrap();
        let frame = sim
            .acquire_image_from_channel(Column::Sem, 0, 8, 8, 1000.0)
            .await
            .unwrap();
        assert_eq!(frame.image.pixels.len(), 64);
    }

    #[tokio::test]
    async fn test_acquire_requires_beam_on() {
        let mut sim = SimulatedTescan::new();
        sim.connect("127.0.0.1", 8300).await.unwrap();
        sim.select_detector(Column::Fib, 0).await.unwrap();
        assert!(!sim.is_beam_on(Column::Fib));
        assert!(sim
            .acquire_image_from_channel(Column::Fib, 0, 8, 8, 1000.0)
            .await
            .is_err());

        sim.beam_on(Column::Fib).await.unwrap();
        assert!(sim
            .acquire_image_from_channel(Column::Fib, 0, 8, 8, 1000.0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_start_needs_loaded_layer() {
        let mut sim = SimulatedTescan::new();
        sim.connect("127.0.0.1", 8300).await.unwrap();
        assert!(sim.start().await.is_err());
    }
}
