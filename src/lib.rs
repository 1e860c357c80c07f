//! Hardware abstraction layer for FIB-SEM instruments.
//!
//! Workflow code drives an instrument through the vendor-neutral
//! [`microscope::Microscope`] trait; [`backends`] adapts the Thermo and
//! TESCAN control APIs to it and picks one from configuration. The
//! [`geometry`] engine turns image-plane displacements into stage moves,
//! and [`state`] holds the value types exchanged with every backend.
//!
//! The interface is SI throughout: metres, radians, seconds, amps.

pub mod backends;
pub mod config;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod microscope;
pub mod session;
pub mod state;
pub mod units;

pub use error::{AppResult, HalError};
pub use microscope::Microscope;
