//! Custom error types for the hardware abstraction layer.
//!
//! This module defines the primary error type, `HalError`, shared by the geometry
//! engine, both vendor backends and the configuration layer. Using the `thiserror`
//! crate, it gives every failure a stable, matchable shape so workflow callers can
//! react without knowing which instrument they are driving.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: `connect` could not establish the vendor session. The adapter
//!   stays disconnected and inert; callers decide whether to retry.
//! - **`NotConnected`**: an operation was attempted before a successful `connect`.
//! - **`LimitViolation`**: an absolute stage move exceeded a calibrated travel limit.
//!   The payload names the axis and bound and carries the clamped position, so the
//!   caller can retry at the boundary. Nothing moved.
//! - **`InvalidStateTransition`**: a milling operation was invoked out of sequence.
//! - **`DegenerateGeometry`**: the requested correction is unachievable because the
//!   perspective cosine is (nearly) zero.
//! - **`Hardware`**: any unexpected vendor-side failure, tagged with the operation.
//! - **`CleanupFailed`**: `finish_milling` attempted every restore step and some
//!   failed; all failures are kept.
//! - **`Config`** / **`ConfigValidation`**: configuration could not be loaded, or
//!   loaded but is semantically invalid.
//!
//! Adapters never retry on their own; retry and backoff are a caller concern.

use crate::state::{BeamType, StagePosition};
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, HalError>;

/// Stage axis identifiers, in the order limits are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageAxis {
    /// Linear X.
    X,
    /// Linear Y.
    Y,
    /// Linear Z.
    Z,
    /// Rotation.
    R,
    /// Tilt.
    T,
}

impl StageAxis {
    /// All axes in check order.
    pub const ALL: [StageAxis; 5] = [
        StageAxis::X,
        StageAxis::Y,
        StageAxis::Z,
        StageAxis::R,
        StageAxis::T,
    ];

    /// Lowercase axis name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageAxis::X => "x",
            StageAxis::Y => "y",
            StageAxis::Z => "z",
            StageAxis::R => "r",
            StageAxis::T => "t",
        }
    }
}

impl fmt::Display for StageAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the travel range was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitBound {
    /// Below the minimum.
    Lower,
    /// Above the maximum.
    Upper,
}

impl fmt::Display for LimitBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitBound::Lower => f.write_str("lower"),
            LimitBound::Upper => f.write_str("upper"),
        }
    }
}

/// Structured outcome of a rejected absolute move.
///
/// Values are in interface units (metres for x/y/z, radians for r/t).
#[derive(Debug, Clone, PartialEq)]
pub struct LimitViolation {
    /// First axis found out of range.
    pub axis: StageAxis,
    /// Which bound that axis exceeded.
    pub bound: LimitBound,
    /// Requested value on `axis`.
    pub requested: f64,
    /// The bound's value on `axis`.
    pub limit: f64,
    /// The requested position with every out-of-range axis clamped.
    pub clamped: StagePosition,
}

impl fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} limit reached (requested {:.6e}, limit {:.6e})",
            self.bound, self.axis, self.requested, self.limit
        )
    }
}

/// Library error type.
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Unable to connect to the microscope at {address}:{port}: {reason}")]
    Connection {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Microscope is not connected")]
    NotConnected,

    #[error("Stage limit violation: {0}")]
    LimitViolation(Box<LimitViolation>),

    #[error("Invalid milling transition: cannot {operation} while {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: String,
    },

    #[error("Degenerate geometry: cos(tilt + adjustment) = {cosine:.3e} for tilt {tilt:.6} rad, adjustment {adjustment:.6} rad")]
    DegenerateGeometry {
        tilt: f64,
        adjustment: f64,
        cosine: f64,
    },

    #[error("No image has been acquired with the {0} beam yet")]
    NoCachedImage(BeamType),

    #[error("Hardware error during {operation}: {message}")]
    Hardware {
        operation: &'static str,
        message: String,
    },

    #[error("Milling cleanup failed with errors")]
    CleanupFailed(Vec<HalError>),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Feature '{0}' is not enabled")]
    FeatureNotEnabled(String),
}

impl HalError {
    /// Wraps a vendor-side failure message.
    pub fn hardware(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Hardware {
            operation,
            message: message.into(),
        }
    }

    /// Builds a milling sequencing error.
    pub fn invalid_transition(operation: &'static str, state: impl fmt::Display) -> Self {
        Self::InvalidStateTransition {
            operation,
            state: state.to_string(),
        }
    }

    /// Builds a limit violation error.
    pub fn limit(violation: LimitViolation) -> Self {
        Self::LimitViolation(Box::new(violation))
    }

    /// Returns the limit payload when this is a limit violation.
    pub fn as_limit_violation(&self) -> Option<&LimitViolation> {
        match self {
            HalError::LimitViolation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<figment::Error> for HalError {
    fn from(err: figment::Error) -> Self {
        HalError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HalError::hardware("grab_frame", "detector offline");
        assert_eq!(
            err.to_string(),
            "Hardware error during grab_frame: detector offline"
        );
    }

    #[test]
    fn test_limit_violation_display() {
        let violation = LimitViolation {
            axis: StageAxis::Y,
            bound: LimitBound::Upper,
            requested: 0.06,
            limit: 0.05,
            clamped: StagePosition::raw(0.0, 0.05, 0.0, 0.0, 0.0),
        };
        let err = HalError::limit(violation);
        assert!(err.to_string().contains("upper y limit reached"));
        let payload = err.as_limit_violation().expect("limit payload");
        assert_eq!(payload.clamped.y, 0.05);
    }

    #[test]
    fn test_cleanup_failed_error() {
        let err = HalError::CleanupFailed(vec![
            HalError::hardware("clear_patterns", "busy"),
            HalError::hardware("set_beam_current", "timeout"),
        ]);
        assert!(err.to_string().contains("cleanup failed"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = HalError::invalid_transition("draw_rectangle", "Idle");
        assert_eq!(
            err.to_string(),
            "Invalid milling transition: cannot draw_rectangle while Idle"
        );
    }
}
