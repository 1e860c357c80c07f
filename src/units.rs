//! Unit conversion constants.
//!
//! The public interface of this crate is SI throughout (metres, radians,
//! seconds, amps). Vendor transports that speak other units convert at
//! their edge with these factors.

/// Metres to millimetres.
pub const METRE_TO_MILLIMETRE: f64 = 1.0e3;
/// Millimetres to metres.
pub const MILLIMETRE_TO_METRE: f64 = 1.0e-3;

/// Degrees to radians.
pub const DEGREES_TO_RADIANS: f64 = std::f64::consts::PI / 180.0;
/// Radians to degrees.
pub const RADIANS_TO_DEGREES: f64 = 180.0 / std::f64::consts::PI;

/// Seconds to nanoseconds.
pub const SI_TO_NANO: f64 = 1.0e9;
/// Nanoseconds to seconds.
pub const NANO_TO_SI: f64 = 1.0e-9;

/// Amps to picoamps.
pub const SI_TO_PICO: f64 = 1.0e12;
/// Picoamps to amps.
pub const PICO_TO_SI: f64 = 1.0e-12;
