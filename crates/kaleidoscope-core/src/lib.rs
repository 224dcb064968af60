//! Kaleidoscope Core - Domain Model and Arbitration
//!
//! This crate contains the synchronous domain model for Kaleidoscope:
//! - Value and address types shared with the actuator service
//! - Address space (alias/group resolution, input snapshot)
//! - Event model and per-program routing
//! - Cross-program global store with per-tick delta reconciliation
//! - Parameter registry (discrete/continuous, change notifications)
//! - The priority arbitrator that picks the per-tick execution set
//!
//! There is no I/O and no async code in here; the scheduling host and the
//! control surfaces live in their own crates.

#![warn(missing_docs)]

use thiserror::Error;

pub mod address;
pub mod arbiter;
pub mod event;
pub mod globals;
pub mod parameters;

pub use address::{AddressSpace, AliasEntry, UniverseConfig};
pub use arbiter::{Arbiter, Candidate, OutputMerge, Selection};
pub use event::{Event, EventFilterKind, EventKind, EventRouter};
pub use globals::{GlobalStore, GlobalValue};
pub use parameters::{
    ChangedValue, DiscreteLevel, Parameter, ParameterChange, ParameterKind, ParameterRegistry,
    ParameterSetRequest,
};

/// A single channel value as understood by the actuator service.
pub type Value = u16;

/// A 16-bit channel identifier.
pub type Address = u16;

/// The lowest channel value.
pub const LOW: Value = 0;

/// The highest channel value.
pub const HIGH: Value = u16::MAX;

/// Program priority bounds: priorities live in `[0, MAX_PRIORITY]`, higher wins.
pub const MAX_PRIORITY: u8 = 20;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// An input alias that is not part of the universe.
    #[error("unknown input alias: {0}")]
    UnknownInputAlias(String),

    /// An output alias that is not part of the universe.
    #[error("unknown output alias: {0}")]
    UnknownOutputAlias(String),

    /// A group name that is not part of the universe.
    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// An address that no configured alias resolves to.
    #[error("address not in use: {0}")]
    UnknownAddress(Address),

    /// A duplicate alias or address in the universe configuration.
    #[error("invalid universe: {0}")]
    InvalidUniverse(String),

    /// Lookup of a parameter that was never declared.
    #[error("unknown parameter {parameter} for program {program}")]
    UnknownParameter {
        /// Owning program key.
        program: String,
        /// Parameter name.
        parameter: String,
    },

    /// A discrete operation applied to a continuous parameter.
    #[error("parameter {parameter} for program {program} is continuous")]
    NotDiscrete {
        /// Owning program key.
        program: String,
        /// Parameter name.
        parameter: String,
    },

    /// A continuous operation applied to a discrete parameter.
    #[error("parameter {parameter} for program {program} is discrete")]
    NotContinuous {
        /// Owning program key.
        program: String,
        /// Parameter name.
        parameter: String,
    },

    /// A discrete write with a value outside the declared level set.
    #[error("invalid value {value} for parameter {parameter}, not in declared set")]
    InvalidLevel {
        /// Parameter name.
        parameter: String,
        /// The rejected value.
        value: i64,
    },

    /// A second declaration of the same parameter name.
    #[error("duplicate parameter {parameter} for program {program}")]
    DuplicateParameter {
        /// Owning program key.
        program: String,
        /// Parameter name.
        parameter: String,
    },

    /// A structurally invalid parameter declaration.
    #[error("invalid parameter declaration: {0}")]
    InvalidDeclaration(String),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Clamp `x` into `[lower, upper]`.
pub fn clamp(x: f64, lower: f64, upper: f64) -> f64 {
    x.max(lower).min(upper)
}

/// Linear interpolation between `a` and `b`.
pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Map `x` from `[in_lower, in_upper]` into `[out_lower, out_upper]`, clamped.
pub fn map_range(x: f64, in_lower: f64, in_upper: f64, out_lower: f64, out_upper: f64) -> f64 {
    lerp(out_lower, out_upper, unit_fraction(in_lower, in_upper, x))
}

/// Map `x` from `[lower, upper]` onto the full channel value range.
///
/// `map_to_value(a, b, a) == LOW` and `map_to_value(a, b, b) == HIGH`; the
/// mapping is monotone non-decreasing in `x` and clamps outside the range.
pub fn map_to_value(lower: f64, upper: f64, x: f64) -> Value {
    let t = unit_fraction(lower, upper, x);
    (t * f64::from(HIGH)).round() as Value
}

/// Inverse of [`map_to_value`], up to one quantization step.
pub fn map_from_value(lower: f64, upper: f64, v: Value) -> f64 {
    lerp(lower, upper, f64::from(v) / f64::from(HIGH))
}

fn unit_fraction(lower: f64, upper: f64, x: f64) -> f64 {
    if upper <= lower {
        // Degenerate range: everything at or below the bound maps to LOW.
        return if x > lower { 1.0 } else { 0.0 };
    }
    clamp((x - lower) / (upper - lower), 0.0, 1.0)
}
