//! Kaleidoscope Host - Program Lifecycle and Tick Scheduling
//!
//! This crate runs operator-authored rhai programs against the core domain
//! model:
//! - [`script`] - the per-program rhai environment and host API
//! - [`program`] - program lifecycle, the per-tick protocol, built-ins
//! - [`fixture`] - fixture catalogs with one active program each
//! - [`engine`] - the per-tick pipeline (reconcile, arbitrate, evaluate, merge)
//! - [`scheduler`] - the fixed-rate loop on its own thread
//! - [`control`] - queued control-plane mutations applied at tick boundaries

use thiserror::Error;

pub mod control;
pub mod engine;
pub mod fixture;
pub mod metrics;
pub mod program;
pub mod scheduler;
pub mod script;

pub use control::{
    CommandError, CommandResult, ControlCommand, EngineSnapshot, FixtureSnapshot, ProgramSnapshot,
    Reply,
};
pub use engine::{Engine, EngineSettings, TickReport};
pub use fixture::FixtureConfig;
pub use program::{Program, TickContext};
pub use scheduler::{OutputFrame, Scheduler};

/// Default number of ticks between forced runs of a slow-mode program.
pub const SLOW_MODE_PERIOD: u32 = 1000;

/// Default number of consecutive script failures before auto-disable.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default soft per-program tick budget, microseconds.
pub const TICK_BUDGET_US: u64 = 1000;

/// Host error types
#[derive(Error, Debug)]
pub enum HostError {
    /// The program source did not compile.
    #[error("script compile error: {0}")]
    Compile(String),

    /// An uncaught script error during setup, tick or a handler.
    #[error("script error: {0}")]
    Script(String),

    /// The program's setup phase failed.
    #[error("program setup failed: {0}")]
    Setup(String),

    /// A domain error from the core crate.
    #[error(transparent)]
    Core(#[from] kaleidoscope_core::CoreError),

    /// Reference to a program that does not exist.
    #[error("unknown program: {0}")]
    UnknownProgram(String),

    /// Reference to a fixture that does not exist.
    #[error("unknown fixture: {0}")]
    UnknownFixture(String),

    /// A structurally invalid fixture or engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure while loading sources.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Box<rhai::EvalAltResult>> for HostError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        HostError::Script(err.to_string())
    }
}

/// Result type for host operations
pub type Result<T> = std::result::Result<T, HostError>;
