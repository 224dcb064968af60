//! Control-plane commands, queued to the scheduler and applied between ticks

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use kaleidoscope_core::{Parameter, ParameterSetRequest};

/// Why a control command was rejected.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The referenced fixture, program or parameter does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The mutation itself is invalid (bad level, wrong kind, ...).
    #[error("{0}")]
    Invalid(String),
}

/// Result type for control commands.
pub type CommandResult<T> = Result<T, CommandError>;

/// Reply slot carried by each command; completed at the tick boundary.
pub type Reply<T> = oneshot::Sender<CommandResult<T>>;

/// A mutation (or metadata read) requested by the control plane.
///
/// Commands travel over a channel from the web layer to the scheduler
/// thread and are drained at the start of each tick, so every mutation
/// becomes visible at a tick boundary.
#[derive(Debug)]
pub enum ControlCommand {
    /// Make a program the fixture's active program.
    SetActiveProgram {
        /// Fixture name.
        fixture: String,
        /// Program name within the fixture.
        program: String,
        /// Completion slot.
        reply: Reply<()>,
    },
    /// Advance the fixture's active program, skipping MANUAL and EXTERNAL.
    CycleActiveProgram {
        /// Fixture name.
        fixture: String,
        /// Completion slot; carries the new active program's name.
        reply: Reply<String>,
    },
    /// Write a parameter.
    SetParameter {
        /// Fixture name.
        fixture: String,
        /// Program name within the fixture.
        program: String,
        /// Parameter name.
        parameter: String,
        /// The typed write request.
        request: ParameterSetRequest,
        /// Completion slot.
        reply: Reply<()>,
    },
    /// Advance a discrete parameter by one level with wrap-around.
    CycleParameter {
        /// Fixture name.
        fixture: String,
        /// Program name within the fixture.
        program: String,
        /// Parameter name.
        parameter: String,
        /// Completion slot; carries the new level's label.
        reply: Reply<String>,
    },
    /// Enable or disable a program by its engine-unique key.
    SetProgramEnabled {
        /// Engine-unique program key.
        program: String,
        /// Target enable state.
        enabled: bool,
        /// Completion slot.
        reply: Reply<()>,
    },
    /// Read a metadata snapshot of the whole engine.
    Snapshot {
        /// Completion slot.
        reply: Reply<EngineSnapshot>,
    },
}

/// Metadata snapshot of the engine, taken at a tick boundary.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// All fixtures by name.
    pub fixtures: BTreeMap<String, FixtureSnapshot>,
}

/// Metadata of one fixture.
#[derive(Debug, Clone, Serialize)]
pub struct FixtureSnapshot {
    /// Owned output aliases, ordered by address.
    pub output_aliases: Vec<String>,
    /// Name of the active program.
    pub active_program: String,
    /// Catalog programs by name.
    pub programs: BTreeMap<String, ProgramSnapshot>,
}

/// Metadata of one program.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramSnapshot {
    /// Priority in `[0, 20]`.
    pub priority: u8,
    /// Whether the program runs in slow mode.
    pub slow_mode: bool,
    /// Whether the program is currently enabled.
    pub enabled: bool,
    /// Whether this is a synthesized built-in.
    pub builtin: bool,
    /// Whether the script failed to load.
    pub load_failed: bool,
    /// Declared parameters.
    pub parameters: BTreeMap<String, Parameter>,
}
