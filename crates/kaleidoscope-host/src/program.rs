//! Program lifecycle and the per-tick evaluation protocol
//!
//! A program is either a rhai script or one of the built-ins a fixture
//! synthesizes (OFF, ON, MANUAL, EXTERNAL). Scripts that fail to load are
//! kept as `Failed` placeholders: visible in metadata, never scheduled.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use kaleidoscope_core::{
    map_to_value, Address, AddressSpace, ChangedValue, Event, EventKind, GlobalValue,
    ParameterChange, ParameterRegistry, Value,
};

use crate::script::{EnableDelta, ForeignWrite, HandlerArg, ScriptHost, SubscriptionDecl};
use crate::{HostError, Result};

/// Wall-clock context for one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// Seconds since process start.
    pub now: f64,
    /// Seconds since local midnight.
    pub time_of_day: u32,
}

/// Everything one program produced during one evaluation.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Output writes, empty when the program failed this tick.
    pub outputs: HashMap<Address, Value>,
    /// Global deltas, staged for the next reconciliation.
    pub global_deltas: Vec<(String, GlobalValue)>,
    /// Queued enable changes for other programs.
    pub enable_deltas: Vec<(String, EnableDelta)>,
    /// Queued cross-program parameter writes.
    pub foreign_writes: Vec<ForeignWrite>,
    /// Whether an uncaught script error occurred.
    pub failed: bool,
    /// Evaluation wall time.
    pub duration: Duration,
}

/// The concrete implementation behind a program slot.
pub enum ProgramKind {
    /// An operator-authored rhai script.
    Script(ScriptHost),
    /// Built-in constant writer (OFF/ON).
    Constant {
        /// The value written to every owned output each tick.
        value: Value,
    },
    /// Built-in manual control: one continuous parameter per output.
    Manual {
        /// Owned outputs as (alias, address), ordered by address.
        aliases: Vec<(String, Address)>,
        /// Registry the manual levels live in.
        registry: Arc<Mutex<ParameterRegistry>>,
    },
    /// Built-in no-op: the fixture is driven externally.
    External,
    /// A script that failed to load; never scheduled.
    Failed,
}

/// One program slot in the engine.
pub struct Program {
    pub(crate) key: String,
    pub(crate) name: String,
    pub(crate) fixture: Option<String>,
    pub(crate) priority: u8,
    pub(crate) slow_mode: bool,
    pub(crate) inputs: HashSet<Address>,
    pub(crate) outputs: BTreeSet<Address>,
    pub(crate) subscriptions: Vec<SubscriptionDecl>,
    pub(crate) parameter_handlers: HashMap<String, String>,
    pub(crate) kind: ProgramKind,

    pub(crate) enabled: bool,
    pub(crate) enable_edge: bool,
    pub(crate) skip_counter: u32,
    pub(crate) consecutive_failures: u32,
}

impl Program {
    /// Load a rhai program. Setup failures are returned to the caller so it
    /// can decide between aborting startup and keeping a Failed placeholder.
    #[allow(clippy::too_many_arguments)]
    pub fn from_script(
        key: &str,
        name: &str,
        fixture: Option<&str>,
        source: &str,
        space: &AddressSpace,
        parameters: Arc<Mutex<ParameterRegistry>>,
        start: f64,
        time_of_day: u32,
    ) -> Result<Program> {
        let (host, info) = ScriptHost::load(key, source, space, parameters, start, time_of_day)?;
        Ok(Program {
            key: key.to_string(),
            name: name.to_string(),
            fixture: fixture.map(str::to_string),
            priority: info.priority,
            slow_mode: info.slow_mode,
            inputs: info.inputs,
            outputs: info.outputs,
            subscriptions: info.subscriptions,
            parameter_handlers: info.parameter_handlers,
            kind: ProgramKind::Script(host),
            enabled: false,
            enable_edge: false,
            skip_counter: 0,
            consecutive_failures: 0,
        })
    }

    /// Built-in constant program (OFF/ON).
    pub fn constant(
        key: &str,
        name: &str,
        fixture: &str,
        outputs: BTreeSet<Address>,
        value: Value,
    ) -> Program {
        Program {
            key: key.to_string(),
            name: name.to_string(),
            fixture: Some(fixture.to_string()),
            priority: 0,
            slow_mode: false,
            inputs: HashSet::new(),
            outputs,
            subscriptions: Vec::new(),
            parameter_handlers: HashMap::new(),
            kind: ProgramKind::Constant { value },
            enabled: false,
            enable_edge: false,
            skip_counter: 0,
            consecutive_failures: 0,
        }
    }

    /// Built-in manual program: declares one continuous `[0, 1]` parameter
    /// per owned output and copies the scaled levels out each tick.
    pub fn manual(
        key: &str,
        name: &str,
        fixture: &str,
        mut aliases: Vec<(String, Address)>,
        registry: Arc<Mutex<ParameterRegistry>>,
    ) -> Result<Program> {
        aliases.sort_by_key(|(_, addr)| *addr);
        {
            let mut params = registry
                .lock()
                .map_err(|_| HostError::Config("parameter registry unavailable".to_string()))?;
            for (alias, _) in &aliases {
                params.declare_continuous(
                    key,
                    alias,
                    &format!("manual level for {}", alias),
                    0.0,
                    1.0,
                    0.0,
                )?;
            }
        }
        let outputs = aliases.iter().map(|(_, addr)| *addr).collect();
        Ok(Program {
            key: key.to_string(),
            name: name.to_string(),
            fixture: Some(fixture.to_string()),
            priority: 0,
            slow_mode: false,
            inputs: HashSet::new(),
            outputs,
            subscriptions: Vec::new(),
            parameter_handlers: HashMap::new(),
            kind: ProgramKind::Manual { aliases, registry },
            enabled: false,
            enable_edge: false,
            skip_counter: 0,
            consecutive_failures: 0,
        })
    }

    /// Built-in no-op program: the fixture is not driven by Kaleidoscope.
    pub fn external(key: &str, name: &str, fixture: &str) -> Program {
        Program {
            key: key.to_string(),
            name: name.to_string(),
            fixture: Some(fixture.to_string()),
            priority: 0,
            slow_mode: false,
            inputs: HashSet::new(),
            outputs: BTreeSet::new(),
            subscriptions: Vec::new(),
            parameter_handlers: HashMap::new(),
            kind: ProgramKind::External,
            enabled: false,
            enable_edge: false,
            skip_counter: 0,
            consecutive_failures: 0,
        }
    }

    /// Placeholder for a script that failed to load.
    pub fn failed(key: &str, name: &str, fixture: Option<&str>) -> Program {
        Program {
            key: key.to_string(),
            name: name.to_string(),
            fixture: fixture.map(str::to_string),
            priority: 0,
            slow_mode: false,
            inputs: HashSet::new(),
            outputs: BTreeSet::new(),
            subscriptions: Vec::new(),
            parameter_handlers: HashMap::new(),
            kind: ProgramKind::Failed,
            enabled: false,
            enable_edge: false,
            skip_counter: 0,
            consecutive_failures: 0,
        }
    }

    /// Engine-unique key (fixture-qualified for fixture programs).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Display name within the owning fixture.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared output addresses.
    pub fn outputs(&self) -> &BTreeSet<Address> {
        &self.outputs
    }

    /// Priority in `[0, 20]`.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Whether the program may be scheduled at all.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !matches!(self.kind, ProgramKind::Failed | ProgramKind::External)
    }

    /// Whether this is one of the synthesized fixture programs.
    pub fn is_builtin(&self) -> bool {
        !matches!(self.kind, ProgramKind::Script(_))
    }

    /// Whether the load failed.
    pub fn is_load_failed(&self) -> bool {
        matches!(self.kind, ProgramKind::Failed)
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.enable_edge = true;
        }
        self.enabled = enabled;
    }

    /// Push the reconciled globals view into the script context.
    pub(crate) fn set_global_view(&mut self, view: HashMap<String, GlobalValue>) {
        if let ProgramKind::Script(host) = &mut self.kind {
            host.set_global_view(view);
        }
    }

    /// Run the per-tick protocol: refresh inputs, deliver events and
    /// parameter notifications, invoke `tick`, harvest the write buffers.
    pub(crate) fn run_tick(
        &mut self,
        ctx: &TickContext,
        space: &AddressSpace,
        events: Vec<Event>,
        changes: Vec<ParameterChange>,
    ) -> TickOutcome {
        let started = Instant::now();
        self.skip_counter = 0;
        self.enable_edge = false;

        match &mut self.kind {
            ProgramKind::Script(host) => {
                host.clear_tick_buffers();
                host.set_input_view(space.snapshot(self.inputs.iter()));
                host.set_tick_env(ctx.now, ctx.time_of_day);

                let result = drive_script(
                    host,
                    &self.subscriptions,
                    &self.parameter_handlers,
                    &events,
                    &changes,
                    ctx.now,
                );
                let harvest = host.harvest();

                match result {
                    Ok(()) => TickOutcome {
                        outputs: harvest.outputs,
                        global_deltas: harvest.global_deltas,
                        enable_deltas: harvest.enable_deltas,
                        foreign_writes: harvest.foreign_writes,
                        failed: false,
                        duration: started.elapsed(),
                    },
                    Err(err) => {
                        warn!("program {} failed: {}", self.key, err);
                        TickOutcome {
                            failed: true,
                            duration: started.elapsed(),
                            ..TickOutcome::default()
                        }
                    }
                }
            }
            ProgramKind::Constant { value } => {
                let outputs = self.outputs.iter().map(|addr| (*addr, *value)).collect();
                TickOutcome {
                    outputs,
                    duration: started.elapsed(),
                    ..TickOutcome::default()
                }
            }
            ProgramKind::Manual { aliases, registry } => {
                let mut outputs = HashMap::with_capacity(aliases.len());
                match registry.lock() {
                    Ok(params) => {
                        for (alias, address) in aliases.iter() {
                            match params.get_continuous(&self.key, alias) {
                                Ok(level) => {
                                    outputs.insert(*address, map_to_value(0.0, 1.0, level));
                                }
                                Err(err) => debug!(
                                    "manual program {} missing level {}: {}",
                                    self.key, alias, err
                                ),
                            }
                        }
                    }
                    Err(_) => {
                        warn!(
                            "manual program {} skipped: parameter registry unavailable",
                            self.key
                        );
                    }
                }
                TickOutcome {
                    outputs,
                    duration: started.elapsed(),
                    ..TickOutcome::default()
                }
            }
            ProgramKind::External | ProgramKind::Failed => TickOutcome {
                duration: started.elapsed(),
                ..TickOutcome::default()
            },
        }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("slow_mode", &self.slow_mode)
            .field("enabled", &self.enabled)
            .field("outputs", &self.outputs)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

fn drive_script(
    host: &mut ScriptHost,
    subscriptions: &[SubscriptionDecl],
    parameter_handlers: &HashMap<String, String>,
    events: &[Event],
    changes: &[ParameterChange],
    now: f64,
) -> Result<()> {
    for event in events {
        for sub in subscriptions {
            if sub.address == event.address && sub.kind.matches(&event.kind) {
                host.call_handler(&sub.handler, event_arg(&event.kind))?;
            }
        }
    }

    for change in changes {
        if let Some(handler) = parameter_handlers.get(&change.parameter) {
            let arg = match change.value {
                ChangedValue::Discrete(v) => HandlerArg::Int(v),
                ChangedValue::Continuous(v) => HandlerArg::Float(v),
            };
            host.call_handler(handler, arg)?;
        }
    }

    if host.tick_gate() {
        host.call_tick(now)?;
    }

    Ok(())
}

fn event_arg(kind: &EventKind) -> HandlerArg {
    match kind {
        EventKind::Update { value } => HandlerArg::Int(i64::from(*value)),
        EventKind::ButtonClicked { duration } | EventKind::ButtonLongPress { duration } => {
            HandlerArg::Float(*duration)
        }
        EventKind::ButtonDown | EventKind::ButtonUp | EventKind::Error => HandlerArg::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaleidoscope_core::{AliasEntry, UniverseConfig};

    fn space() -> AddressSpace {
        AddressSpace::from_config(&UniverseConfig {
            inputs: vec![AliasEntry { alias: "btn".into(), address: 17 }],
            outputs: vec![
                AliasEntry { alias: "porch".into(), address: 10 },
                AliasEntry { alias: "path".into(), address: 11 },
            ],
            groups: Default::default(),
        })
        .unwrap()
    }

    fn registry() -> Arc<Mutex<ParameterRegistry>> {
        Arc::new(Mutex::new(ParameterRegistry::new()))
    }

    fn ctx() -> TickContext {
        TickContext { now: 1.0, time_of_day: 43_200 }
    }

    #[test]
    fn test_constant_program_writes_every_tick() {
        let outputs: BTreeSet<Address> = [10, 11].into_iter().collect();
        let mut program = Program::constant("f/OFF", "OFF", "f", outputs, 0);
        program.set_enabled(true);

        for _ in 0..3 {
            let outcome = program.run_tick(&ctx(), &space(), vec![], vec![]);
            assert_eq!(outcome.outputs, HashMap::from([(10, 0), (11, 0)]));
            assert!(!outcome.failed);
        }
    }

    #[test]
    fn test_manual_program_scales_levels() {
        let registry = registry();
        let aliases = vec![("porch".to_string(), 10), ("path".to_string(), 11)];
        let mut program =
            Program::manual("f/MANUAL", "MANUAL", "f", aliases, registry.clone()).unwrap();
        program.set_enabled(true);

        registry
            .lock()
            .unwrap()
            .set_continuous("f/MANUAL", "porch", 1.0)
            .unwrap();

        let outcome = program.run_tick(&ctx(), &space(), vec![], vec![]);
        assert_eq!(outcome.outputs.get(&10), Some(&kaleidoscope_core::HIGH));
        assert_eq!(outcome.outputs.get(&11), Some(&kaleidoscope_core::LOW));
    }

    #[test]
    fn test_script_program_setup_and_tick() {
        let source = r#"
            fn setup() {
                set_priority(7);
                add_output_alias("porch");
            }
            fn tick(now) {
                set_alias("porch", HIGH);
            }
        "#;
        let mut program = Program::from_script(
            "p", "p", None, source, &space(), registry(), 0.0, 0,
        )
        .unwrap();
        assert_eq!(program.priority(), 7);
        program.set_enabled(true);

        let outcome = program.run_tick(&ctx(), &space(), vec![], vec![]);
        assert!(!outcome.failed);
        assert_eq!(outcome.outputs, HashMap::from([(10, u16::MAX)]));
    }

    #[test]
    fn test_script_output_not_declared_is_rejected() {
        let source = r#"
            fn setup() {
                add_output_alias("porch");
            }
            fn tick(now) {
                set_alias("path", 1);
            }
        "#;
        let mut program = Program::from_script(
            "p", "p", None, source, &space(), registry(), 0.0, 0,
        )
        .unwrap();
        program.set_enabled(true);

        let outcome = program.run_tick(&ctx(), &space(), vec![], vec![]);
        assert!(outcome.failed);
        assert!(outcome.outputs.is_empty());
    }

    #[test]
    fn test_script_writing_outputs_during_setup_fails_load() {
        let source = r#"
            fn setup() {
                add_output_alias("porch");
                set_alias("porch", 1);
            }
            fn tick(now) {}
        "#;
        let result =
            Program::from_script("p", "p", None, source, &space(), registry(), 0.0, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_script_unknown_alias_fails_load() {
        let source = r#"
            fn setup() {
                add_output_alias("no-such-output");
            }
            fn tick(now) {}
        "#;
        let result =
            Program::from_script("p", "p", None, source, &space(), registry(), 0.0, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_script_event_handler_dispatch() {
        let source = r#"
            fn setup() {
                add_output_alias("porch");
                add_event_subscription("btn", "button_clicked", "on_click");
            }
            fn on_click(duration) {
                set_alias("porch", map_to_value(0.0, 1.0, duration));
            }
            fn tick(now) {}
        "#;
        let mut program = Program::from_script(
            "p", "p", None, source, &space(), registry(), 0.0, 0,
        )
        .unwrap();
        program.set_enabled(true);

        let event = Event {
            address: 17,
            kind: EventKind::ButtonClicked { duration: 1.0 },
        };
        let outcome = program.run_tick(&ctx(), &space(), vec![event], vec![]);
        assert!(!outcome.failed);
        assert_eq!(outcome.outputs.get(&10), Some(&u16::MAX));
    }

    #[test]
    fn test_script_missing_handler_fails_load() {
        let source = r#"
            fn setup() {
                add_event_subscription("btn", "button_clicked", "no_such_handler");
            }
            fn tick(now) {}
        "#;
        let result =
            Program::from_script("p", "p", None, source, &space(), registry(), 0.0, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_script_parameter_change_handler() {
        let registry = registry();
        let source = r#"
            fn setup() {
                add_output_alias("porch");
                declare_discrete_parameter("mode", "operating mode",
                    [["off", 0], ["on", 1]], 0, "on_mode");
            }
            fn on_mode(value) {
                set_alias("porch", value * 1000);
            }
            fn tick(now) {}
        "#;
        let mut program = Program::from_script(
            "p", "p", None, source, &space(), registry.clone(), 0.0, 0,
        )
        .unwrap();
        program.set_enabled(true);

        registry.lock().unwrap().set_discrete("p", "mode", 1).unwrap();
        let changes = registry.lock().unwrap().drain_changes("p");
        assert_eq!(changes.len(), 1);

        let outcome = program.run_tick(&ctx(), &space(), vec![], changes);
        assert!(!outcome.failed);
        assert_eq!(outcome.outputs.get(&10), Some(&1000));
    }

    #[test]
    fn test_disable_tick_gates_tick_only() {
        let source = r#"
            fn setup() {
                add_output_alias("porch");
                add_event_subscription("btn", "button_down", "on_down");
            }
            fn on_down() {
                disable_tick();
            }
            fn tick(now) {
                set_alias("porch", HIGH);
            }
        "#;
        let mut program = Program::from_script(
            "p", "p", None, source, &space(), registry(), 0.0, 0,
        )
        .unwrap();
        program.set_enabled(true);

        // First tick runs normally.
        let outcome = program.run_tick(&ctx(), &space(), vec![], vec![]);
        assert_eq!(outcome.outputs.len(), 1);

        // The handler disables tick(); the write buffer stays empty after.
        let event = Event { address: 17, kind: EventKind::ButtonDown };
        let outcome = program.run_tick(&ctx(), &space(), vec![event], vec![]);
        assert!(outcome.outputs.is_empty());
        assert!(!outcome.failed);
    }

    #[test]
    fn test_script_reads_inputs() {
        let source = r#"
            fn setup() {
                add_input_alias("btn");
                add_output_alias("porch");
            }
            fn tick(now) {
                let v = get_alias("btn");
                if v != () {
                    set_alias("porch", v);
                }
            }
        "#;
        let mut space = space();
        let mut program = Program::from_script(
            "p", "p", None, source, &space, registry(), 0.0, 0,
        )
        .unwrap();
        program.set_enabled(true);

        // No value yet: nothing written.
        let outcome = program.run_tick(&ctx(), &space, vec![], vec![]);
        assert!(outcome.outputs.is_empty());

        space.apply_update(17, 1234).unwrap();
        let outcome = program.run_tick(&ctx(), &space, vec![], vec![]);
        assert_eq!(outcome.outputs.get(&10), Some(&1234));
    }
}
