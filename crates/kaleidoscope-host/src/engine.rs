//! The per-tick pipeline: reconcile, route, arbitrate, evaluate, merge

use std::collections::{HashMap, HashSet};
use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use kaleidoscope_core::{
    Address, AddressSpace, Arbiter, Candidate, CoreError, Event, EventKind, EventRouter,
    GlobalStore, GlobalValue, OutputMerge, ParameterRegistry, ParameterSetRequest, UniverseConfig,
    Value,
};

use crate::control::{
    CommandError, CommandResult, ControlCommand, EngineSnapshot, FixtureSnapshot, ProgramSnapshot,
};
use crate::fixture::{FixtureConfig, FixtureState, PROGRAM_EXTERNAL, PROGRAM_MANUAL, PROGRAM_OFF, PROGRAM_ON};
use crate::metrics;
use crate::program::{Program, TickContext};
use crate::script::{EnableDelta, ForeignWrite};
use crate::{HostError, Result};

/// Tunables of the evaluation pipeline.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Ticks between forced runs of a slow-mode program.
    pub slow_mode_period: u32,
    /// Consecutive script failures before auto-disable.
    pub max_consecutive_failures: u32,
    /// Soft per-program evaluation budget.
    pub tick_budget: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            slow_mode_period: crate::SLOW_MODE_PERIOD,
            max_consecutive_failures: crate::MAX_CONSECUTIVE_FAILURES,
            tick_budget: Duration::from_micros(crate::TICK_BUDGET_US),
        }
    }
}

/// What one tick produced.
#[derive(Debug, Default)]
pub struct TickReport {
    /// The merged output vector; absent addresses were not driven this tick.
    pub frame: HashMap<Address, Value>,
    /// Number of programs evaluated.
    pub executed: usize,
    /// Number of selected slow-mode programs skipped (reserving their
    /// addresses).
    pub skipped_slow: usize,
    /// Number of per-program event deliveries performed by routing.
    pub events_routed: usize,
}

/// The engine: programs, fixtures and the shared-state fabric, driven by
/// [`crate::scheduler::Scheduler`] one tick at a time.
pub struct Engine {
    space: AddressSpace,
    router: EventRouter,
    globals: GlobalStore,
    parameters: Arc<Mutex<ParameterRegistry>>,
    programs: Vec<Program>,
    fixtures: Vec<FixtureState>,
    // Deltas harvested in tick N, reconciled at the start of tick N+1.
    staged_globals: Vec<(String, Vec<(String, GlobalValue)>)>,
    settings: EngineSettings,
}

impl Engine {
    /// Build an engine over the configured universe.
    pub fn new(universe: &UniverseConfig, settings: EngineSettings) -> Result<Engine> {
        if settings.slow_mode_period == 0 {
            return Err(HostError::Config("slow_mode_period must be >= 1".into()));
        }
        Ok(Engine {
            space: AddressSpace::from_config(universe)?,
            router: EventRouter::new(),
            globals: GlobalStore::new(),
            parameters: Arc::new(Mutex::new(ParameterRegistry::new())),
            programs: Vec::new(),
            fixtures: Vec::new(),
            staged_globals: Vec::new(),
            settings,
        })
    }

    /// Shared handle to the parameter registry.
    pub fn parameters(&self) -> Arc<Mutex<ParameterRegistry>> {
        self.parameters.clone()
    }

    /// Read access to the address space.
    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    /// Load a fixture: validate its outputs, synthesize built-ins, load its
    /// scripts. Script setup failures keep a Failed placeholder; structural
    /// problems (unknown aliases, overlapping outputs) abort startup.
    pub fn add_fixture(&mut self, config: &FixtureConfig, base_dir: &Path) -> Result<()> {
        if self.fixtures.iter().any(|f| f.name == config.name) {
            return Err(HostError::Config(format!(
                "duplicate fixture: {}",
                config.name
            )));
        }

        let mut output_aliases = Vec::with_capacity(config.outputs.len());
        for alias in &config.outputs {
            let address = self.space.resolve_output(alias)?;
            output_aliases.push((alias.clone(), address));
        }
        output_aliases.sort_by_key(|(_, addr)| *addr);
        let outputs: std::collections::BTreeSet<Address> =
            output_aliases.iter().map(|(_, addr)| *addr).collect();
        if outputs.len() != output_aliases.len() {
            return Err(HostError::Config(format!(
                "fixture {} lists the same output twice",
                config.name
            )));
        }

        for other in &self.fixtures {
            if let Some(shared) = outputs.intersection(&other.outputs).next() {
                return Err(HostError::Config(format!(
                    "fixtures {} and {} both own output {}",
                    config.name, other.name, shared
                )));
            }
        }

        {
            let mut names = HashSet::new();
            for entry in &config.programs {
                if !names.insert(entry.name.as_str()) {
                    return Err(HostError::Config(format!(
                        "fixture {} declares program {} twice",
                        config.name, entry.name
                    )));
                }
            }
        }

        let fixture = FixtureState {
            name: config.name.clone(),
            outputs: outputs.clone(),
            output_aliases: output_aliases.clone(),
            catalog: config.catalog(),
            active_index: 0,
        };

        if !config.disable_builtin_programs {
            self.programs.push(Program::constant(
                &fixture.program_key(PROGRAM_OFF),
                PROGRAM_OFF,
                &config.name,
                outputs.clone(),
                kaleidoscope_core::LOW,
            ));
            self.programs.push(Program::constant(
                &fixture.program_key(PROGRAM_ON),
                PROGRAM_ON,
                &config.name,
                outputs.clone(),
                kaleidoscope_core::HIGH,
            ));
        }
        self.programs.push(Program::external(
            &fixture.program_key(PROGRAM_EXTERNAL),
            PROGRAM_EXTERNAL,
            &config.name,
        ));
        if !config.disable_manual_program {
            self.programs.push(Program::manual(
                &fixture.program_key(PROGRAM_MANUAL),
                PROGRAM_MANUAL,
                &config.name,
                output_aliases,
                self.parameters.clone(),
            )?);
        }

        for entry in &config.programs {
            let key = fixture.program_key(&entry.name);
            let path = base_dir.join(&entry.path);
            let loaded = std::fs::read_to_string(&path)
                .map_err(HostError::from)
                .and_then(|source| {
                    Program::from_script(
                        &key,
                        &entry.name,
                        Some(&config.name),
                        &source,
                        &self.space,
                        self.parameters.clone(),
                        0.0,
                        crate::scheduler::local_time_of_day(),
                    )
                })
                .and_then(|program| {
                    if let Some(outside) = program.outputs().iter().find(|a| !outputs.contains(a)) {
                        return Err(HostError::Config(format!(
                            "program {} writes output {} outside its fixture",
                            key, outside
                        )));
                    }
                    Ok(program)
                });

            match loaded {
                Ok(program) => self.register_program(program),
                Err(err) => {
                    error!("unable to load program {} from {:?}: {}", key, path, err);
                    self.programs
                        .push(Program::failed(&key, &entry.name, Some(&config.name)));
                }
            }
        }

        // The first catalog entry starts active.
        let initial = fixture.program_key(fixture.active_program());
        self.fixtures.push(fixture);
        self.set_enabled_by_key(&initial, true);

        Ok(())
    }

    /// Load a standalone (fixture-less) program. Setup failures keep a
    /// Failed placeholder so other programs continue.
    pub fn add_script_program(&mut self, name: &str, source: &str) -> Result<()> {
        if self.programs.iter().any(|p| p.key == name) {
            return Err(HostError::Config(format!("duplicate program: {}", name)));
        }
        match Program::from_script(
            name,
            name,
            None,
            source,
            &self.space,
            self.parameters.clone(),
            0.0,
            crate::scheduler::local_time_of_day(),
        ) {
            Ok(mut program) => {
                program.set_enabled(true);
                self.register_program(program);
            }
            Err(err) => {
                error!("unable to load program {}: {}", name, err);
                self.programs.push(Program::failed(name, name, None));
            }
        }
        Ok(())
    }

    fn register_program(&mut self, program: Program) {
        for sub in &program.subscriptions {
            self.router.subscribe(&program.key, sub.address, sub.kind);
        }
        self.programs.push(program);
    }

    /// Finish loading: fix the deterministic program order and publish
    /// load-time metrics. Call once after all fixtures and programs.
    pub fn finalize(&mut self) {
        self.programs
            .sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
        metrics::LOADED_PROGRAMS.set(self.programs.len() as i64);
        info!(
            "engine ready: {} fixtures, {} programs",
            self.fixtures.len(),
            self.programs.len()
        );
    }

    /// Run one full tick and produce the output vector.
    pub fn tick(&mut self, ctx: &TickContext, events: Vec<Event>) -> TickReport {
        // 1. Reconcile last tick's global deltas and redistribute the view.
        if !self.staged_globals.is_empty() {
            let staged = mem::take(&mut self.staged_globals);
            self.globals.reconcile(staged);
            let view = self.globals.view();
            for program in &mut self.programs {
                program.set_global_view(view.clone());
            }
        }

        // 2. Apply update events to the input snapshot and route everything
        // into per-program queues.
        let mut events_routed = 0;
        for event in &events {
            if let EventKind::Update { value } = event.kind {
                if self.space.has_input(event.address) {
                    let _ = self.space.apply_update(event.address, value);
                } else {
                    debug!("update event for unknown address {}", event.address);
                }
            }
            events_routed += self.router.route(event);
        }
        metrics::EVENT_QUEUE_DEPTH.set(self.router.total_pending() as i64);

        // 3. Arbitrate.
        let selection = {
            let registry = self.parameters.lock().ok();
            if registry.is_none() {
                warn!("parameter registry unavailable, ignoring pending changes");
            }
            let period = self.settings.slow_mode_period;
            let candidates: Vec<Candidate<'_>> = self
                .programs
                .iter()
                .filter(|p| p.is_schedulable())
                .map(|p| Candidate {
                    key: &p.key,
                    priority: p.priority,
                    outputs: &p.outputs,
                    due: !p.slow_mode
                        || p.enable_edge
                        || p.skip_counter >= period.saturating_sub(1)
                        || self.router.pending(&p.key) > 0
                        || registry
                            .as_ref()
                            .map(|r| r.has_pending(&p.key))
                            .unwrap_or(false),
                })
                .collect();
            Arbiter::select(&candidates)
        };

        // 4. Evaluate the execution set in arbitration order and merge.
        let mut merge = OutputMerge::new(&selection);
        let mut enable_deltas: Vec<(String, String, EnableDelta)> = Vec::new();
        let mut foreign_writes: Vec<(String, ForeignWrite)> = Vec::new();

        for key in &selection.execute {
            let pending_events = self.router.drain(key);
            let pending_changes = match self.parameters.lock() {
                Ok(mut registry) => registry.drain_changes(key),
                Err(_) => Vec::new(),
            };

            let space = &self.space;
            let program = self
                .programs
                .iter_mut()
                .find(|p| &p.key == key)
                .expect("selected program exists");

            let outcome = program.run_tick(ctx, space, pending_events, pending_changes);

            metrics::PROGRAM_TICK_DURATION
                .with_label_values(&[program.key.as_str()])
                .observe(outcome.duration.as_micros() as f64);
            if outcome.duration > self.settings.tick_budget {
                metrics::PROGRAM_BUDGET_OVERRUNS
                    .with_label_values(&[program.key.as_str()])
                    .inc();
                debug!(
                    "program {} exceeded its tick budget: {:?}",
                    program.key, outcome.duration
                );
            }

            if outcome.failed {
                program.consecutive_failures += 1;
                metrics::PROGRAM_FAILURES
                    .with_label_values(&[program.key.as_str()])
                    .set(i64::from(program.consecutive_failures));
                if program.consecutive_failures >= self.settings.max_consecutive_failures {
                    warn!(
                        "program {} disabled after {} consecutive failures",
                        program.key, program.consecutive_failures
                    );
                    program.set_enabled(false);
                }
                continue;
            }

            program.consecutive_failures = 0;
            metrics::PROGRAM_FAILURES
                .with_label_values(&[program.key.as_str()])
                .set(0);

            merge.offer(program.priority, &outcome.outputs);
            if !outcome.global_deltas.is_empty() {
                self.staged_globals.push((key.clone(), outcome.global_deltas));
            }
            for (target, delta) in outcome.enable_deltas {
                enable_deltas.push((key.clone(), target, delta));
            }
            for write in outcome.foreign_writes {
                foreign_writes.push((key.clone(), write));
            }
        }

        // 5. Skipped slow programs age; their addresses stayed reserved.
        for key in &selection.skipped {
            if let Some(program) = self.programs.iter_mut().find(|p| &p.key == key) {
                program.skip_counter += 1;
            }
        }

        // 6. Queues of programs that did not run are dropped without
        // dispatch, like the queues of disabled programs.
        let executed: HashSet<&str> = selection.execute.iter().map(String::as_str).collect();
        let stale: Vec<String> = self
            .programs
            .iter()
            .filter(|p| !executed.contains(p.key.as_str()))
            .map(|p| p.key.clone())
            .collect();
        for key in stale {
            self.router.clear(&key);
        }

        // 7. Harvested side effects become visible at this boundary.
        for (writer, target, delta) in enable_deltas {
            match self.programs.iter_mut().find(|p| p.key == target) {
                Some(program) => {
                    let enabled = match delta {
                        EnableDelta::Enable => true,
                        EnableDelta::Disable => false,
                        EnableDelta::Toggle => !program.enabled,
                    };
                    program.set_enabled(enabled);
                }
                None => warn!("program {} toggled unknown program {}", writer, target),
            }
        }

        if let Ok(mut parameters) = self.parameters.lock() {
            for (writer, write) in foreign_writes {
                let result = match &write {
                    ForeignWrite::SetDiscrete {
                        program,
                        parameter,
                        value,
                    } => parameters.set_discrete(program, parameter, *value),
                    ForeignWrite::SetContinuous {
                        program,
                        parameter,
                        value,
                    } => parameters.set_continuous(program, parameter, *value),
                    ForeignWrite::IncrementDiscrete {
                        program,
                        parameter,
                        delta,
                    } => parameters
                        .increment_discrete(program, parameter, *delta)
                        .map(|_| ()),
                };
                if let Err(err) = result {
                    warn!("program {} foreign parameter write rejected: {}", writer, err);
                }
            }
        } else if !foreign_writes.is_empty() {
            warn!(
                "parameter registry unavailable, dropping {} foreign writes",
                foreign_writes.len()
            );
        }

        metrics::ACTIVE_PROGRAMS.set(self.programs.iter().filter(|p| p.enabled).count() as i64);

        TickReport {
            frame: merge.finish(),
            executed: selection.execute.len(),
            skipped_slow: selection.skipped.len(),
            events_routed,
        }
    }

    /// Apply one queued control command and complete its reply slot.
    pub fn apply_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetActiveProgram {
                fixture,
                program,
                reply,
            } => {
                let _ = reply.send(self.set_active_program(&fixture, &program));
            }
            ControlCommand::CycleActiveProgram { fixture, reply } => {
                let _ = reply.send(self.cycle_active_program(&fixture));
            }
            ControlCommand::SetParameter {
                fixture,
                program,
                parameter,
                request,
                reply,
            } => {
                let _ = reply.send(self.set_parameter(&fixture, &program, &parameter, &request));
            }
            ControlCommand::CycleParameter {
                fixture,
                program,
                parameter,
                reply,
            } => {
                let _ = reply.send(self.cycle_parameter(&fixture, &program, &parameter));
            }
            ControlCommand::SetProgramEnabled {
                program,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_program_enabled(&program, enabled));
            }
            ControlCommand::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    /// Switch a fixture's active program at this tick boundary.
    pub fn set_active_program(&mut self, fixture: &str, program: &str) -> CommandResult<()> {
        let fixture_index = self
            .fixtures
            .iter()
            .position(|f| f.name == fixture)
            .ok_or_else(|| CommandError::NotFound(format!("unknown fixture: {}", fixture)))?;
        let target = self.fixtures[fixture_index]
            .index_of(program)
            .ok_or_else(|| CommandError::NotFound(format!("unknown program: {}", program)))?;
        self.switch_program(fixture_index, target);
        Ok(())
    }

    /// Advance a fixture's active program, skipping MANUAL and EXTERNAL.
    pub fn cycle_active_program(&mut self, fixture: &str) -> CommandResult<String> {
        let fixture_index = self
            .fixtures
            .iter()
            .position(|f| f.name == fixture)
            .ok_or_else(|| CommandError::NotFound(format!("unknown fixture: {}", fixture)))?;
        let target = self.fixtures[fixture_index]
            .cycle_target()
            .map_err(|e| CommandError::Invalid(e.to_string()))?;
        self.switch_program(fixture_index, target);
        Ok(self.fixtures[fixture_index].active_program().to_string())
    }

    fn switch_program(&mut self, fixture_index: usize, target: usize) {
        let (outgoing, incoming) = {
            let fixture = &mut self.fixtures[fixture_index];
            let outgoing = fixture.program_key(fixture.active_program());
            fixture.active_index = target;
            let incoming = fixture.program_key(fixture.active_program());
            (outgoing, incoming)
        };
        if outgoing != incoming {
            // The outgoing program's outputs go absent next tick; the
            // actuator holds its last values (fall-through).
            self.set_enabled_by_key(&outgoing, false);
        }
        self.set_enabled_by_key(&incoming, true);
        info!("active program switched to {}", incoming);
    }

    fn set_enabled_by_key(&mut self, key: &str, enabled: bool) {
        if let Some(program) = self.programs.iter_mut().find(|p| p.key == key) {
            program.set_enabled(enabled);
        }
    }

    fn resolve_program_key(&self, fixture: &str, program: &str) -> CommandResult<String> {
        let fixture = self
            .fixtures
            .iter()
            .find(|f| f.name == fixture)
            .ok_or_else(|| CommandError::NotFound(format!("unknown fixture: {}", fixture)))?;
        if fixture.index_of(program).is_none() {
            return Err(CommandError::NotFound(format!(
                "unknown program: {}",
                program
            )));
        }
        Ok(fixture.program_key(program))
    }

    /// Write a parameter on behalf of the control plane.
    pub fn set_parameter(
        &mut self,
        fixture: &str,
        program: &str,
        parameter: &str,
        request: &ParameterSetRequest,
    ) -> CommandResult<()> {
        let key = self.resolve_program_key(fixture, program)?;
        self.parameters
            .lock()
            .map_err(|_| CommandError::Invalid("parameter registry unavailable".to_string()))?
            .apply_set_request(&key, parameter, request)
            .map_err(map_parameter_error)
    }

    /// Cycle a discrete parameter on behalf of the control plane.
    pub fn cycle_parameter(
        &mut self,
        fixture: &str,
        program: &str,
        parameter: &str,
    ) -> CommandResult<String> {
        let key = self.resolve_program_key(fixture, program)?;
        self.parameters
            .lock()
            .map_err(|_| CommandError::Invalid("parameter registry unavailable".to_string()))?
            .cycle(&key, parameter)
            .map_err(map_parameter_error)
    }

    /// Enable or disable a program by its engine-unique key.
    pub fn set_program_enabled(&mut self, key: &str, enabled: bool) -> CommandResult<()> {
        let program = self
            .programs
            .iter_mut()
            .find(|p| p.key == key)
            .ok_or_else(|| CommandError::NotFound(format!("unknown program: {}", key)))?;
        program.set_enabled(enabled);
        Ok(())
    }

    /// Metadata snapshot for the read side of the control plane.
    ///
    /// If the parameter registry is unavailable the snapshot is still
    /// produced, with empty parameter maps.
    pub fn snapshot(&self) -> EngineSnapshot {
        let parameters = self.parameters.lock().ok();
        let fixtures = self
            .fixtures
            .iter()
            .map(|fixture| {
                let programs = fixture
                    .catalog
                    .iter()
                    .filter_map(|name| {
                        let key = fixture.program_key(name);
                        self.programs.iter().find(|p| p.key == key).map(|program| {
                            (
                                name.clone(),
                                ProgramSnapshot {
                                    priority: program.priority,
                                    slow_mode: program.slow_mode,
                                    enabled: program.enabled,
                                    builtin: program.is_builtin(),
                                    load_failed: program.is_load_failed(),
                                    parameters: parameters
                                        .as_ref()
                                        .map(|r| r.metadata(&key))
                                        .unwrap_or_default(),
                                },
                            )
                        })
                    })
                    .collect();
                (
                    fixture.name.clone(),
                    FixtureSnapshot {
                        output_aliases: fixture
                            .output_aliases
                            .iter()
                            .map(|(alias, _)| alias.clone())
                            .collect(),
                        active_program: fixture.active_program().to_string(),
                        programs,
                    },
                )
            })
            .collect();
        EngineSnapshot { fixtures }
    }
}

fn map_parameter_error(err: CoreError) -> CommandError {
    match err {
        CoreError::UnknownParameter { .. } => CommandError::NotFound(err.to_string()),
        _ => CommandError::Invalid(err.to_string()),
    }
}
