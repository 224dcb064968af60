//! Per-program rhai environment
//!
//! Every program owns its own `Engine + AST + Scope`; nothing script-visible
//! is shared between programs. The host API is registered as native
//! functions over two `Arc<Mutex<..>>`-shared structures: the setup
//! collector (only live while `setup()` runs) and the per-tick buffers that
//! the host clears before and harvests after each evaluation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use noise::{NoiseFn, Perlin};
use rhai::{Array, Dynamic, EvalAltResult, Module, Scope, AST};
use tracing::debug;

use kaleidoscope_core::{
    clamp, lerp, map_from_value, map_range, map_to_value, Address, AddressSpace, EventFilterKind,
    GlobalValue, ParameterRegistry, Value, MAX_PRIORITY,
};

use crate::{HostError, Result};

lazy_static! {
    static ref PERLIN: Perlin = Perlin::new(0);
}

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// A queued request to enable/disable another program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableDelta {
    /// Enable the target program.
    Enable,
    /// Disable the target program.
    Disable,
    /// Flip the target program's enable flag.
    Toggle,
}

/// A queued cross-program parameter mutation, applied at the tick boundary.
#[derive(Debug, Clone)]
pub enum ForeignWrite {
    /// Set a discrete parameter of another program.
    SetDiscrete {
        /// Target program key.
        program: String,
        /// Parameter name.
        parameter: String,
        /// New level value.
        value: i64,
    },
    /// Set a continuous parameter of another program.
    SetContinuous {
        /// Target program key.
        program: String,
        /// Parameter name.
        parameter: String,
        /// New value (clamped by the registry).
        value: f64,
    },
    /// Advance a discrete parameter of another program.
    IncrementDiscrete {
        /// Target program key.
        program: String,
        /// Parameter name.
        parameter: String,
        /// Signed level delta.
        delta: i64,
    },
}

/// One event subscription declared during setup.
#[derive(Debug, Clone)]
pub struct SubscriptionDecl {
    /// Resolved source address.
    pub address: Address,
    /// Selected event kind.
    pub kind: EventFilterKind,
    /// Script function to invoke.
    pub handler: String,
}

/// Everything `setup()` declared, extracted after a successful load.
#[derive(Debug, Clone, Default)]
pub struct SetupInfo {
    /// Priority in `[0, 20]`.
    pub priority: u8,
    /// Whether the program opted into slow mode.
    pub slow_mode: bool,
    /// Declared input addresses.
    pub inputs: HashSet<Address>,
    /// Declared output addresses.
    pub outputs: BTreeSet<Address>,
    /// Declared event subscriptions.
    pub subscriptions: Vec<SubscriptionDecl>,
    /// Parameter name to change-handler name.
    pub parameter_handlers: HashMap<String, String>,
}

/// Buffers harvested after each evaluation.
#[derive(Debug, Default)]
pub struct Harvest {
    /// Output writes made this tick.
    pub outputs: HashMap<Address, Value>,
    /// Global writes made this tick.
    pub global_deltas: Vec<(String, GlobalValue)>,
    /// Queued program enable changes.
    pub enable_deltas: Vec<(String, EnableDelta)>,
    /// Queued cross-program parameter writes.
    pub foreign_writes: Vec<ForeignWrite>,
}

/// Argument passed to an event or parameter-change handler.
#[derive(Debug, Clone, Copy)]
pub enum HandlerArg {
    /// Handler takes no argument.
    None,
    /// Integer argument (update value, discrete parameter value).
    Int(i64),
    /// Float argument (durations, continuous parameter value).
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Run,
}

/// State shared between the host and the registered native functions.
struct ScriptShared {
    phase: Phase,
    key: String,

    // Full universe tables, for alias translation.
    input_aliases: HashMap<String, Address>,
    output_aliases: HashMap<String, Address>,
    groups: HashMap<String, Vec<Address>>,

    // Collected by setup().
    priority: u8,
    slow_mode: bool,
    inputs: HashSet<Address>,
    outputs: BTreeSet<Address>,
    subscriptions: Vec<SubscriptionDecl>,
    parameter_handlers: HashMap<String, String>,

    // Per-tick state.
    input_view: HashMap<Address, Option<Value>>,
    written: HashMap<Address, Value>,
    global_view: HashMap<String, GlobalValue>,
    global_deltas: HashMap<String, GlobalValue>,
    enable_deltas: Vec<(String, EnableDelta)>,
    foreign_writes: Vec<ForeignWrite>,
    tick_gate: bool,
    now: f64,
    time_of_day: u32,
}

impl ScriptShared {
    fn require_setup(&self, what: &str) -> ScriptResult<()> {
        if self.phase != Phase::Setup {
            return Err(format!("{} is only available during setup", what).into());
        }
        Ok(())
    }
}

/// One program's isolated rhai context.
pub struct ScriptHost {
    engine: rhai::Engine,
    ast: AST,
    scope: Scope<'static>,
    shared: Arc<Mutex<ScriptShared>>,
}

impl ScriptHost {
    /// Compile and set up a program.
    ///
    /// Runs the source's top-level statements, then `setup()` under the
    /// restricted setup API. Any script error, unknown alias, invalid
    /// declaration or output write during setup fails the load.
    pub fn load(
        key: &str,
        source: &str,
        space: &AddressSpace,
        parameters: Arc<Mutex<ParameterRegistry>>,
        start: f64,
        time_of_day: u32,
    ) -> Result<(ScriptHost, SetupInfo)> {
        let shared = Arc::new(Mutex::new(ScriptShared {
            phase: Phase::Setup,
            key: key.to_string(),
            input_aliases: space
                .input_aliases()
                .map(|(a, addr)| (a.to_string(), addr))
                .collect(),
            output_aliases: space
                .output_aliases()
                .map(|(a, addr)| (a.to_string(), addr))
                .collect(),
            groups: collect_groups(space),
            priority: 0,
            slow_mode: false,
            inputs: HashSet::new(),
            outputs: BTreeSet::new(),
            subscriptions: Vec::new(),
            parameter_handlers: HashMap::new(),
            input_view: HashMap::new(),
            written: HashMap::new(),
            global_view: HashMap::new(),
            global_deltas: HashMap::new(),
            enable_deltas: Vec::new(),
            foreign_writes: Vec::new(),
            tick_gate: true,
            now: start,
            time_of_day,
        }));

        let engine = build_engine(key, start, shared.clone(), parameters);

        let ast = engine
            .compile(source)
            .map_err(|e| HostError::Compile(e.to_string()))?;

        let mut scope = Scope::new();
        scope.set_value("NOW", start);
        scope.set_value("TIME_OF_DAY", time_of_day as i64);

        // Top-level statements initialize script-local state that persists in
        // the scope across ticks.
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| HostError::Setup(e.to_string()))?;

        if !ast_has_function(&ast, "setup") {
            return Err(HostError::Setup("program has no setup() function".into()));
        }
        if !ast_has_function(&ast, "tick") {
            return Err(HostError::Setup("program has no tick(now) function".into()));
        }

        engine
            .call_fn::<Dynamic>(&mut scope, &ast, "setup", ())
            .map_err(|e| HostError::Setup(e.to_string()))?;

        let info = {
            let mut shared = shared.lock().unwrap();
            shared.phase = Phase::Run;
            SetupInfo {
                priority: shared.priority,
                slow_mode: shared.slow_mode,
                inputs: shared.inputs.clone(),
                outputs: shared.outputs.clone(),
                subscriptions: shared.subscriptions.clone(),
                parameter_handlers: shared.parameter_handlers.clone(),
            }
        };

        // Every declared handler must exist in the source.
        for handler in info
            .subscriptions
            .iter()
            .map(|s| s.handler.as_str())
            .chain(info.parameter_handlers.values().map(String::as_str))
        {
            if !ast_has_function(&ast, handler) {
                return Err(HostError::Setup(format!(
                    "handler function not found: {}",
                    handler
                )));
            }
        }

        debug!(
            "set up program {}: priority={}, slow_mode={}, {} outputs, {} inputs",
            key,
            info.priority,
            info.slow_mode,
            info.outputs.len(),
            info.inputs.len()
        );

        Ok((
            ScriptHost {
                engine,
                ast,
                scope,
                shared,
            },
            info,
        ))
    }

    /// Reset the write buffers; called at the start of the per-tick protocol.
    pub fn clear_tick_buffers(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.written.clear();
        shared.global_deltas.clear();
        shared.enable_deltas.clear();
        shared.foreign_writes.clear();
    }

    /// Refresh the program's restricted input view.
    pub fn set_input_view(&mut self, view: HashMap<Address, Option<Value>>) {
        self.shared.lock().unwrap().input_view = view;
    }

    /// Replace the program's globals read view after reconciliation.
    pub fn set_global_view(&mut self, view: HashMap<String, GlobalValue>) {
        self.shared.lock().unwrap().global_view = view;
    }

    /// Advance the script-visible clock.
    pub fn set_tick_env(&mut self, now: f64, time_of_day: u32) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.now = now;
            shared.time_of_day = time_of_day;
        }
        self.scope.set_value("NOW", now);
        self.scope.set_value("TIME_OF_DAY", time_of_day as i64);
    }

    /// Whether `tick()` invocation is currently enabled for this program.
    pub fn tick_gate(&self) -> bool {
        self.shared.lock().unwrap().tick_gate
    }

    /// Invoke an event or parameter-change handler.
    pub fn call_handler(&mut self, name: &str, arg: HandlerArg) -> Result<()> {
        let result = match arg {
            HandlerArg::None => {
                self.engine
                    .call_fn::<Dynamic>(&mut self.scope, &self.ast, name, ())
            }
            HandlerArg::Int(v) => {
                self.engine
                    .call_fn::<Dynamic>(&mut self.scope, &self.ast, name, (v,))
            }
            HandlerArg::Float(v) => {
                self.engine
                    .call_fn::<Dynamic>(&mut self.scope, &self.ast, name, (v,))
            }
        };
        result.map(|_| ()).map_err(HostError::from)
    }

    /// Invoke `tick(now)`.
    pub fn call_tick(&mut self, now: f64) -> Result<()> {
        self.engine
            .call_fn::<Dynamic>(&mut self.scope, &self.ast, "tick", (now,))
            .map(|_| ())
            .map_err(HostError::from)
    }

    /// Take everything the program wrote this tick.
    pub fn harvest(&mut self) -> Harvest {
        let mut shared = self.shared.lock().unwrap();
        Harvest {
            outputs: std::mem::take(&mut shared.written),
            global_deltas: shared.global_deltas.drain().collect(),
            enable_deltas: std::mem::take(&mut shared.enable_deltas),
            foreign_writes: std::mem::take(&mut shared.foreign_writes),
        }
    }
}

fn collect_groups(space: &AddressSpace) -> HashMap<String, Vec<Address>> {
    // The address space owns group resolution; the script side keeps a copy
    // so translations stay allocation-free during ticks.
    space
        .group_names()
        .map(|name| {
            let addrs = space.resolve_group(name).expect("group names are valid");
            (name.to_string(), addrs.to_vec())
        })
        .collect()
}

fn ast_has_function(ast: &AST, name: &str) -> bool {
    ast.iter_functions().any(|f| f.name == name)
}

// A poisoned registry surfaces as a script error for the offending call,
// never as a panic on the scheduler thread.
fn lock_registry(
    parameters: &Arc<Mutex<ParameterRegistry>>,
) -> ScriptResult<std::sync::MutexGuard<'_, ParameterRegistry>> {
    parameters
        .lock()
        .map_err(|_| "parameter registry unavailable".to_string().into())
}

fn as_f64(value: &Dynamic, what: &str) -> ScriptResult<f64> {
    value
        .as_float()
        .or_else(|_| value.as_int().map(|i| i as f64))
        .map_err(|_| format!("{} expects a number", what).into())
}

fn as_i64(value: &Dynamic, what: &str) -> ScriptResult<i64> {
    value
        .as_int()
        .or_else(|_| value.as_float().map(|f| f.round() as i64))
        .map_err(|_| format!("{} expects a number", what).into())
}

fn as_channel_value(value: &Dynamic, what: &str) -> ScriptResult<Value> {
    Ok(as_i64(value, what)?.clamp(0, i64::from(u16::MAX)) as Value)
}

fn dynamic_to_global(value: &Dynamic) -> ScriptResult<GlobalValue> {
    if value.is_unit() {
        Ok(GlobalValue::Null)
    } else if let Ok(b) = value.as_bool() {
        Ok(GlobalValue::Bool(b))
    } else if let Ok(i) = value.as_int() {
        Ok(GlobalValue::Integer(i))
    } else if let Ok(f) = value.as_float() {
        Ok(GlobalValue::Real(f))
    } else if value.is_string() {
        Ok(GlobalValue::Text(
            value.clone().into_string().expect("checked is_string"),
        ))
    } else {
        Err(format!("global values must be scalar, got {}", value.type_name()).into())
    }
}

fn global_to_dynamic(value: &GlobalValue) -> Dynamic {
    match value {
        GlobalValue::Null => Dynamic::UNIT,
        GlobalValue::Bool(b) => (*b).into(),
        GlobalValue::Integer(i) => (*i).into(),
        GlobalValue::Real(f) => (*f).into(),
        GlobalValue::Text(s) => s.clone().into(),
    }
}

fn parse_levels(levels: &Array) -> ScriptResult<Vec<kaleidoscope_core::DiscreteLevel>> {
    let mut out = Vec::with_capacity(levels.len());
    for entry in levels {
        let pair: Array = entry
            .clone()
            .try_cast()
            .ok_or_else(|| "levels must be [label, value] pairs".to_string())?;
        if pair.len() != 2 {
            return Err("levels must be [label, value] pairs".to_string().into());
        }
        let label = pair[0]
            .clone()
            .into_string()
            .map_err(|_| "level label must be a string".to_string())?;
        let value = as_i64(&pair[1], "level value")?;
        out.push(kaleidoscope_core::DiscreteLevel { label, value });
    }
    Ok(out)
}

/// Build the engine for one program and register the full host API.
fn build_engine(
    key: &str,
    start: f64,
    shared: Arc<Mutex<ScriptShared>>,
    parameters: Arc<Mutex<ParameterRegistry>>,
) -> rhai::Engine {
    let mut engine = rhai::Engine::new();

    // Sandbox limits; scripts are operator-authored but a stray infinite
    // loop must not stall the scheduler forever.
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(64);
    engine.set_max_operations(1_000_000);
    engine.set_max_string_size(10_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(1_000);

    let mut constants = Module::new();
    constants.set_var("LOW", i64::from(kaleidoscope_core::LOW));
    constants.set_var("HIGH", i64::from(kaleidoscope_core::HIGH));
    constants.set_var("START", start);
    constants.set_var("PROGRAM_NAME", key.to_string());
    engine.register_global_module(constants.into());

    register_math(&mut engine);
    register_setup_api(&mut engine, &shared, &parameters);
    register_runtime_api(&mut engine, &shared, &parameters);

    engine
}

fn register_math(engine: &mut rhai::Engine) {
    engine.register_fn("clamp", |x: Dynamic, lo: Dynamic, hi: Dynamic| -> ScriptResult<f64> {
        Ok(clamp(
            as_f64(&x, "clamp")?,
            as_f64(&lo, "clamp")?,
            as_f64(&hi, "clamp")?,
        ))
    });
    engine.register_fn("lerp", |a: Dynamic, b: Dynamic, t: Dynamic| -> ScriptResult<f64> {
        Ok(lerp(
            as_f64(&a, "lerp")?,
            as_f64(&b, "lerp")?,
            as_f64(&t, "lerp")?,
        ))
    });
    engine.register_fn(
        "map_range",
        |x: Dynamic, in_lo: Dynamic, in_hi: Dynamic, out_lo: Dynamic, out_hi: Dynamic| -> ScriptResult<f64> {
            Ok(map_range(
                as_f64(&x, "map_range")?,
                as_f64(&in_lo, "map_range")?,
                as_f64(&in_hi, "map_range")?,
                as_f64(&out_lo, "map_range")?,
                as_f64(&out_hi, "map_range")?,
            ))
        },
    );
    engine.register_fn(
        "map_to_value",
        |lower: Dynamic, upper: Dynamic, x: Dynamic| -> ScriptResult<i64> {
            Ok(i64::from(map_to_value(
                as_f64(&lower, "map_to_value")?,
                as_f64(&upper, "map_to_value")?,
                as_f64(&x, "map_to_value")?,
            )))
        },
    );
    engine.register_fn(
        "map_from_value",
        |lower: Dynamic, upper: Dynamic, v: Dynamic| -> ScriptResult<f64> {
            Ok(map_from_value(
                as_f64(&lower, "map_from_value")?,
                as_f64(&upper, "map_from_value")?,
                as_channel_value(&v, "map_from_value")?,
            ))
        },
    );
    engine.register_fn("noise2d", |x: Dynamic, y: Dynamic| -> ScriptResult<f64> {
        Ok(PERLIN.get([as_f64(&x, "noise2d")?, as_f64(&y, "noise2d")?]))
    });
    engine.register_fn(
        "noise3d",
        |x: Dynamic, y: Dynamic, z: Dynamic| -> ScriptResult<f64> {
            Ok(PERLIN.get([
                as_f64(&x, "noise3d")?,
                as_f64(&y, "noise3d")?,
                as_f64(&z, "noise3d")?,
            ]))
        },
    );
    engine.register_fn(
        "noise4d",
        |x: Dynamic, y: Dynamic, z: Dynamic, t: Dynamic| -> ScriptResult<f64> {
            Ok(PERLIN.get([
                as_f64(&x, "noise4d")?,
                as_f64(&y, "noise4d")?,
                as_f64(&z, "noise4d")?,
                as_f64(&t, "noise4d")?,
            ]))
        },
    );
}

fn register_setup_api(
    engine: &mut rhai::Engine,
    shared: &Arc<Mutex<ScriptShared>>,
    parameters: &Arc<Mutex<ParameterRegistry>>,
) {
    {
        let shared = shared.clone();
        engine.register_fn("set_priority", move |priority: i64| -> ScriptResult<()> {
            let mut shared = shared.lock().unwrap();
            shared.require_setup("set_priority")?;
            if !(0..=i64::from(MAX_PRIORITY)).contains(&priority) {
                return Err(format!(
                    "priority must be in [0, {}], got {}",
                    MAX_PRIORITY, priority
                )
                .into());
            }
            shared.priority = priority as u8;
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("set_slow_mode", move |slow: bool| -> ScriptResult<()> {
            let mut shared = shared.lock().unwrap();
            shared.require_setup("set_slow_mode")?;
            shared.slow_mode = slow;
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("add_input_alias", move |alias: &str| -> ScriptResult<()> {
            let mut shared = shared.lock().unwrap();
            shared.require_setup("add_input_alias")?;
            let address = *shared
                .input_aliases
                .get(alias)
                .ok_or_else(|| format!("unknown alias: {}", alias))?;
            shared.inputs.insert(address);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("add_output_alias", move |alias: &str| -> ScriptResult<()> {
            let mut shared = shared.lock().unwrap();
            shared.require_setup("add_output_alias")?;
            let address = *shared
                .output_aliases
                .get(alias)
                .ok_or_else(|| format!("unknown alias: {}", alias))?;
            shared.outputs.insert(address);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("add_output_group", move |group: &str| -> ScriptResult<()> {
            let mut shared = shared.lock().unwrap();
            shared.require_setup("add_output_group")?;
            let addresses = shared
                .groups
                .get(group)
                .cloned()
                .ok_or_else(|| format!("unknown group: {}", group))?;
            shared.outputs.extend(addresses);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "add_event_subscription",
            move |alias: &str, kind: &str, handler: &str| -> ScriptResult<()> {
                let mut shared = shared.lock().unwrap();
                shared.require_setup("add_event_subscription")?;
                let address = *shared
                    .input_aliases
                    .get(alias)
                    .ok_or_else(|| format!("unknown alias: {}", alias))?;
                let kind = EventFilterKind::from_name(kind)
                    .ok_or_else(|| format!("invalid event type: {}", kind))?;
                shared.subscriptions.push(SubscriptionDecl {
                    address,
                    kind,
                    handler: handler.to_string(),
                });
                Ok(())
            },
        );
    }

    // declare_discrete_parameter(name, description, levels, initial [, handler])
    {
        let shared = shared.clone();
        let parameters = parameters.clone();
        engine.register_fn(
            "declare_discrete_parameter",
            move |name: &str,
                  description: &str,
                  levels: Array,
                  initial: Dynamic,
                  handler: &str|
                  -> ScriptResult<()> {
                declare_discrete(&shared, &parameters, name, description, &levels, &initial, Some(handler))
            },
        );
    }
    {
        let shared = shared.clone();
        let parameters = parameters.clone();
        engine.register_fn(
            "declare_discrete_parameter",
            move |name: &str, description: &str, levels: Array, initial: Dynamic| -> ScriptResult<()> {
                declare_discrete(&shared, &parameters, name, description, &levels, &initial, None)
            },
        );
    }

    // declare_continuous_parameter(name, description, lower, upper, initial [, handler])
    {
        let shared = shared.clone();
        let parameters = parameters.clone();
        engine.register_fn(
            "declare_continuous_parameter",
            move |name: &str,
                  description: &str,
                  lower: Dynamic,
                  upper: Dynamic,
                  initial: Dynamic,
                  handler: &str|
                  -> ScriptResult<()> {
                declare_continuous(
                    &shared, &parameters, name, description, &lower, &upper, &initial,
                    Some(handler),
                )
            },
        );
    }
    {
        let shared = shared.clone();
        let parameters = parameters.clone();
        engine.register_fn(
            "declare_continuous_parameter",
            move |name: &str,
                  description: &str,
                  lower: Dynamic,
                  upper: Dynamic,
                  initial: Dynamic|
                  -> ScriptResult<()> {
                declare_continuous(
                    &shared, &parameters, name, description, &lower, &upper, &initial, None,
                )
            },
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn declare_discrete(
    shared: &Arc<Mutex<ScriptShared>>,
    parameters: &Arc<Mutex<ParameterRegistry>>,
    name: &str,
    description: &str,
    levels: &Array,
    initial: &Dynamic,
    handler: Option<&str>,
) -> ScriptResult<()> {
    let mut shared = shared.lock().unwrap();
    shared.require_setup("declare_discrete_parameter")?;
    let levels = parse_levels(levels)?;
    let initial = as_i64(initial, "initial value")?;
    lock_registry(parameters)?
        .declare_discrete(&shared.key, name, description, levels, initial)
        .map_err(|e| -> Box<EvalAltResult> { e.to_string().into() })?;
    if let Some(handler) = handler {
        shared
            .parameter_handlers
            .insert(name.to_string(), handler.to_string());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn declare_continuous(
    shared: &Arc<Mutex<ScriptShared>>,
    parameters: &Arc<Mutex<ParameterRegistry>>,
    name: &str,
    description: &str,
    lower: &Dynamic,
    upper: &Dynamic,
    initial: &Dynamic,
    handler: Option<&str>,
) -> ScriptResult<()> {
    let mut shared = shared.lock().unwrap();
    shared.require_setup("declare_continuous_parameter")?;
    lock_registry(parameters)?
        .declare_continuous(
            &shared.key,
            name,
            description,
            as_f64(lower, "lower bound")?,
            as_f64(upper, "upper bound")?,
            as_f64(initial, "initial value")?,
        )
        .map_err(|e| -> Box<EvalAltResult> { e.to_string().into() })?;
    if let Some(handler) = handler {
        shared
            .parameter_handlers
            .insert(name.to_string(), handler.to_string());
    }
    Ok(())
}

fn register_runtime_api(
    engine: &mut rhai::Engine,
    shared: &Arc<Mutex<ScriptShared>>,
    parameters: &Arc<Mutex<ParameterRegistry>>,
) {
    {
        let shared = shared.clone();
        engine.register_fn("get_alias", move |alias: &str| -> ScriptResult<Dynamic> {
            let shared = shared.lock().unwrap();
            let address = *shared
                .input_aliases
                .get(alias)
                .ok_or_else(|| format!("unknown alias: {}", alias))?;
            match shared.input_view.get(&address) {
                Some(Some(value)) => Ok(Dynamic::from(i64::from(*value))),
                Some(None) => Ok(Dynamic::UNIT),
                None => Err(format!("input not declared during setup: {}", alias).into()),
            }
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "set_alias",
            move |alias: &str, value: Dynamic| -> ScriptResult<()> {
                let mut shared = shared.lock().unwrap();
                if shared.phase == Phase::Setup {
                    return Err("outputs may not be written during setup".to_string().into());
                }
                let address = *shared
                    .output_aliases
                    .get(alias)
                    .ok_or_else(|| format!("unknown alias: {}", alias))?;
                if !shared.outputs.contains(&address) {
                    return Err(format!("output not declared during setup: {}", alias).into());
                }
                let value = as_channel_value(&value, "set_alias")?;
                shared.written.insert(address, value);
                Ok(())
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "set_group",
            move |group: &str, value: Dynamic| -> ScriptResult<()> {
                let mut shared = shared.lock().unwrap();
                if shared.phase == Phase::Setup {
                    return Err("outputs may not be written during setup".to_string().into());
                }
                let addresses = shared
                    .groups
                    .get(group)
                    .cloned()
                    .ok_or_else(|| format!("unknown group: {}", group))?;
                let value = as_channel_value(&value, "set_group")?;
                for address in addresses {
                    if !shared.outputs.contains(&address) {
                        return Err(
                            format!("group {} contains undeclared output {}", group, address)
                                .into(),
                        );
                    }
                    shared.written.insert(address, value);
                }
                Ok(())
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn("get_global", move |key: &str| -> Dynamic {
            let shared = shared.lock().unwrap();
            shared
                .global_view
                .get(key)
                .map(global_to_dynamic)
                .unwrap_or(Dynamic::UNIT)
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "set_global",
            move |key: &str, value: Dynamic| -> ScriptResult<()> {
                let value = dynamic_to_global(&value)?;
                let mut shared = shared.lock().unwrap();
                shared.global_view.insert(key.to_string(), value.clone());
                shared.global_deltas.insert(key.to_string(), value);
                Ok(())
            },
        );
    }

    // Own parameters: immediate, through the central registry.
    {
        let shared = shared.clone();
        let parameters = parameters.clone();
        engine.register_fn(
            "get_parameter_value",
            move |name: &str| -> ScriptResult<Dynamic> {
                let key = shared.lock().unwrap().key.clone();
                read_parameter(&parameters, &key, name)
            },
        );
    }
    {
        let shared = shared.clone();
        let parameters = parameters.clone();
        engine.register_fn(
            "set_parameter_value",
            move |name: &str, value: Dynamic| -> ScriptResult<()> {
                let key = shared.lock().unwrap().key.clone();
                write_parameter(&parameters, &key, name, &value)
            },
        );
    }
    {
        let shared = shared.clone();
        let parameters = parameters.clone();
        engine.register_fn(
            "increment_parameter_value",
            move |name: &str, delta: i64| -> ScriptResult<i64> {
                let key = shared.lock().unwrap().key.clone();
                lock_registry(&parameters)?
                    .increment_discrete(&key, name, delta)
                    .map_err(|e| e.to_string().into())
            },
        );
    }

    // Foreign parameters: reads are immediate, writes queue to the boundary.
    {
        let parameters = parameters.clone();
        engine.register_fn(
            "get_foreign_parameter_value",
            move |program: &str, name: &str| -> ScriptResult<Dynamic> {
                read_parameter(&parameters, program, name)
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "set_foreign_parameter_value",
            move |program: &str, name: &str, value: Dynamic| -> ScriptResult<()> {
                let write = if let Ok(i) = value.as_int() {
                    ForeignWrite::SetDiscrete {
                        program: program.to_string(),
                        parameter: name.to_string(),
                        value: i,
                    }
                } else if let Ok(f) = value.as_float() {
                    ForeignWrite::SetContinuous {
                        program: program.to_string(),
                        parameter: name.to_string(),
                        value: f,
                    }
                } else {
                    return Err("parameter values must be numbers".to_string().into());
                };
                shared.lock().unwrap().foreign_writes.push(write);
                Ok(())
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "increment_foreign_parameter_value",
            move |program: &str, name: &str, delta: i64| -> ScriptResult<()> {
                shared
                    .lock().unwrap()
                    .foreign_writes
                    .push(ForeignWrite::IncrementDiscrete {
                        program: program.to_string(),
                        parameter: name.to_string(),
                        delta,
                    });
                Ok(())
            },
        );
    }

    // Program enable signals, applied at the tick boundary.
    for (fn_name, delta) in [
        ("program_enable", EnableDelta::Enable),
        ("program_disable", EnableDelta::Disable),
        ("program_enable_toggle", EnableDelta::Toggle),
    ] {
        let shared = shared.clone();
        engine.register_fn(fn_name, move |program: &str| {
            shared
                .lock().unwrap()
                .enable_deltas
                .push((program.to_string(), delta));
        });
    }

    {
        let shared = shared.clone();
        engine.register_fn("enable_tick", move || {
            shared.lock().unwrap().tick_gate = true;
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("disable_tick", move || {
            shared.lock().unwrap().tick_gate = false;
        });
    }

    {
        let shared = shared.clone();
        engine.register_fn("now", move || -> f64 { shared.lock().unwrap().now });
    }
    {
        let shared = shared.clone();
        engine.register_fn("time_of_day", move || -> i64 {
            i64::from(shared.lock().unwrap().time_of_day)
        });
    }

    // Alias and group translation.
    {
        let shared = shared.clone();
        engine.register_fn(
            "input_alias_to_address",
            move |alias: &str| -> ScriptResult<i64> {
                shared
                    .lock().unwrap()
                    .input_aliases
                    .get(alias)
                    .map(|a| i64::from(*a))
                    .ok_or_else(|| format!("unknown alias: {}", alias).into())
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "output_alias_to_address",
            move |alias: &str| -> ScriptResult<i64> {
                shared
                    .lock().unwrap()
                    .output_aliases
                    .get(alias)
                    .map(|a| i64::from(*a))
                    .ok_or_else(|| format!("unknown alias: {}", alias).into())
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "group_to_addresses",
            move |group: &str| -> ScriptResult<Array> {
                shared
                    .lock().unwrap()
                    .groups
                    .get(group)
                    .map(|addrs| {
                        addrs
                            .iter()
                            .map(|a| Dynamic::from(i64::from(*a)))
                            .collect::<Array>()
                    })
                    .ok_or_else(|| format!("unknown group: {}", group).into())
            },
        );
    }
}

fn read_parameter(
    parameters: &Arc<Mutex<ParameterRegistry>>,
    program: &str,
    name: &str,
) -> ScriptResult<Dynamic> {
    let registry = lock_registry(parameters)?;
    match registry.get_discrete(program, name) {
        Ok(value) => Ok(Dynamic::from(value)),
        Err(kaleidoscope_core::CoreError::NotDiscrete { .. }) => registry
            .get_continuous(program, name)
            .map(Dynamic::from)
            .map_err(|e| e.to_string().into()),
        Err(e) => Err(e.to_string().into()),
    }
}

fn write_parameter(
    parameters: &Arc<Mutex<ParameterRegistry>>,
    program: &str,
    name: &str,
    value: &Dynamic,
) -> ScriptResult<()> {
    let mut registry = lock_registry(parameters)?;
    if let Ok(i) = value.as_int() {
        registry
            .set_discrete(program, name, i)
            .map_err(|e| e.to_string().into())
    } else if let Ok(f) = value.as_float() {
        registry
            .set_continuous(program, name, f)
            .map_err(|e| e.to_string().into())
    } else {
        Err("parameter values must be numbers".to_string().into())
    }
}
