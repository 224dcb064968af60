//! Parameter registry
//!
//! Parameters are addressable as `(program_key, parameter_name)`. Discrete
//! parameters carry an ordered, finite level set; continuous parameters carry
//! inclusive real bounds and clamp writes. Every mutation that changes the
//! current value queues a change notification for the owning program, which
//! the host delivers to the program's change handler before its next tick.

use std::collections::{BTreeMap, HashMap};
use std::mem;

use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// One level of a discrete parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteLevel {
    /// Display label.
    pub label: String,
    /// The integer value scripts and the control plane use.
    pub value: i64,
}

/// Parameter payload: discrete level set or continuous range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Ordered finite level set with the index of the current level.
    Discrete {
        /// The declared levels, in order.
        levels: Vec<DiscreteLevel>,
        /// Index of the current level.
        index: usize,
    },
    /// Inclusive real range with the current value.
    Continuous {
        /// Inclusive lower bound.
        lower: f64,
        /// Inclusive upper bound.
        upper: f64,
        /// Current value, always within bounds.
        current: f64,
    },
}

/// A declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Operator-facing description.
    pub description: String,
    /// The typed payload.
    #[serde(flatten)]
    pub kind: ParameterKind,
}

/// A write request as it arrives from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterSetRequest {
    /// Set a discrete parameter to a declared value.
    Discrete {
        /// The target level value.
        value: i64,
    },
    /// Set a continuous parameter; out-of-range values are clamped.
    Continuous {
        /// The target value.
        value: f64,
    },
}

/// A change notification queued for the owning program.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChange {
    /// Name of the changed parameter.
    pub parameter: String,
    /// The new value.
    pub value: ChangedValue,
}

/// The new value carried by a change notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangedValue {
    /// New discrete level value.
    Discrete(i64),
    /// New continuous value.
    Continuous(f64),
}

/// Central registry of every program's parameters.
#[derive(Debug, Default)]
pub struct ParameterRegistry {
    programs: HashMap<String, BTreeMap<String, Parameter>>,
    pending: HashMap<String, Vec<ParameterChange>>,
}

impl ParameterRegistry {
    /// Create an empty registry.
    pub fn new() -> ParameterRegistry {
        ParameterRegistry::default()
    }

    /// Declare a discrete parameter. The initial value must be in the set.
    pub fn declare_discrete(
        &mut self,
        program: &str,
        name: &str,
        description: &str,
        levels: Vec<DiscreteLevel>,
        initial: i64,
    ) -> Result<()> {
        self.check_fresh(program, name)?;
        if levels.is_empty() {
            return Err(CoreError::InvalidDeclaration(format!(
                "discrete parameter {} has no levels",
                name
            )));
        }
        let index = levels
            .iter()
            .position(|l| l.value == initial)
            .ok_or_else(|| CoreError::InvalidLevel {
                parameter: name.to_string(),
                value: initial,
            })?;

        self.programs.entry(program.to_string()).or_default().insert(
            name.to_string(),
            Parameter {
                description: description.to_string(),
                kind: ParameterKind::Discrete { levels, index },
            },
        );
        Ok(())
    }

    /// Declare a continuous parameter. The initial value is clamped.
    pub fn declare_continuous(
        &mut self,
        program: &str,
        name: &str,
        description: &str,
        lower: f64,
        upper: f64,
        initial: f64,
    ) -> Result<()> {
        self.check_fresh(program, name)?;
        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            return Err(CoreError::InvalidDeclaration(format!(
                "continuous parameter {} has invalid bounds [{}, {}]",
                name, lower, upper
            )));
        }

        self.programs.entry(program.to_string()).or_default().insert(
            name.to_string(),
            Parameter {
                description: description.to_string(),
                kind: ParameterKind::Continuous {
                    lower,
                    upper,
                    current: crate::clamp(initial, lower, upper),
                },
            },
        );
        Ok(())
    }

    fn check_fresh(&self, program: &str, name: &str) -> Result<()> {
        let exists = self
            .programs
            .get(program)
            .map(|params| params.contains_key(name))
            .unwrap_or(false);
        if exists {
            return Err(CoreError::DuplicateParameter {
                program: program.to_string(),
                parameter: name.to_string(),
            });
        }
        Ok(())
    }

    fn parameter(&self, program: &str, name: &str) -> Result<&Parameter> {
        self.programs
            .get(program)
            .and_then(|params| params.get(name))
            .ok_or_else(|| CoreError::UnknownParameter {
                program: program.to_string(),
                parameter: name.to_string(),
            })
    }

    fn parameter_mut(&mut self, program: &str, name: &str) -> Result<&mut Parameter> {
        self.programs
            .get_mut(program)
            .and_then(|params| params.get_mut(name))
            .ok_or_else(|| CoreError::UnknownParameter {
                program: program.to_string(),
                parameter: name.to_string(),
            })
    }

    /// Current value of a discrete parameter.
    pub fn get_discrete(&self, program: &str, name: &str) -> Result<i64> {
        match &self.parameter(program, name)?.kind {
            ParameterKind::Discrete { levels, index } => Ok(levels[*index].value),
            ParameterKind::Continuous { .. } => Err(CoreError::NotDiscrete {
                program: program.to_string(),
                parameter: name.to_string(),
            }),
        }
    }

    /// Current value of a continuous parameter.
    pub fn get_continuous(&self, program: &str, name: &str) -> Result<f64> {
        match &self.parameter(program, name)?.kind {
            ParameterKind::Continuous { current, .. } => Ok(*current),
            ParameterKind::Discrete { .. } => Err(CoreError::NotContinuous {
                program: program.to_string(),
                parameter: name.to_string(),
            }),
        }
    }

    /// Set a discrete parameter to a declared value.
    pub fn set_discrete(&mut self, program: &str, name: &str, value: i64) -> Result<()> {
        let changed = {
            let param = self.parameter_mut(program, name)?;
            match &mut param.kind {
                ParameterKind::Discrete { levels, index } => {
                    let new_index = levels
                        .iter()
                        .position(|l| l.value == value)
                        .ok_or_else(|| CoreError::InvalidLevel {
                            parameter: name.to_string(),
                            value,
                        })?;
                    let changed = new_index != *index;
                    *index = new_index;
                    changed
                }
                ParameterKind::Continuous { .. } => {
                    return Err(CoreError::NotDiscrete {
                        program: program.to_string(),
                        parameter: name.to_string(),
                    })
                }
            }
        };
        if changed {
            self.queue_change(program, name, ChangedValue::Discrete(value));
        }
        Ok(())
    }

    /// Set a continuous parameter, clamping into its bounds.
    pub fn set_continuous(&mut self, program: &str, name: &str, value: f64) -> Result<()> {
        let change = {
            let param = self.parameter_mut(program, name)?;
            match &mut param.kind {
                ParameterKind::Continuous {
                    lower,
                    upper,
                    current,
                } => {
                    let clamped = crate::clamp(value, *lower, *upper);
                    let changed = clamped != *current;
                    *current = clamped;
                    changed.then_some(clamped)
                }
                ParameterKind::Discrete { .. } => {
                    return Err(CoreError::NotContinuous {
                        program: program.to_string(),
                        parameter: name.to_string(),
                    })
                }
            }
        };
        if let Some(clamped) = change {
            self.queue_change(program, name, ChangedValue::Continuous(clamped));
        }
        Ok(())
    }

    /// Advance a discrete parameter's level index by a signed delta,
    /// wrapping modulo the level count. Returns the new value.
    pub fn increment_discrete(&mut self, program: &str, name: &str, delta: i64) -> Result<i64> {
        let (value, changed) = {
            let param = self.parameter_mut(program, name)?;
            match &mut param.kind {
                ParameterKind::Discrete { levels, index } => {
                    let count = levels.len() as i64;
                    let new_index = (*index as i64 + delta).rem_euclid(count) as usize;
                    let changed = new_index != *index;
                    *index = new_index;
                    (levels[new_index].value, changed)
                }
                ParameterKind::Continuous { .. } => {
                    return Err(CoreError::NotDiscrete {
                        program: program.to_string(),
                        parameter: name.to_string(),
                    })
                }
            }
        };
        if changed {
            self.queue_change(program, name, ChangedValue::Discrete(value));
        }
        Ok(value)
    }

    /// Advance a discrete parameter by one level with wrap-around.
    /// Returns the label of the new level.
    pub fn cycle(&mut self, program: &str, name: &str) -> Result<String> {
        self.increment_discrete(program, name, 1)?;
        match &self.parameter(program, name)?.kind {
            ParameterKind::Discrete { levels, index } => Ok(levels[*index].label.clone()),
            ParameterKind::Continuous { .. } => unreachable!("increment checked the kind"),
        }
    }

    /// Apply a control-plane write request.
    pub fn apply_set_request(
        &mut self,
        program: &str,
        name: &str,
        request: &ParameterSetRequest,
    ) -> Result<()> {
        match request {
            ParameterSetRequest::Discrete { value } => self.set_discrete(program, name, *value),
            ParameterSetRequest::Continuous { value } => {
                self.set_continuous(program, name, *value)
            }
        }
    }

    fn queue_change(&mut self, program: &str, name: &str, value: ChangedValue) {
        self.pending
            .entry(program.to_string())
            .or_default()
            .push(ParameterChange {
                parameter: name.to_string(),
                value,
            });
    }

    /// Whether change notifications are waiting for a program.
    pub fn has_pending(&self, program: &str) -> bool {
        self.pending
            .get(program)
            .map(|changes| !changes.is_empty())
            .unwrap_or(false)
    }

    /// Take the queued change notifications for a program.
    pub fn drain_changes(&mut self, program: &str) -> Vec<ParameterChange> {
        self.pending
            .get_mut(program)
            .map(mem::take)
            .unwrap_or_default()
    }

    /// Metadata snapshot of one program's parameters.
    pub fn metadata(&self, program: &str) -> BTreeMap<String, Parameter> {
        self.programs.get(program).cloned().unwrap_or_default()
    }

    /// Whether the program has declared a parameter with this name.
    pub fn has_parameter(&self, program: &str, name: &str) -> bool {
        self.programs
            .get(program)
            .map(|params| params.contains_key(name))
            .unwrap_or(false)
    }
}
