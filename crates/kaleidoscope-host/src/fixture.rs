//! Fixtures: disjoint output bundles with one active program each

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use kaleidoscope_core::Address;

use crate::{HostError, Result};

/// Name of the built-in all-LOW program.
pub const PROGRAM_OFF: &str = "OFF";
/// Name of the built-in all-HIGH program.
pub const PROGRAM_ON: &str = "ON";
/// Name of the built-in per-output manual program.
pub const PROGRAM_MANUAL: &str = "MANUAL";
/// Name of the built-in no-op program for externally driven fixtures.
pub const PROGRAM_EXTERNAL: &str = "EXTERNAL";

/// One program entry in a fixture file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramEntry {
    /// Program name within the fixture.
    pub name: String,
    /// Script path, relative to the fixture file.
    pub path: PathBuf,
}

/// A fixture declaration as loaded from a YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureConfig {
    /// Fixture name, unique across the engine.
    pub name: String,
    /// Owned output aliases. Must be disjoint from every other fixture.
    pub outputs: Vec<String>,
    /// Operator-authored programs for this fixture.
    #[serde(default)]
    pub programs: Vec<ProgramEntry>,
    /// Disable the OFF/ON built-ins.
    #[serde(default)]
    pub disable_builtin_programs: bool,
    /// Disable the MANUAL built-in.
    #[serde(default)]
    pub disable_manual_program: bool,
}

impl FixtureConfig {
    /// Load one fixture file.
    pub fn from_file(path: &Path) -> Result<FixtureConfig> {
        let contents = fs::read_to_string(path)?;
        let config: FixtureConfig = serde_yaml::from_str(&contents)
            .map_err(|e| HostError::Config(format!("fixture file {:?}: {}", path, e)))?;

        if config.name.is_empty() {
            return Err(HostError::Config(format!(
                "fixture file {:?} has no name",
                path
            )));
        }
        if config.outputs.is_empty() {
            return Err(HostError::Config(format!(
                "fixture {} owns no outputs",
                config.name
            )));
        }
        for reserved in [PROGRAM_OFF, PROGRAM_ON, PROGRAM_MANUAL, PROGRAM_EXTERNAL] {
            if config.programs.iter().any(|p| p.name == reserved) {
                return Err(HostError::Config(format!(
                    "fixture {} declares a program with the reserved name {}",
                    config.name, reserved
                )));
            }
        }

        Ok(config)
    }

    /// The catalog this fixture will expose, in cycle order.
    pub fn catalog(&self) -> Vec<String> {
        let mut catalog = Vec::new();
        if !self.disable_builtin_programs {
            catalog.push(PROGRAM_OFF.to_string());
            catalog.push(PROGRAM_ON.to_string());
        }
        catalog.push(PROGRAM_EXTERNAL.to_string());
        if !self.disable_manual_program {
            catalog.push(PROGRAM_MANUAL.to_string());
        }
        catalog.extend(self.programs.iter().map(|p| p.name.clone()));
        catalog
    }
}

/// Runtime state of one fixture.
#[derive(Debug)]
pub(crate) struct FixtureState {
    pub name: String,
    pub outputs: BTreeSet<Address>,
    /// Owned outputs as (alias, address), ordered by address.
    pub output_aliases: Vec<(String, Address)>,
    /// Program names in cycle order.
    pub catalog: Vec<String>,
    pub active_index: usize,
}

impl FixtureState {
    /// Engine-unique key of a program in this fixture.
    pub fn program_key(&self, program: &str) -> String {
        format!("{}/{}", self.name, program)
    }

    /// Name of the currently active program.
    pub fn active_program(&self) -> &str {
        &self.catalog[self.active_index]
    }

    /// Catalog index of a program name.
    pub fn index_of(&self, program: &str) -> Option<usize> {
        self.catalog.iter().position(|name| name == program)
    }

    /// Index of the next program in cycle order, skipping MANUAL and
    /// EXTERNAL. Errors when the catalog has nothing cyclable.
    pub fn cycle_target(&self) -> Result<usize> {
        let cyclable = |name: &str| name != PROGRAM_MANUAL && name != PROGRAM_EXTERNAL;
        if !self.catalog.iter().any(|name| cyclable(name)) {
            return Err(HostError::Config(format!(
                "fixture {} has no cyclable programs",
                self.name
            )));
        }
        let mut index = (self.active_index + 1) % self.catalog.len();
        while !cyclable(&self.catalog[index]) {
            index = (index + 1) % self.catalog.len();
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(catalog: &[&str]) -> FixtureState {
        FixtureState {
            name: "f".to_string(),
            outputs: BTreeSet::new(),
            output_aliases: Vec::new(),
            catalog: catalog.iter().map(|s| s.to_string()).collect(),
            active_index: 0,
        }
    }

    #[test]
    fn test_cycle_skips_manual_and_external() {
        let mut fixture = state(&["OFF", "ON", "EXTERNAL", "MANUAL", "wave"]);
        let mut seen = Vec::new();
        for _ in 0..4 {
            fixture.active_index = fixture.cycle_target().unwrap();
            seen.push(fixture.active_program().to_string());
        }
        assert_eq!(seen, vec!["ON", "wave", "OFF", "ON"]);
    }

    #[test]
    fn test_cycle_with_nothing_cyclable_errors() {
        let fixture = state(&["EXTERNAL", "MANUAL"]);
        assert!(fixture.cycle_target().is_err());
    }

    #[test]
    fn test_catalog_order_and_flags() {
        let config = FixtureConfig {
            name: "f".to_string(),
            outputs: vec!["a".to_string()],
            programs: vec![ProgramEntry {
                name: "wave".to_string(),
                path: PathBuf::from("wave.rhai"),
            }],
            disable_builtin_programs: false,
            disable_manual_program: false,
        };
        assert_eq!(config.catalog(), vec!["OFF", "ON", "EXTERNAL", "MANUAL", "wave"]);

        let config = FixtureConfig {
            disable_builtin_programs: true,
            disable_manual_program: true,
            ..config
        };
        assert_eq!(config.catalog(), vec!["EXTERNAL", "wave"]);
    }
}
