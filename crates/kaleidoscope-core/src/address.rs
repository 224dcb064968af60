//! Address space: alias and group resolution plus the input snapshot

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{Address, CoreError, Result, Value};

/// One alias declaration in the universe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasEntry {
    /// Human-readable channel name used by scripts and the control plane.
    pub alias: String,
    /// The channel address the alias resolves to.
    pub address: Address,
}

/// The universe: every input and output channel Kaleidoscope knows about.
///
/// Groups are ordered lists of *output* aliases under a single name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Input channels.
    #[serde(default)]
    pub inputs: Vec<AliasEntry>,
    /// Output channels.
    #[serde(default)]
    pub outputs: Vec<AliasEntry>,
    /// Named, ordered groups of output aliases.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

/// Authoritative map of the channel universe.
///
/// Resolution failures during program setup are fatal for that program; at
/// runtime an unknown address is a typed error, never a silent default.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    // Output aliases are readable too, so they are merged into this table.
    input_aliases: HashMap<String, Address>,
    output_aliases: HashMap<String, Address>,
    groups: HashMap<String, Vec<Address>>,
    // Last-known input values; None until the first update arrives.
    inputs: HashMap<Address, Option<Value>>,
}

impl AddressSpace {
    /// Build an address space from the universe configuration.
    ///
    /// Rejects duplicate aliases, duplicate addresses within a direction,
    /// and groups referring to unknown output aliases.
    pub fn from_config(config: &UniverseConfig) -> Result<AddressSpace> {
        let mut input_aliases = HashMap::new();
        let mut output_aliases = HashMap::new();
        let mut seen_input_addresses = HashSet::new();
        let mut seen_output_addresses = HashSet::new();

        for entry in &config.inputs {
            if input_aliases.insert(entry.alias.clone(), entry.address).is_some() {
                return Err(CoreError::InvalidUniverse(format!(
                    "duplicate input alias: {}",
                    entry.alias
                )));
            }
            if !seen_input_addresses.insert(entry.address) {
                return Err(CoreError::InvalidUniverse(format!(
                    "duplicate input address: {}",
                    entry.address
                )));
            }
        }

        for entry in &config.outputs {
            if output_aliases.insert(entry.alias.clone(), entry.address).is_some() {
                return Err(CoreError::InvalidUniverse(format!(
                    "duplicate output alias: {}",
                    entry.alias
                )));
            }
            if !seen_output_addresses.insert(entry.address) {
                return Err(CoreError::InvalidUniverse(format!(
                    "duplicate output address: {}",
                    entry.address
                )));
            }
            // Outputs are readable by alias as well.
            if input_aliases.insert(entry.alias.clone(), entry.address).is_some() {
                return Err(CoreError::InvalidUniverse(format!(
                    "alias used for both an input and an output: {}",
                    entry.alias
                )));
            }
        }

        let mut groups = HashMap::new();
        for (name, aliases) in &config.groups {
            let mut addresses = Vec::with_capacity(aliases.len());
            for alias in aliases {
                let address = output_aliases
                    .get(alias)
                    .copied()
                    .ok_or_else(|| CoreError::UnknownOutputAlias(alias.clone()))?;
                addresses.push(address);
            }
            if addresses.is_empty() {
                return Err(CoreError::InvalidUniverse(format!("empty group: {}", name)));
            }
            groups.insert(name.clone(), addresses);
        }

        let inputs = input_aliases.values().map(|addr| (*addr, None)).collect();

        Ok(AddressSpace {
            input_aliases,
            output_aliases,
            groups,
            inputs,
        })
    }

    /// Resolve an input (or readable output) alias to its address.
    pub fn resolve_input(&self, alias: &str) -> Result<Address> {
        self.input_aliases
            .get(alias)
            .copied()
            .ok_or_else(|| CoreError::UnknownInputAlias(alias.to_string()))
    }

    /// Resolve an output alias to its address.
    pub fn resolve_output(&self, alias: &str) -> Result<Address> {
        self.output_aliases
            .get(alias)
            .copied()
            .ok_or_else(|| CoreError::UnknownOutputAlias(alias.to_string()))
    }

    /// Resolve a group name to its ordered address list.
    pub fn resolve_group(&self, name: &str) -> Result<&[Address]> {
        self.groups
            .get(name)
            .map(|addrs| addrs.as_slice())
            .ok_or_else(|| CoreError::UnknownGroup(name.to_string()))
    }

    /// Last-known value of an input channel; `None` before the first update.
    pub fn current_input(&self, address: Address) -> Result<Option<Value>> {
        self.inputs
            .get(&address)
            .copied()
            .ok_or(CoreError::UnknownAddress(address))
    }

    /// Record a new input value from an update event.
    pub fn apply_update(&mut self, address: Address, value: Value) -> Result<()> {
        match self.inputs.get_mut(&address) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(CoreError::UnknownAddress(address)),
        }
    }

    /// Whether the address belongs to a known input channel.
    pub fn has_input(&self, address: Address) -> bool {
        self.inputs.contains_key(&address)
    }

    /// Snapshot the current values of the given addresses.
    ///
    /// Used to refresh a program's restricted input view once per tick.
    pub fn snapshot<'a>(
        &self,
        addresses: impl IntoIterator<Item = &'a Address>,
    ) -> HashMap<Address, Option<Value>> {
        addresses
            .into_iter()
            .filter_map(|addr| self.inputs.get(addr).map(|v| (*addr, *v)))
            .collect()
    }

    /// All configured output aliases with their addresses.
    pub fn output_aliases(&self) -> impl Iterator<Item = (&str, Address)> {
        self.output_aliases.iter().map(|(a, addr)| (a.as_str(), *addr))
    }

    /// All configured group names.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// All configured input aliases (including readable outputs).
    pub fn input_aliases(&self) -> impl Iterator<Item = (&str, Address)> {
        self.input_aliases.iter().map(|(a, addr)| (a.as_str(), *addr))
    }
}
