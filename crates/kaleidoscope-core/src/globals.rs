//! Cross-program global store with per-tick delta reconciliation
//!
//! Programs write globals into a local delta during their tick; the scheduler
//! harvests every program's delta, merges them into the authoritative map at
//! the start of the next tick, and redistributes the merged map as every
//! program's read view. A write made in tick N is therefore visible in tick
//! N+1, never in tick N. When several programs write the same key in one
//! tick the merge applies them in scheduler program order: last-reconciled
//! wins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A global scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GlobalValue {
    /// Absent/unset.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Integer(i64),
    /// A floating point number.
    Real(f64),
    /// A string.
    Text(String),
}

impl GlobalValue {
    fn type_name(&self) -> &'static str {
        match self {
            GlobalValue::Null => "null",
            GlobalValue::Bool(_) => "bool",
            GlobalValue::Integer(_) => "integer",
            GlobalValue::Real(_) => "real",
            GlobalValue::Text(_) => "text",
        }
    }
}

/// The authoritative global map.
#[derive(Debug, Default)]
pub struct GlobalStore {
    values: HashMap<String, GlobalValue>,
}

impl GlobalStore {
    /// Create an empty store.
    pub fn new() -> GlobalStore {
        GlobalStore::default()
    }

    /// Merge harvested deltas, in the order given, into the authoritative map.
    ///
    /// The iteration order of `deltas` is the conflict resolution order;
    /// callers pass programs in their deterministic scheduler order.
    /// Type-changing overwrites are permitted but logged.
    pub fn reconcile<I>(&mut self, deltas: I)
    where
        I: IntoIterator<Item = (String, Vec<(String, GlobalValue)>)>,
    {
        for (program, delta) in deltas {
            for (key, value) in delta {
                if let Some(previous) = self.values.get(&key) {
                    if previous.type_name() != value.type_name() {
                        debug!(
                            "global {} changes type {} -> {} (written by {})",
                            key,
                            previous.type_name(),
                            value.type_name(),
                            program
                        );
                    }
                }
                self.values.insert(key, value);
            }
        }
    }

    /// The full current map, cloned as a program read view.
    pub fn view(&self) -> HashMap<String, GlobalValue> {
        self.values.clone()
    }

    /// Read a single global.
    pub fn get(&self, key: &str) -> Option<&GlobalValue> {
        self.values.get(key)
    }

    /// Number of keys in the map.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_merges_in_order() {
        let mut store = GlobalStore::new();
        store.reconcile(vec![
            (
                "high".to_string(),
                vec![("k".to_string(), GlobalValue::Integer(1))],
            ),
            (
                "low".to_string(),
                vec![("k".to_string(), GlobalValue::Integer(2))],
            ),
        ]);

        // Last-reconciled wins.
        assert_eq!(store.get("k"), Some(&GlobalValue::Integer(2)));
    }

    #[test]
    fn test_type_changing_overwrite_is_permitted() {
        let mut store = GlobalStore::new();
        store.reconcile(vec![(
            "p".to_string(),
            vec![("k".to_string(), GlobalValue::Integer(7))],
        )]);
        store.reconcile(vec![(
            "p".to_string(),
            vec![("k".to_string(), GlobalValue::Text("seven".to_string()))],
        )]);

        assert_eq!(store.get("k"), Some(&GlobalValue::Text("seven".to_string())));
    }

    #[test]
    fn test_view_is_a_snapshot() {
        let mut store = GlobalStore::new();
        store.reconcile(vec![(
            "p".to_string(),
            vec![("k".to_string(), GlobalValue::Bool(true))],
        )]);

        let view = store.view();
        store.reconcile(vec![(
            "p".to_string(),
            vec![("k".to_string(), GlobalValue::Bool(false))],
        )]);

        assert_eq!(view.get("k"), Some(&GlobalValue::Bool(true)));
        assert_eq!(store.get("k"), Some(&GlobalValue::Bool(false)));
    }
}
