use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use gridval_core::types::{Value, ValueSpec};

/// Published values of one calculation configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalcConfigResult {
    pub values: BTreeMap<ValueSpec, Value>,
    pub executed_nodes: usize,
    pub failed_nodes: usize,
}

/// Outward-facing snapshot of a finished cycle.
#[derive(Debug, Clone)]
pub struct ViewComputationResult {
    pub view_name: String,
    pub cycle_id: String,
    pub valuation_time: DateTime<Utc>,
    pub calc_results: BTreeMap<String, CalcConfigResult>,
    /// Live data requirements the snapshot could not satisfy.
    pub missing_live_data: BTreeSet<ValueSpec>,
    pub duration_ms: u64,
}

impl ViewComputationResult {
    pub fn value(&self, calc_config: &str, spec: &ValueSpec) -> Option<&Value> {
        self.calc_results.get(calc_config)?.values.get(spec)
    }

    pub fn executed_nodes(&self) -> usize {
        self.calc_results.values().map(|r| r.executed_nodes).sum()
    }

    pub fn failed_nodes(&self) -> usize {
        self.calc_results.values().map(|r| r.failed_nodes).sum()
    }
}
