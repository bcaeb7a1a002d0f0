use std::fmt;

use serde::{Deserialize, Serialize};

/// A computed or live value. Functions are opaque to the engine, so values are
/// carried as JSON.
pub type Value = serde_json::Value;

/// Kind of object a computation is performed against.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A bare market data point or other identifier with no structure.
    Primitive,
    Security,
    Position,
    Portfolio,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Primitive => "primitive",
            Self::Security => "security",
            Self::Position => "position",
            Self::Portfolio => "portfolio",
        };
        f.write_str(s)
    }
}

/// The object a node's function is invoked against.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ComputationTarget {
    pub kind: TargetKind,
    pub id: String,
}

impl ComputationTarget {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn primitive(id: impl Into<String>) -> Self {
        Self::new(TargetKind::Primitive, id)
    }
}

impl fmt::Display for ComputationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Names one value: what it is (`name`) and what it was computed for.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueSpec {
    pub name: String,
    pub target: ComputationTarget,
}

impl ValueSpec {
    pub fn new(name: impl Into<String>, target: ComputationTarget) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }
}

impl fmt::Display for ValueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.target)
    }
}

/// Stable identifier of a node within a dependency graph and every subgraph
/// derived from it.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Figures reported when a graph execution completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphExecutionStatistics {
    pub calc_config: String,
    /// Nodes submitted for execution.
    pub node_count: usize,
    /// Jobs dispatched for the graph.
    pub job_count: usize,
    /// Nodes whose invocation failed.
    pub failed_nodes: usize,
    /// Execution time reported by workers, summed over jobs.
    pub execution_time_nanos: u64,
    /// Wall-clock time from submission to completion.
    pub wall_time_ms: u64,
    /// Highest number of jobs in flight at once.
    pub max_concurrency: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_spec_display() {
        let spec = ValueSpec::new("PresentValue", ComputationTarget::new(TargetKind::Position, "swap-1"));
        assert_eq!(spec.to_string(), "PresentValue[position:swap-1]");
    }

    #[test]
    fn test_target_kind_serde() {
        let json = serde_json::to_string(&TargetKind::Portfolio).unwrap();
        assert_eq!(json, "\"portfolio\"");
        let parsed: TargetKind = serde_json::from_str("\"security\"").unwrap();
        assert_eq!(parsed, TargetKind::Security);
    }
}
