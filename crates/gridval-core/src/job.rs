//! Wire types exchanged with calculation workers.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::{ComputationTarget, ValueSpec};

/// Identifies one dispatched job.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobSpecification {
    pub view_name: String,
    pub calc_config: String,
    /// Valuation time in epoch milliseconds.
    pub valuation_time: i64,
    pub job_id: u64,
}

impl fmt::Display for JobSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} ({}/{} @ {})",
            self.job_id, self.view_name, self.calc_config, self.valuation_time
        )
    }
}

/// Monotonic job identifier source, owned by a dispatcher and shared with the
/// executors that submit to it.
#[derive(Debug)]
pub struct JobIdSource {
    next: AtomicU64,
}

impl JobIdSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for JobIdSource {
    fn default() -> Self {
        Self::new()
    }
}

/// One function invocation inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItem {
    pub function: String,
    pub target: ComputationTarget,
    pub inputs: Vec<ValueSpec>,
    pub outputs: Vec<ValueSpec>,
}

/// Which values a job produces are visible only inside that job.
///
/// Both encodings describe the same partition; the one with the shorter list
/// is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum CacheHint {
    /// Everything is private except the listed values.
    SharedValues(BTreeSet<ValueSpec>),
    /// Everything is shared except the listed values.
    PrivateValues(BTreeSet<ValueSpec>),
}

impl CacheHint {
    /// Pick the cheaper encoding for a classification.
    pub fn choose(shared: BTreeSet<ValueSpec>, private: BTreeSet<ValueSpec>) -> Self {
        if private.len() > shared.len() {
            Self::SharedValues(shared)
        } else {
            Self::PrivateValues(private)
        }
    }

    /// Everything shared; used when there is nothing private to keep.
    pub fn all_shared() -> Self {
        Self::PrivateValues(BTreeSet::new())
    }

    pub fn is_private(&self, spec: &ValueSpec) -> bool {
        match self {
            Self::SharedValues(shared) => !shared.contains(spec),
            Self::PrivateValues(private) => private.contains(spec),
        }
    }

    /// Number of value specs carried on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::SharedValues(v) | Self::PrivateValues(v) => v.len(),
        }
    }
}

/// A unit of work sent to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub spec: JobSpecification,
    pub items: Vec<JobItem>,
    pub cache_hint: CacheHint,
}

/// Outcome of one job item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success,
    MissingInputs { missing: Vec<ValueSpec> },
    FunctionFailed { message: String },
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of one job item, in the same position as the item it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultItem {
    pub outcome: InvocationOutcome,
    pub duration_nanos: u64,
}

impl JobResultItem {
    pub fn success(duration_nanos: u64) -> Self {
        Self {
            outcome: InvocationOutcome::Success,
            duration_nanos,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: InvocationOutcome::FunctionFailed {
                message: message.into(),
            },
            duration_nanos: 0,
        }
    }
}

/// A worker's answer to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub spec: JobSpecification,
    pub items: Vec<JobResultItem>,
    /// Time the worker spent executing the job.
    pub duration_nanos: u64,
    /// Name of the worker that ran the job.
    pub compute_node: String,
}

impl JobResult {
    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|i| i.outcome.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetKind;

    fn specs(names: &[&str]) -> BTreeSet<ValueSpec> {
        names
            .iter()
            .map(|n| ValueSpec::new(*n, ComputationTarget::new(TargetKind::Primitive, "x")))
            .collect()
    }

    #[test]
    fn test_hint_sends_shorter_list() {
        let hint = CacheHint::choose(specs(&["a"]), specs(&["b", "c", "d"]));
        assert!(matches!(hint, CacheHint::SharedValues(ref v) if v.len() == 1));

        let hint = CacheHint::choose(specs(&["a", "b"]), specs(&["c"]));
        assert!(matches!(hint, CacheHint::PrivateValues(ref v) if v.len() == 1));
    }

    #[test]
    fn test_hint_encodings_agree() {
        let shared = specs(&["a"]);
        let private = specs(&["b", "c"]);
        let one = CacheHint::SharedValues(shared.clone());
        let other = CacheHint::PrivateValues(private.clone());
        for spec in shared.iter().chain(private.iter()) {
            assert_eq!(one.is_private(spec), other.is_private(spec));
        }
    }

    #[test]
    fn test_job_ids_increase() {
        let ids = JobIdSource::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
    }
}
