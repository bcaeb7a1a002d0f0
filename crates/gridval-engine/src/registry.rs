use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use gridval_core::graph::DependencyGraph;
use gridval_core::job::JobSpecification;
use gridval_core::types::NodeId;

/// A dispatched job that has not answered yet.
#[derive(Debug, Clone)]
pub struct InspectedJob {
    pub spec: JobSpecification,
    /// Graph the job was cut from.
    pub graph: Arc<DependencyGraph>,
    pub nodes: Vec<NodeId>,
    pub dispatched_at: Instant,
}

/// Outstanding jobs by identifier, for diagnosing stuck executions.
#[derive(Debug, Default)]
pub struct JobInspectionRegistry {
    jobs: Mutex<HashMap<u64, InspectedJob>>,
}

impl JobInspectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: JobSpecification, graph: Arc<DependencyGraph>, nodes: Vec<NodeId>) {
        let job = InspectedJob {
            spec,
            graph,
            nodes,
            dispatched_at: Instant::now(),
        };
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.spec.job_id, job);
    }

    /// Forget a job once it has answered, one way or the other.
    pub fn complete(&self, job_id: u64) -> Option<InspectedJob> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).remove(&job_id)
    }

    pub fn lookup(&self, job_id: u64) -> Option<InspectedJob> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
    }

    /// Outstanding jobs, oldest first.
    pub fn outstanding(&self) -> Vec<InspectedJob> {
        let mut jobs: Vec<InspectedJob> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.dispatched_at, j.spec.job_id));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(job_id: u64) -> JobSpecification {
        JobSpecification {
            view_name: "rates".into(),
            calc_config: "default".into(),
            valuation_time: 1_700_000_000_000,
            job_id,
        }
    }

    #[test]
    fn test_register_and_complete() {
        let graph = Arc::new(gridval_test_utils::graphs::chain(3));
        let registry = JobInspectionRegistry::new();
        registry.register(spec(1), Arc::clone(&graph), vec![NodeId(0), NodeId(1)]);
        registry.register(spec(2), Arc::clone(&graph), vec![NodeId(2)]);
        assert_eq!(registry.outstanding().len(), 2);
        let inspected = registry.lookup(1).unwrap();
        assert_eq!(inspected.nodes, vec![NodeId(0), NodeId(1)]);
        assert_eq!(inspected.graph.size(), 3);

        let done = registry.complete(1).unwrap();
        assert_eq!(done.spec.job_id, 1);
        assert!(registry.lookup(1).is_none());
        assert_eq!(registry.outstanding()[0].spec.job_id, 2);
        assert!(registry.complete(1).is_none());
    }
}
