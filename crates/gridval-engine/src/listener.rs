use tracing::{debug, warn};

use gridval_core::graph::DependencyGraph;
use gridval_core::job::{JobResult, JobSpecification};

/// Observes whole-graph jobs sent by the single-node executor.
pub trait ExecutionListener: Send + Sync {
    fn pre_execute(&self, _spec: &JobSpecification, _graph: &DependencyGraph) {}

    fn post_execute(&self, _result: &JobResult, _graph: &DependencyGraph) {}
}

/// Logs each job and its failed items.
pub struct LoggingListener;

impl ExecutionListener for LoggingListener {
    fn pre_execute(&self, spec: &JobSpecification, graph: &DependencyGraph) {
        debug!(
            job_id = spec.job_id,
            calc_config = %spec.calc_config,
            nodes = graph.size(),
            "Dispatching whole-graph job"
        );
    }

    fn post_execute(&self, result: &JobResult, graph: &DependencyGraph) {
        let failed = result.items.iter().filter(|i| !i.outcome.is_success()).count();
        if failed > 0 {
            warn!(
                job_id = result.spec.job_id,
                failed,
                nodes = graph.size(),
                compute_node = %result.compute_node,
                "Whole-graph job finished with failed items"
            );
        } else {
            debug!(
                job_id = result.spec.job_id,
                duration_ms = result.duration_nanos / 1_000_000,
                "Whole-graph job finished"
            );
        }
    }
}
