use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{GridError, Result};
use crate::job::{Job, JobIdSource, JobResult, JobSpecification};
use crate::types::{Value, ValueSpec};

/// Receives the answer to a dispatched job. Exactly one of the two methods is
/// called per job, on a dispatcher-owned thread.
pub trait JobResultReceiver: Send + Sync + 'static {
    /// The worker ran the job; individual items may still have failed.
    fn on_result(&self, result: JobResult);

    /// The job could not be completed at all.
    fn on_failure(&self, spec: JobSpecification, error: GridError);
}

/// Capacity advertised by one live worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCapacity {
    pub name: String,
    /// Jobs the worker will run concurrently.
    pub nodes_per_worker: usize,
}

/// Job transport. Carries jobs to workers and results back.
pub trait JobDispatcher: Send + Sync + 'static {
    /// Send a job. The returned token cancels it on a best-effort basis.
    fn dispatch(&self, job: Job, receiver: Arc<dyn JobResultReceiver>) -> Result<CancellationToken>;

    /// Identifier source for jobs submitted through this dispatcher.
    fn job_ids(&self) -> Arc<JobIdSource>;

    /// Workers currently able to accept jobs.
    fn capacity(&self) -> Vec<WorkerCapacity>;
}

/// Value cache for one (view, calculation configuration, valuation time).
/// Values are written once per spec during a cycle.
pub trait ComputationCache: Send + Sync + 'static {
    fn get(&self, spec: &ValueSpec) -> Option<Value>;

    fn put(&self, spec: ValueSpec, value: Value);

    fn contains(&self, spec: &ValueSpec) -> bool {
        self.get(spec).is_some()
    }
}

/// Hands out and releases computation caches.
pub trait ComputationCacheSource: Send + Sync + 'static {
    fn cache(&self, view_name: &str, calc_config: &str, valuation_time: i64) -> Arc<dyn ComputationCache>;

    fn release(&self, view_name: &str, valuation_time: i64);
}

/// Live market data, snapshotted per valuation time.
pub trait LiveDataProvider: Send + Sync + 'static {
    /// Take (or retain) a consistent snapshot for `valuation_time`.
    fn snapshot(&self, valuation_time: i64);

    fn query(&self, valuation_time: i64, requirement: &ValueSpec) -> Option<Value>;

    /// Release the snapshot taken for `valuation_time`.
    fn release(&self, valuation_time: i64);
}
