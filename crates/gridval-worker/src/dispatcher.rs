use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use gridval_core::config::DispatcherConfig;
use gridval_core::error::{GridError, Result};
use gridval_core::job::{Job, JobIdSource};
use gridval_core::traits::{JobDispatcher, JobResultReceiver, WorkerCapacity};

use crate::invoker::JobInvoker;

/// In-process worker pool.
///
/// Each dispatched job waits for a slot, then runs on the blocking pool.
/// Cancelling a job before it gets a slot drops it without an answer; once
/// running it always completes and reports.
pub struct LocalDispatcher {
    invoker: Arc<JobInvoker>,
    slots: Arc<Semaphore>,
    job_ids: Arc<JobIdSource>,
    workers: Vec<WorkerCapacity>,
    runtime: Handle,
}

impl LocalDispatcher {
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &DispatcherConfig, invoker: JobInvoker) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| GridError::Dispatch(format!("local workers need a Tokio runtime: {}", e)))?;
        let workers: Vec<WorkerCapacity> = (0..config.workers.max(1))
            .map(|i| WorkerCapacity {
                name: format!("{}-{}", config.node_name, i),
                nodes_per_worker: config.nodes_per_worker.max(1),
            })
            .collect();
        let slots = workers.iter().map(|w| w.nodes_per_worker).sum();
        info!(workers = workers.len(), slots, node = %config.node_name, "Local workers started");

        Ok(Self {
            invoker: Arc::new(invoker),
            slots: Arc::new(Semaphore::new(slots)),
            job_ids: Arc::new(JobIdSource::new()),
            workers,
            runtime,
        })
    }

    /// Slots not currently running a job.
    pub fn idle_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

impl JobDispatcher for LocalDispatcher {
    fn dispatch(&self, job: Job, receiver: Arc<dyn JobResultReceiver>) -> Result<CancellationToken> {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let slots = Arc::clone(&self.slots);
        let invoker = Arc::clone(&self.invoker);

        self.runtime.spawn(async move {
            let permit = tokio::select! {
                permit = slots.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        receiver.on_failure(job.spec, GridError::Dispatch("worker pool closed".into()));
                        return;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!(job = %job.spec, "Job cancelled before start");
                    return;
                }
            };

            let spec = job.spec.clone();
            let outcome = tokio::task::spawn_blocking(move || invoker.invoke(&job)).await;
            drop(permit);
            match outcome {
                Ok(result) => receiver.on_result(result),
                Err(e) => {
                    error!(job = %spec, error = %e, "Worker task failed");
                    receiver.on_failure(spec, GridError::Dispatch(format!("worker task failed: {}", e)));
                }
            }
        });
        Ok(token)
    }

    fn job_ids(&self) -> Arc<JobIdSource> {
        Arc::clone(&self.job_ids)
    }

    fn capacity(&self) -> Vec<WorkerCapacity> {
        self.workers.clone()
    }
}
