use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use gridval_core::config::ExecutorStrategy;
use gridval_core::error::{GridError, Result};
use gridval_core::event::EventBus;
use gridval_core::graph::DependencyGraph;
use gridval_core::traits::JobDispatcher;
use gridval_core::types::GraphExecutionStatistics;

use crate::context::MultipleNodeExecutor;
use crate::listener::LoggingListener;
use crate::params::PartitionParameters;
use crate::registry::JobInspectionRegistry;
use crate::simple::{AtomicExecutor, SingleNodeExecutor};
use crate::status::NodeStatusTracker;

/// One graph to execute for one calculation configuration of a cycle.
#[derive(Clone)]
pub struct GraphExecutionRequest {
    pub view_name: String,
    /// Valuation time in epoch milliseconds.
    pub valuation_time: i64,
    pub graph: Arc<DependencyGraph>,
    /// Executed/failed sets the execution writes into.
    pub status: Arc<NodeStatusTracker>,
}

/// Runs a dependency graph to completion on the dispatcher.
pub trait DependencyGraphExecutor: Send + Sync {
    fn execute(&self, request: GraphExecutionRequest) -> GraphExecution;
}

/// Stops an execution that is still running.
pub trait ExecutionCanceller: Send + Sync {
    fn cancel(&self);
}

struct NoopCanceller;

impl ExecutionCanceller for NoopCanceller {
    fn cancel(&self) {}
}

/// Handle to an execution in flight. Resolves to the execution statistics,
/// or to the error that stopped it.
pub struct GraphExecution {
    rx: oneshot::Receiver<Result<GraphExecutionStatistics>>,
    canceller: Arc<dyn ExecutionCanceller>,
}

impl GraphExecution {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<GraphExecutionStatistics>>,
        canceller: Arc<dyn ExecutionCanceller>,
    ) -> Self {
        Self { rx, canceller }
    }

    /// An execution that has already finished.
    pub fn ready(result: Result<GraphExecutionStatistics>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx, Arc::new(NoopCanceller))
    }

    /// Cancel outstanding jobs; the execution resolves to `Cancelled`.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }
}

impl Future for GraphExecution {
    type Output = Result<GraphExecutionStatistics>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without an answer.
            Poll::Ready(Err(_)) => Poll::Ready(Err(GridError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Single-use completion channel. The first result wins.
pub(crate) struct Completion {
    tx: Mutex<Option<oneshot::Sender<Result<GraphExecutionStatistics>>>>,
}

impl Completion {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<GraphExecutionStatistics>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Mutex::new(Some(tx)) }, rx)
    }

    /// Returns false when the execution had already completed.
    pub(crate) fn complete(&self, result: Result<GraphExecutionStatistics>) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// Collaborators shared by every executor strategy.
#[derive(Clone)]
pub struct ExecutorServices {
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub params: Arc<PartitionParameters>,
    pub event_bus: Arc<EventBus>,
    pub registry: Option<Arc<JobInspectionRegistry>>,
}

/// Create the executor for a configured strategy.
pub fn build_executor(
    strategy: ExecutorStrategy,
    services: ExecutorServices,
) -> Arc<dyn DependencyGraphExecutor> {
    match strategy {
        ExecutorStrategy::MultipleNode => Arc::new(MultipleNodeExecutor::new(services)),
        ExecutorStrategy::SingleNode => {
            Arc::new(SingleNodeExecutor::new(services).with_listener(Arc::new(LoggingListener)))
        }
        ExecutorStrategy::Atomic => Arc::new(AtomicExecutor::new(services)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_execution_resolves() {
        let stats = GraphExecutionStatistics {
            calc_config: "default".into(),
            ..Default::default()
        };
        let result = GraphExecution::ready(Ok(stats.clone())).await.unwrap();
        assert_eq!(result, stats);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_cancelled() {
        let (completion, rx) = Completion::new();
        drop(completion);
        let exec = GraphExecution::new(rx, Arc::new(NoopCanceller));
        assert!(matches!(exec.await, Err(GridError::Cancelled)));
    }

    #[test]
    fn test_completion_first_result_wins() {
        let (completion, mut rx) = Completion::new();
        assert!(!completion.is_complete());
        assert!(completion.complete(Err(GridError::Cancelled)));
        assert!(!completion.complete(Ok(GraphExecutionStatistics::default())));
        assert!(completion.is_complete());
        assert!(matches!(rx.try_recv(), Ok(Err(GridError::Cancelled))));
    }
}
