//! Executors that send the whole graph as a single job.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use gridval_core::error::GridError;
use gridval_core::event::{EngineEvent, EventBus};
use gridval_core::job::{Job, JobItem, JobResult, JobSpecification};
use gridval_core::traits::JobResultReceiver;
use gridval_core::types::{GraphExecutionStatistics, NodeId};

use crate::executor::{
    Completion, DependencyGraphExecutor, ExecutionCanceller, ExecutorServices, GraphExecution,
    GraphExecutionRequest,
};
use crate::hint;
use crate::listener::ExecutionListener;
use crate::registry::JobInspectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    /// Any failed item fails every node.
    Atomic,
    /// Each item fails only its own node.
    PerNode,
}

/// All-or-nothing: one job for the whole graph, and any failure marks every
/// node failed.
pub struct AtomicExecutor {
    services: ExecutorServices,
}

impl AtomicExecutor {
    pub fn new(services: ExecutorServices) -> Self {
        Self { services }
    }
}

impl DependencyGraphExecutor for AtomicExecutor {
    fn execute(&self, request: GraphExecutionRequest) -> GraphExecution {
        dispatch_whole_graph(request, &self.services, FailureMode::Atomic, vec![])
    }
}

/// One job for the whole graph, with failures tracked per node and listener
/// hooks around dispatch.
pub struct SingleNodeExecutor {
    services: ExecutorServices,
    listeners: Vec<Arc<dyn ExecutionListener>>,
}

impl SingleNodeExecutor {
    pub fn new(services: ExecutorServices) -> Self {
        Self {
            services,
            listeners: vec![],
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl DependencyGraphExecutor for SingleNodeExecutor {
    fn execute(&self, request: GraphExecutionRequest) -> GraphExecution {
        dispatch_whole_graph(request, &self.services, FailureMode::PerNode, self.listeners.clone())
    }
}

fn dispatch_whole_graph(
    request: GraphExecutionRequest,
    services: &ExecutorServices,
    mode: FailureMode,
    listeners: Vec<Arc<dyn ExecutionListener>>,
) -> GraphExecution {
    let graph = Arc::clone(&request.graph);
    if graph.is_empty() {
        return GraphExecution::ready(Ok(GraphExecutionStatistics {
            calc_config: graph.calc_config().to_string(),
            ..Default::default()
        }));
    }

    let order: Vec<NodeId> = graph.execution_order().to_vec();
    let shared = hint::shared_values(&graph, |_| Some(0));
    let items: Vec<JobItem> = graph
        .nodes()
        .map(|node| JobItem {
            function: node.function.clone(),
            target: node.target.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
        })
        .collect();
    let spec = JobSpecification {
        view_name: request.view_name.clone(),
        calc_config: graph.calc_config().to_string(),
        valuation_time: request.valuation_time,
        job_id: services.dispatcher.job_ids().next_id(),
    };
    let job = Job {
        spec: spec.clone(),
        cache_hint: hint::cache_hint(&graph, &order, &shared),
        items,
    };

    let (completion, rx) = Completion::new();
    let receiver = Arc::new(WholeGraphReceiver {
        request,
        order,
        mode,
        listeners,
        event_bus: Arc::clone(&services.event_bus),
        registry_job: services.registry.clone().map(|r| (r, spec.job_id)),
        tokens: Mutex::new(vec![]),
        started: Instant::now(),
        completion,
    });

    for listener in &receiver.listeners {
        listener.pre_execute(&spec, &graph);
    }
    if let Some(registry) = &services.registry {
        registry.register(spec.clone(), Arc::clone(&graph), receiver.order.clone());
    }
    services.event_bus.publish(EngineEvent::JobDispatched {
        job_id: spec.job_id,
        calc_config: spec.calc_config.clone(),
        items: job.items.len(),
    });

    match services.dispatcher.dispatch(job, Arc::clone(&receiver) as Arc<dyn JobResultReceiver>) {
        Ok(token) => {
            receiver.tokens.lock().unwrap_or_else(|e| e.into_inner()).push(token);
        }
        Err(e) => {
            error!(job_id = spec.job_id, error = %e, "Job dispatch failed");
            receiver.forget_job();
            receiver.completion.complete(Err(e));
        }
    }
    GraphExecution::new(rx, receiver)
}

struct WholeGraphReceiver {
    request: GraphExecutionRequest,
    order: Vec<NodeId>,
    mode: FailureMode,
    listeners: Vec<Arc<dyn ExecutionListener>>,
    event_bus: Arc<EventBus>,
    registry_job: Option<(Arc<JobInspectionRegistry>, u64)>,
    tokens: Mutex<Vec<CancellationToken>>,
    started: Instant,
    completion: Completion,
}

impl WholeGraphReceiver {
    fn forget_job(&self) {
        if let Some((registry, job_id)) = &self.registry_job {
            registry.complete(*job_id);
        }
    }

    fn outcomes(&self, result: &JobResult) -> Vec<(NodeId, bool)> {
        match self.mode {
            FailureMode::Atomic => {
                let failed = result.items.len() != self.order.len() || !result.all_succeeded();
                self.order.iter().map(|n| (*n, failed)).collect()
            }
            FailureMode::PerNode => self
                .order
                .iter()
                .enumerate()
                .map(|(i, n)| (*n, result.items.get(i).map_or(true, |item| !item.outcome.is_success())))
                .collect(),
        }
    }
}

impl JobResultReceiver for WholeGraphReceiver {
    fn on_result(&self, result: JobResult) {
        self.forget_job();
        if result.items.len() != self.order.len() {
            warn!(
                job_id = result.spec.job_id,
                expected = self.order.len(),
                received = result.items.len(),
                "Result item count does not match job; unmatched nodes marked failed"
            );
        }
        let graph = &self.request.graph;
        let outcomes = self.outcomes(&result);
        let failed: HashSet<NodeId> = outcomes.iter().filter(|(_, f)| *f).map(|(n, _)| *n).collect();
        self.request.status.record(graph.calc_config(), outcomes);

        for listener in &self.listeners {
            listener.post_execute(&result, graph);
        }

        let statistics = GraphExecutionStatistics {
            calc_config: graph.calc_config().to_string(),
            node_count: graph.size(),
            job_count: 1,
            failed_nodes: failed.len(),
            execution_time_nanos: result.duration_nanos,
            wall_time_ms: self.started.elapsed().as_millis() as u64,
            max_concurrency: 1,
        };
        if self.completion.complete(Ok(statistics.clone())) {
            self.event_bus.publish(EngineEvent::GraphExecuted { statistics });
        }
    }

    fn on_failure(&self, spec: JobSpecification, error: GridError) {
        self.forget_job();
        error!(job_id = spec.job_id, error = %error, "Remote job failed");
        self.completion.complete(Err(GridError::RemoteExecution {
            job_id: spec.job_id,
            message: error.to_string(),
        }));
    }
}

impl ExecutionCanceller for WholeGraphReceiver {
    fn cancel(&self) {
        let tokens = std::mem::take(&mut *self.tokens.lock().unwrap_or_else(|e| e.into_inner()));
        for token in tokens {
            token.cancel();
        }
        // A job cancelled before it starts never answers.
        self.forget_job();
        self.completion.complete(Err(GridError::Cancelled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gridval_core::graph::DependencyGraph;
    use gridval_core::job::JobResultItem;
    use gridval_test_utils::{graphs, MockDispatcher};

    use crate::params::PartitionParameters;
    use crate::status::NodeStatusTracker;

    fn services(dispatcher: Arc<MockDispatcher>) -> ExecutorServices {
        ExecutorServices {
            dispatcher,
            params: Arc::new(PartitionParameters::from(&gridval_core::config::EngineConfig::default())),
            event_bus: Arc::new(EventBus::default()),
            registry: Some(Arc::new(JobInspectionRegistry::new())),
        }
    }

    fn request(graph: DependencyGraph) -> GraphExecutionRequest {
        GraphExecutionRequest {
            view_name: "rates".into(),
            valuation_time: 1_700_000_000_000,
            graph: Arc::new(graph),
            status: Arc::new(NodeStatusTracker::new()),
        }
    }

    fn fail_item(index: usize) -> impl FnOnce(&Job) -> Vec<JobResultItem> {
        move |job: &Job| {
            (0..job.items.len())
                .map(|i| if i == index { JobResultItem::failed("boom") } else { JobResultItem::success(5) })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_atomic_escalates_single_failure() {
        let graph = graphs::chain(5);
        let order = graph.execution_order().to_vec();
        let dispatcher = Arc::new(MockDispatcher::new());
        let req = request(graph);
        let status = Arc::clone(&req.status);
        let exec = AtomicExecutor::new(services(Arc::clone(&dispatcher))).execute(req);

        let jobs = dispatcher.dispatched_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].items.len(), 5);
        assert!(dispatcher.complete_next_with(fail_item(2)));

        let stats = exec.await.unwrap();
        assert_eq!(stats.failed_nodes, 5);
        for node in order {
            assert!(status.is_executed("default", node));
            assert!(status.is_failed("default", node));
        }
    }

    #[tokio::test]
    async fn test_atomic_success_marks_all_executed() {
        let graph = graphs::chain(4);
        let dispatcher = Arc::new(MockDispatcher::new().auto_complete());
        let req = request(graph);
        let status = Arc::clone(&req.status);
        let stats = AtomicExecutor::new(services(dispatcher)).execute(req).await.unwrap();
        assert_eq!(stats.failed_nodes, 0);
        assert_eq!(status.executed_count("default"), 4);
        assert_eq!(status.failed_count("default"), 0);
    }

    struct CountingListener {
        pre: AtomicUsize,
        post: AtomicUsize,
    }

    impl ExecutionListener for CountingListener {
        fn pre_execute(&self, _spec: &JobSpecification, _graph: &DependencyGraph) {
            self.pre.fetch_add(1, Ordering::SeqCst);
        }

        fn post_execute(&self, _result: &JobResult, _graph: &DependencyGraph) {
            self.post.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_single_node_tracks_failures_per_node() {
        let graph = graphs::chain(5);
        let order = graph.execution_order().to_vec();
        let dispatcher = Arc::new(MockDispatcher::new());
        let listener = Arc::new(CountingListener {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
        });
        let executor = SingleNodeExecutor::new(services(Arc::clone(&dispatcher)))
            .with_listener(Arc::clone(&listener) as Arc<dyn ExecutionListener>);
        let req = request(graph);
        let status = Arc::clone(&req.status);
        let exec = executor.execute(req);
        assert_eq!(listener.pre.load(Ordering::SeqCst), 1);

        assert!(dispatcher.complete_next_with(fail_item(1)));
        let stats = exec.await.unwrap();
        assert_eq!(stats.failed_nodes, 1);
        assert_eq!(listener.post.load(Ordering::SeqCst), 1);
        for (i, node) in order.iter().enumerate() {
            assert!(status.is_executed("default", *node));
            assert_eq!(status.is_failed("default", *node), i == 1);
        }
    }

    #[tokio::test]
    async fn test_whole_graph_hint_shares_only_boundary_values() {
        let graph = graphs::chain(6);
        let dispatcher = Arc::new(MockDispatcher::new().auto_complete());
        SingleNodeExecutor::new(services(Arc::clone(&dispatcher)))
            .execute(request(graph.clone()))
            .await
            .unwrap();
        let job = &dispatcher.dispatched_jobs()[0];
        for item in &job.items {
            for out in &item.outputs {
                assert_eq!(job.cache_hint.is_private(out), !graph.is_terminal_output(out));
            }
        }
    }

    #[tokio::test]
    async fn test_remote_failure_and_empty_graph() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let exec = AtomicExecutor::new(services(Arc::clone(&dispatcher))).execute(request(graphs::chain(3)));
        assert!(dispatcher.fail_next("connection reset"));
        assert!(matches!(exec.await, Err(GridError::RemoteExecution { .. })));

        let stats = SingleNodeExecutor::new(services(Arc::clone(&dispatcher)))
            .execute(request(graphs::chain(0)))
            .await
            .unwrap();
        assert_eq!(stats.job_count, 0);
        assert_eq!(dispatcher.dispatched_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_forgets_whole_graph_job() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let svc = services(Arc::clone(&dispatcher));
        let registry = svc.registry.clone().unwrap();
        let exec = SingleNodeExecutor::new(svc).execute(request(graphs::chain(3)));
        assert_eq!(registry.outstanding().len(), 1);

        exec.cancel();
        assert!(registry.outstanding().is_empty());
        assert!(matches!(exec.await, Err(GridError::Cancelled)));
    }
}
