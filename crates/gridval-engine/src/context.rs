//! The partitioning executor and the per-execution context that drives it.
//!
//! There is no scheduler loop: each job result releases the fragments that
//! were waiting on it, and whichever callback drives a fragment's
//! remaining-inputs counter to zero dispatches that fragment.
//!
//! Large graphs are partitioned on the blocking pool; the execution handle
//! is returned at once and can be cancelled while partitioning runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use gridval_core::error::GridError;
use gridval_core::event::{EngineEvent, EventBus};
use gridval_core::graph::DependencyGraph;
use gridval_core::job::{Job, JobItem, JobResult, JobSpecification};
use gridval_core::traits::{JobDispatcher, JobResultReceiver};
use gridval_core::types::{GraphExecutionStatistics, NodeId, ValueSpec};

use crate::executor::{
    Completion, DependencyGraphExecutor, ExecutionCanceller, ExecutorServices, GraphExecution,
    GraphExecutionRequest,
};
use crate::hint;
use crate::partition::{FragmentPlan, GraphPartitioner};
use crate::registry::JobInspectionRegistry;
use crate::status::NodeStatusTracker;

/// Graphs up to this many nodes are partitioned on the calling thread.
const INLINE_PARTITION_NODES: usize = 2_000;

/// Partitions each graph into fragments and dispatches one job per fragment.
pub struct MultipleNodeExecutor {
    services: ExecutorServices,
}

impl MultipleNodeExecutor {
    pub fn new(services: ExecutorServices) -> Self {
        Self { services }
    }
}

impl DependencyGraphExecutor for MultipleNodeExecutor {
    fn execute(&self, request: GraphExecutionRequest) -> GraphExecution {
        let partitioner = GraphPartitioner::new(self.services.params.snapshot());
        let (completion, rx) = Completion::new();

        let runtime = match Handle::try_current() {
            Ok(runtime) if request.graph.size() > INLINE_PARTITION_NODES => runtime,
            _ => {
                let plan = partitioner.partition(&request.graph);
                let context = FragmentContext::new(request, plan, &self.services, completion);
                context.dispatch_leaves();
                return GraphExecution::new(rx, context);
            }
        };

        let start = Arc::new(DeferredStart {
            stage: Mutex::new(Stage::Partitioning(completion)),
        });
        let launcher = Arc::clone(&start);
        let services = self.services.clone();
        runtime.spawn(async move {
            let graph = Arc::clone(&request.graph);
            let planned = tokio::task::spawn_blocking(move || partitioner.partition(&graph)).await;
            launcher.launch(request, planned, &services);
        });
        GraphExecution::new(rx, start)
    }
}

enum Stage {
    Partitioning(Completion),
    Running(Arc<FragmentContext>),
    Cancelled,
}

/// Execution handle for a graph still being partitioned off the runtime.
struct DeferredStart {
    stage: Mutex<Stage>,
}

impl DeferredStart {
    fn launch(
        &self,
        request: GraphExecutionRequest,
        planned: Result<FragmentPlan, JoinError>,
        services: &ExecutorServices,
    ) {
        let mut stage = self.stage.lock().unwrap_or_else(|e| e.into_inner());
        let completion = match std::mem::replace(&mut *stage, Stage::Cancelled) {
            Stage::Partitioning(completion) => completion,
            // Cancelled while partitioning.
            other => {
                *stage = other;
                return;
            }
        };
        match planned {
            Ok(plan) => {
                let context = FragmentContext::new(request, plan, services, completion);
                *stage = Stage::Running(Arc::clone(&context));
                drop(stage);
                context.dispatch_leaves();
            }
            Err(e) => {
                error!(calc_config = request.graph.calc_config(), error = %e, "Partitioning failed");
                completion.complete(Err(GridError::Dispatch(format!("partitioning failed: {}", e))));
            }
        }
    }
}

impl ExecutionCanceller for DeferredStart {
    fn cancel(&self) {
        let mut stage = self.stage.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *stage, Stage::Cancelled) {
            Stage::Partitioning(completion) => {
                debug!("Cancelled while partitioning");
                completion.complete(Err(GridError::Cancelled));
            }
            Stage::Running(context) => {
                *stage = Stage::Running(Arc::clone(&context));
                drop(stage);
                context.cancel();
            }
            Stage::Cancelled => {}
        }
    }
}

struct ExecFragment {
    nodes: Vec<NodeId>,
    dependents: Vec<usize>,
    remaining: AtomicUsize,
}

/// State of one partitioned graph execution.
pub(crate) struct FragmentContext {
    this: Weak<FragmentContext>,
    request: GraphExecutionRequest,
    dispatcher: Arc<dyn JobDispatcher>,
    event_bus: Arc<EventBus>,
    registry: Option<Arc<JobInspectionRegistry>>,
    fragments: Vec<ExecFragment>,
    root: usize,
    shared: HashSet<ValueSpec>,
    pending: Mutex<HashMap<u64, usize>>,
    tokens: Mutex<Vec<CancellationToken>>,
    cancelled: AtomicBool,
    execution_nanos: AtomicU64,
    job_count: AtomicUsize,
    failed_nodes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Instant,
    completion: Completion,
}

impl FragmentContext {
    fn new(
        request: GraphExecutionRequest,
        plan: FragmentPlan,
        services: &ExecutorServices,
        completion: Completion,
    ) -> Arc<Self> {
        debug!(
            view = %request.view_name,
            calc_config = request.graph.calc_config(),
            nodes = request.graph.size(),
            jobs = plan.job_count(),
            passes = plan.passes(),
            "Executing partitioned graph"
        );
        let fragment_of = plan.fragment_of();
        let shared = hint::shared_values(&request.graph, |n| fragment_of.get(&n).copied());
        let fragments: Vec<ExecFragment> = plan
            .fragments()
            .iter()
            .map(|f| ExecFragment {
                nodes: f.nodes.clone(),
                dependents: f.dependents.clone(),
                remaining: AtomicUsize::new(f.inputs.len()),
            })
            .collect();
        Arc::new_cyclic(|this| FragmentContext {
            this: this.clone(),
            request,
            dispatcher: Arc::clone(&services.dispatcher),
            event_bus: Arc::clone(&services.event_bus),
            registry: services.registry.clone(),
            fragments,
            root: plan.root(),
            shared,
            pending: Mutex::new(HashMap::new()),
            tokens: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            execution_nanos: AtomicU64::new(0),
            job_count: AtomicUsize::new(0),
            failed_nodes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: Instant::now(),
            completion,
        })
    }

    /// Dispatch every fragment with no inputs. For an empty graph that is the
    /// root, which completes the execution.
    fn dispatch_leaves(&self) {
        let leaves: Vec<usize> = self
            .fragments
            .iter()
            .enumerate()
            .filter(|(_, f)| f.remaining.load(Ordering::Acquire) == 0)
            .map(|(i, _)| i)
            .collect();
        for leaf in leaves {
            self.execute_fragment(leaf);
        }
    }

    fn graph(&self) -> &DependencyGraph {
        &self.request.graph
    }

    fn status(&self) -> &NodeStatusTracker {
        &self.request.status
    }

    fn execute_fragment(&self, index: usize) {
        if index == self.root {
            self.finish();
            return;
        }
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let fragment = &self.fragments[index];
        let graph = self.graph();
        let items: Vec<JobItem> = fragment
            .nodes
            .iter()
            .filter_map(|id| graph.node(*id))
            .map(|node| JobItem {
                function: node.function.clone(),
                target: node.target.clone(),
                inputs: node.inputs.clone(),
                outputs: node.outputs.clone(),
            })
            .collect();
        let spec = JobSpecification {
            view_name: self.request.view_name.clone(),
            calc_config: graph.calc_config().to_string(),
            valuation_time: self.request.valuation_time,
            job_id: self.dispatcher.job_ids().next_id(),
        };
        let job = Job {
            spec: spec.clone(),
            items,
            cache_hint: hint::cache_hint(graph, &fragment.nodes, &self.shared),
        };

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec.job_id, index);
        if let Some(registry) = &self.registry {
            registry.register(spec.clone(), Arc::clone(&self.request.graph), fragment.nodes.clone());
        }
        self.job_count.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::AcqRel);
        self.event_bus.publish(EngineEvent::JobDispatched {
            job_id: spec.job_id,
            calc_config: spec.calc_config.clone(),
            items: job.items.len(),
        });

        match self.dispatcher.dispatch(job, this) {
            Ok(token) => {
                self.tokens.lock().unwrap_or_else(|e| e.into_inner()).push(token.clone());
                // Raced with an abort that already drained the tokens.
                if self.cancelled.load(Ordering::Acquire) {
                    token.cancel();
                    self.forget_outstanding();
                }
            }
            Err(e) => {
                error!(job_id = spec.job_id, error = %e, "Job dispatch failed");
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&spec.job_id);
                if let Some(registry) = &self.registry {
                    registry.complete(spec.job_id);
                }
                self.abort(e);
            }
        }
    }

    /// Decrement each dependent's counter; the caller that reaches zero runs it.
    fn release_dependents(&self, index: usize) {
        for dependent in &self.fragments[index].dependents {
            if self.fragments[*dependent].remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.execute_fragment(*dependent);
            }
        }
    }

    fn finish(&self) {
        let statistics = GraphExecutionStatistics {
            calc_config: self.graph().calc_config().to_string(),
            node_count: self.graph().size(),
            job_count: self.job_count.load(Ordering::Relaxed),
            failed_nodes: self.failed_nodes.load(Ordering::Relaxed),
            execution_time_nanos: self.execution_nanos.load(Ordering::Relaxed),
            wall_time_ms: self.started.elapsed().as_millis() as u64,
            max_concurrency: self.max_in_flight.load(Ordering::Relaxed),
        };
        debug!(
            calc_config = %statistics.calc_config,
            jobs = statistics.job_count,
            failed = statistics.failed_nodes,
            wall_time_ms = statistics.wall_time_ms,
            "Graph execution complete"
        );
        if self.completion.complete(Ok(statistics.clone())) {
            self.event_bus.publish(EngineEvent::GraphExecuted { statistics });
        }
    }

    /// Stop dispatching, cancel outstanding jobs and fail the execution.
    fn abort(&self, error: GridError) {
        self.cancelled.store(true, Ordering::Release);
        let tokens = std::mem::take(&mut *self.tokens.lock().unwrap_or_else(|e| e.into_inner()));
        for token in tokens {
            token.cancel();
        }
        self.forget_outstanding();
        self.completion.complete(Err(error));
    }

    /// Drop every unanswered job from the inspection registry. A cancelled
    /// job may never answer. The pending map keeps its entries so a late
    /// answer is still recorded.
    fn forget_outstanding(&self) {
        let Some(registry) = &self.registry else {
            return;
        };
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for job_id in pending.keys() {
            registry.complete(*job_id);
        }
    }

    fn take_pending(&self, job_id: u64) -> Option<usize> {
        let index = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
        if index.is_some() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            if let Some(registry) = &self.registry {
                registry.complete(job_id);
            }
        }
        index
    }
}

impl JobResultReceiver for FragmentContext {
    fn on_result(&self, result: JobResult) {
        let Some(index) = self.take_pending(result.spec.job_id) else {
            warn!(job_id = result.spec.job_id, "Result for unknown job ignored");
            return;
        };
        let nodes = &self.fragments[index].nodes;
        if result.items.len() != nodes.len() {
            warn!(
                job_id = result.spec.job_id,
                expected = nodes.len(),
                received = result.items.len(),
                "Result item count does not match job; unmatched nodes marked failed"
            );
        }

        let outcomes: Vec<(NodeId, bool)> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let failed = result.items.get(i).map_or(true, |item| !item.outcome.is_success());
                (*node, failed)
            })
            .collect();
        let failed = outcomes.iter().filter(|(_, f)| *f).count();
        if failed > 0 {
            debug!(job_id = result.spec.job_id, failed, "Job finished with failed nodes");
        }
        self.status().record(self.graph().calc_config(), outcomes);
        self.failed_nodes.fetch_add(failed, Ordering::Relaxed);
        self.execution_nanos.fetch_add(result.duration_nanos, Ordering::Relaxed);

        // Late results after a cancel are recorded but go no further.
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.release_dependents(index);
    }

    fn on_failure(&self, spec: JobSpecification, error: GridError) {
        if self.take_pending(spec.job_id).is_none() {
            warn!(job_id = spec.job_id, "Failure for unknown job ignored");
            return;
        }
        error!(job_id = spec.job_id, error = %error, "Remote job failed");
        self.abort(GridError::RemoteExecution {
            job_id: spec.job_id,
            message: error.to_string(),
        });
    }
}

impl ExecutionCanceller for FragmentContext {
    fn cancel(&self) {
        if !self.completion.is_complete() {
            debug!(calc_config = self.graph().calc_config(), "Cancelling graph execution");
        }
        self.abort(GridError::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridval_core::event::EventBus;
    use gridval_core::job::JobResultItem;
    use gridval_test_utils::{graphs, MockDispatcher};

    use crate::params::{PartitionLimits, PartitionParameters};

    fn services(dispatcher: Arc<MockDispatcher>, limits: PartitionLimits) -> ExecutorServices {
        ExecutorServices {
            dispatcher,
            params: Arc::new(PartitionParameters::new(limits)),
            event_bus: Arc::new(EventBus::default()),
            registry: Some(Arc::new(JobInspectionRegistry::new())),
        }
    }

    fn diamond_limits() -> PartitionLimits {
        PartitionLimits {
            min_items: 2,
            max_items: 3,
            min_cost: 2,
            max_cost: 3,
            max_concurrency: 1,
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

    #[tokio::test]
    async fn test_diamond_dispatches_in_dependency_order() {
        let (graph, [a, b, c, d]) = graphs::diamond();
        let dispatcher = Arc::new(MockDispatcher::new());
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), diamond_limits()));
        let req = request(graph);
        let status = Arc::clone(&req.status);
        let exec = executor.execute(req);

        // Only {A, B} goes out first.
        let first = dispatcher.dispatched_jobs();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].items.len(), 2);
        assert!(dispatcher.complete_next());

        let jobs = dispatcher.dispatched_jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].items.len(), 2);
        assert!(jobs[1].spec.job_id > jobs[0].spec.job_id);
        // C's output stays inside the second job; A and B's outputs cross over.
        let c_out = &jobs[1].items[0].outputs[0];
        assert!(jobs[1].cache_hint.is_private(c_out));
        for out in &jobs[0].items[0].outputs {
            assert!(!jobs[0].cache_hint.is_private(out));
        }
        assert!(dispatcher.complete_next());

        let stats = exec.await.unwrap();
        assert_eq!(stats.job_count, 2);
        assert_eq!(stats.node_count, 4);
        assert_eq!(stats.failed_nodes, 0);
        assert_eq!(stats.max_concurrency, 1);
        for node in [a, b, c, d] {
            assert!(status.is_executed("default", node));
            assert!(!status.is_failed("default", node));
        }
    }

    #[tokio::test]
    async fn test_failure_is_contained_to_node() {
        let (graph, [a, b, c, d]) = graphs::diamond();
        let dispatcher = Arc::new(MockDispatcher::new());
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), diamond_limits()));
        let req = request(graph);
        let status = Arc::clone(&req.status);
        let exec = executor.execute(req);

        // Fail the second item of the {A, B} job.
        assert!(dispatcher.complete_next_with(|job| {
            job.items
                .iter()
                .enumerate()
                .map(|(i, _)| if i == 1 { JobResultItem::failed("boom") } else { JobResultItem::success(10) })
                .collect()
        }));
        // The downstream job is still dispatched.
        assert_eq!(dispatcher.pending_count(), 1);
        assert!(dispatcher.complete_next());

        let stats = exec.await.unwrap();
        assert_eq!(stats.failed_nodes, 1);
        let failed: Vec<NodeId> = [a, b].into_iter().filter(|n| status.is_failed("default", *n)).collect();
        assert_eq!(failed.len(), 1);
        for node in [a, b, c, d] {
            assert!(status.is_executed("default", node));
        }
        assert!(!status.is_failed("default", c));
        assert!(!status.is_failed("default", d));
    }

    #[tokio::test]
    async fn test_remote_failure_fails_execution() {
        let (graph, _) = graphs::diamond();
        let dispatcher = Arc::new(MockDispatcher::new());
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), diamond_limits()));
        let exec = executor.execute(request(graph));

        assert!(dispatcher.fail_next("worker lost"));
        let err = exec.await.unwrap_err();
        assert!(matches!(err, GridError::RemoteExecution { .. }));
        // Nothing further is dispatched.
        assert_eq!(dispatcher.dispatched_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_further_dispatch() {
        let (graph, _) = graphs::diamond();
        let dispatcher = Arc::new(MockDispatcher::new());
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), diamond_limits()));
        let exec = executor.execute(request(graph));

        exec.cancel();
        // Late result is accepted but releases nothing.
        assert!(dispatcher.complete_next());
        assert_eq!(dispatcher.dispatched_jobs().len(), 1);
        assert!(matches!(exec.await, Err(GridError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_forgets_unanswered_jobs() {
        let (graph, [a, b, _, _]) = graphs::diamond();
        let dispatcher = Arc::new(MockDispatcher::new());
        let svc = services(Arc::clone(&dispatcher), diamond_limits());
        let registry = svc.registry.clone().unwrap();
        let req = request(graph);
        let status = Arc::clone(&req.status);
        let exec = MultipleNodeExecutor::new(svc).execute(req);
        assert_eq!(registry.outstanding().len(), 1);

        exec.cancel();
        assert!(registry.outstanding().is_empty());
        assert!(matches!(exec.await, Err(GridError::Cancelled)));

        // A late answer is still recorded.
        assert!(dispatcher.complete_next());
        assert!(status.is_executed("default", a));
        assert!(status.is_executed("default", b));
        assert!(registry.outstanding().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_forgets_sibling_jobs() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let limits = PartitionLimits {
            min_items: 1,
            max_items: 1,
            min_cost: 1,
            max_cost: 1,
            max_concurrency: 8,
        };
        let svc = services(Arc::clone(&dispatcher), limits);
        let registry = svc.registry.clone().unwrap();
        let exec = MultipleNodeExecutor::new(svc).execute(request(graphs::fan_out(4)));

        // The source releases all four leaves at once.
        assert!(dispatcher.complete_next());
        assert_eq!(registry.outstanding().len(), 4);
        assert!(dispatcher.fail_next("worker lost"));
        assert!(matches!(exec.await, Err(GridError::RemoteExecution { .. })));
        assert!(registry.outstanding().is_empty());
    }

    #[tokio::test]
    async fn test_empty_graph_completes_without_jobs() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), diamond_limits()));
        let stats = executor.execute(request(graphs::chain(0))).await.unwrap();
        assert_eq!(stats.job_count, 0);
        assert!(dispatcher.dispatched_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_auto_complete_runs_layered_graph() {
        let graph = graphs::layered(5, 6, 2);
        let size = graph.size();
        let dispatcher = Arc::new(MockDispatcher::new().auto_complete());
        let limits = PartitionLimits {
            min_items: 2,
            max_items: 6,
            min_cost: 2,
            max_cost: 12,
            max_concurrency: 3,
        };
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), limits));
        let req = request(graph);
        let status = Arc::clone(&req.status);
        let stats = executor.execute(req).await.unwrap();

        assert_eq!(stats.node_count, size);
        assert_eq!(status.executed_count("default"), size);
        assert_eq!(status.failed_count("default"), 0);
        let dispatched: usize = dispatcher.dispatched_jobs().iter().map(|j| j.items.len()).sum();
        assert_eq!(dispatched, size);
    }

    fn wide_limits() -> PartitionLimits {
        PartitionLimits {
            min_items: 16,
            max_items: 200,
            min_cost: 16,
            max_cost: 600,
            max_concurrency: 8,
        }
    }

    #[tokio::test]
    async fn test_large_graph_is_partitioned_off_the_runtime() {
        let graph = graphs::layered(42, 50, 3);
        let size = graph.size();
        assert!(size > INLINE_PARTITION_NODES);
        let dispatcher = Arc::new(MockDispatcher::new().auto_complete());
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), wide_limits()));
        let req = request(graph);
        let status = Arc::clone(&req.status);

        let exec = executor.execute(req);
        // Nothing goes out until the plan is ready.
        assert!(dispatcher.dispatched_jobs().is_empty());
        let stats = exec.await.unwrap();

        assert_eq!(stats.node_count, size);
        assert_eq!(status.executed_count("default"), size);
        let dispatched: usize = dispatcher.dispatched_jobs().iter().map(|j| j.items.len()).sum();
        assert_eq!(dispatched, size);
    }

    #[tokio::test]
    async fn test_cancel_while_partitioning() {
        let dispatcher = Arc::new(MockDispatcher::new().auto_complete());
        let svc = services(Arc::clone(&dispatcher), wide_limits());
        let registry = svc.registry.clone().unwrap();
        let exec = MultipleNodeExecutor::new(svc).execute(request(graphs::layered(42, 50, 3)));

        exec.cancel();
        assert!(matches!(exec.await, Err(GridError::Cancelled)));
        assert!(dispatcher.dispatched_jobs().is_empty());
        assert!(registry.outstanding().is_empty());
    }

    #[tokio::test]
    async fn test_long_chain_completes_without_deep_recursion() {
        // One job per node, each released by the previous job's answer.
        let graph = graphs::chain(2_000);
        let dispatcher = Arc::new(MockDispatcher::new().auto_complete());
        let limits = PartitionLimits {
            min_items: 1,
            max_items: 1,
            min_cost: 1,
            max_cost: 1,
            max_concurrency: 4,
        };
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), limits));
        let stats = executor.execute(request(graph)).await.unwrap();
        assert_eq!(stats.job_count, 2_000);
        assert_eq!(stats.failed_nodes, 0);
    }

    #[tokio::test]
    async fn test_private_values_never_cross_jobs() {
        let graph = graphs::layered(4, 5, 2);
        let dispatcher = Arc::new(MockDispatcher::new().auto_complete());
        let limits = PartitionLimits {
            min_items: 3,
            max_items: 5,
            min_cost: 3,
            max_cost: 10,
            max_concurrency: 2,
        };
        let executor = MultipleNodeExecutor::new(services(Arc::clone(&dispatcher), limits));
        let req = request(graph.clone());
        executor.execute(req).await.unwrap();

        let jobs = dispatcher.dispatched_jobs();
        for job in &jobs {
            let produced: HashSet<&ValueSpec> = job.items.iter().flat_map(|i| i.outputs.iter()).collect();
            for item in &job.items {
                for out in &item.outputs {
                    let consumed_elsewhere = jobs.iter().any(|other| {
                        other.spec.job_id != job.spec.job_id
                            && other.items.iter().any(|i| i.inputs.contains(out))
                    });
                    let private = job.cache_hint.is_private(out);
                    assert_eq!(
                        private,
                        !consumed_elsewhere && !graph.is_terminal_output(out),
                        "{}",
                        out
                    );
                }
                for input in &item.inputs {
                    if !produced.contains(input) {
                        assert!(!job.cache_hint.is_private(input));
                    }
                }
            }
        }
    }
}
