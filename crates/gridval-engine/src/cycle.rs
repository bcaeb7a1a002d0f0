//! One end-to-end computation cycle of a view.
//!
//! ```text
//! Created --prepare_inputs--> InputsPrepared --execute_plans--> Executing --> Finished
//!                                   |                                            |
//!                             compute_delta                             release_resources
//!                                                                                v
//!                                                                             Cleaned
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gridval_core::error::{GridError, Result};
use gridval_core::event::{EngineEvent, EventBus};
use gridval_core::traits::{ComputationCache, ComputationCacheSource, LiveDataProvider};
use gridval_core::types::{GraphExecutionStatistics, ValueSpec};

use crate::delta::{self, CurrentRun, PreviousRun};
use crate::executor::{DependencyGraphExecutor, GraphExecution, GraphExecutionRequest};
use crate::result::{CalcConfigResult, ViewComputationResult};
use crate::status::NodeStatusTracker;
use crate::view::CompiledView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Created,
    InputsPrepared,
    Executing,
    Finished,
    Cleaned,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::InputsPrepared => "inputs_prepared",
            Self::Executing => "executing",
            Self::Finished => "finished",
            Self::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

/// Collaborators a cycle runs against.
#[derive(Clone)]
pub struct CycleServices {
    pub live_data: Arc<dyn LiveDataProvider>,
    pub caches: Arc<dyn ComputationCacheSource>,
    pub executor: Arc<dyn DependencyGraphExecutor>,
    pub event_bus: Arc<EventBus>,
    /// Bounded wait for each poll of an execution.
    pub poll_interval: Duration,
    pub cancel: CancellationToken,
}

pub struct SingleComputationCycle {
    id: Uuid,
    view: Arc<CompiledView>,
    valuation_time: DateTime<Utc>,
    services: CycleServices,
    state: CycleState,
    status: Arc<NodeStatusTracker>,
    caches: BTreeMap<String, Arc<dyn ComputationCache>>,
    missing_live_data: BTreeSet<ValueSpec>,
    statistics: BTreeMap<String, GraphExecutionStatistics>,
    reused_nodes: usize,
    started: Instant,
}

impl SingleComputationCycle {
    pub fn new(view: Arc<CompiledView>, valuation_time: DateTime<Utc>, services: CycleServices) -> Self {
        Self {
            id: Uuid::new_v4(),
            view,
            valuation_time,
            services,
            state: CycleState::Created,
            status: Arc::new(NodeStatusTracker::new()),
            caches: BTreeMap::new(),
            missing_live_data: BTreeSet::new(),
            statistics: BTreeMap::new(),
            reused_nodes: 0,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn valuation_time(&self) -> DateTime<Utc> {
        self.valuation_time
    }

    fn valuation_millis(&self) -> i64 {
        self.valuation_time.timestamp_millis()
    }

    pub fn status(&self) -> &Arc<NodeStatusTracker> {
        &self.status
    }

    pub fn missing_live_data(&self) -> &BTreeSet<ValueSpec> {
        &self.missing_live_data
    }

    pub fn statistics(&self) -> &BTreeMap<String, GraphExecutionStatistics> {
        &self.statistics
    }

    /// Nodes taken over from the previous cycle by `compute_delta`.
    pub fn reused_nodes(&self) -> usize {
        self.reused_nodes
    }

    fn require(&self, operation: &str, expected: CycleState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(GridError::IllegalCycleState {
                operation: operation.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    /// Snapshot live data and seed every calculation configuration's cache.
    /// Missing values are recorded, not fatal.
    pub fn prepare_inputs(&mut self) -> Result<()> {
        self.require("prepare inputs", CycleState::Created)?;
        self.services.event_bus.publish(EngineEvent::CycleStarted {
            cycle_id: self.id.to_string(),
            valuation_time: self.valuation_time,
        });

        let time = self.valuation_millis();
        self.services.live_data.snapshot(time);
        for calc_config in self.view.calc_configs() {
            let cache = self.services.caches.cache(self.view.name(), calc_config, time);
            self.caches.insert(calc_config.to_string(), cache);
        }

        let requirements = self.view.live_data_requirements();
        for requirement in &requirements {
            match self.services.live_data.query(time, requirement) {
                Some(value) => {
                    for cache in self.caches.values() {
                        cache.put(requirement.clone(), value.clone());
                    }
                }
                None => {
                    warn!(cycle_id = %self.id, requirement = %requirement, "Live data missing");
                    self.missing_live_data.insert(requirement.clone());
                }
            }
        }

        info!(
            cycle_id = %self.id,
            view = self.view.name(),
            requirements = requirements.len(),
            missing = self.missing_live_data.len(),
            "Cycle inputs prepared"
        );
        self.state = CycleState::InputsPrepared;
        Ok(())
    }

    /// Reuse `previous`'s outputs wherever live data did not move. Returns
    /// the number of nodes reused.
    pub fn compute_delta(&mut self, previous: &SingleComputationCycle) -> Result<usize> {
        self.require("compute delta", CycleState::InputsPrepared)?;
        if previous.state != CycleState::Finished {
            return Err(GridError::DeltaAgainstUnfinished(previous.state.to_string()));
        }

        let mut reused = 0;
        for graph in self.view.graphs() {
            let calc_config = graph.calc_config();
            let (Some(previous_graph), Some(previous_cache), Some(cache)) = (
                previous.view.graph(calc_config),
                previous.caches.get(calc_config),
                self.caches.get(calc_config),
            ) else {
                debug!(calc_config, "No previous run for calculation configuration");
                continue;
            };
            reused += delta::compute_delta(
                &PreviousRun {
                    graph: previous_graph,
                    cache: previous_cache.as_ref(),
                    status: &previous.status,
                },
                &CurrentRun {
                    graph,
                    cache: cache.as_ref(),
                    status: &self.status,
                },
            );
        }
        self.reused_nodes = reused;
        info!(cycle_id = %self.id, previous = %previous.id, reused, "Delta against previous cycle");
        Ok(reused)
    }

    /// Execute every calculation configuration's remaining nodes and wait for
    /// all of them. A failed execution cancels the others and fails the cycle.
    pub async fn execute_plans(&mut self) -> Result<()> {
        self.require("execute plans", CycleState::InputsPrepared)?;
        self.state = CycleState::Executing;

        let mut waiting: VecDeque<(String, GraphExecution)> = VecDeque::new();
        for graph in self.view.graphs() {
            let calc_config = graph.calc_config().to_string();
            let status = Arc::clone(&self.status);
            let remaining = graph.subgraph(|node| {
                !node.live_data_source && !status.is_executed(&calc_config, node.id)
            });
            debug!(
                cycle_id = %self.id,
                calc_config = %calc_config,
                nodes = remaining.size(),
                skipped = graph.size() - remaining.size(),
                "Submitting graph"
            );
            let execution = self.services.executor.execute(GraphExecutionRequest {
                view_name: self.view.name().to_string(),
                valuation_time: self.valuation_millis(),
                graph: Arc::new(remaining),
                status,
            });
            waiting.push_back((calc_config, execution));
        }

        while let Some((calc_config, mut execution)) = waiting.pop_front() {
            match tokio::time::timeout(self.services.poll_interval, &mut execution).await {
                Ok(Ok(statistics)) => {
                    debug!(
                        cycle_id = %self.id,
                        calc_config = %calc_config,
                        jobs = statistics.job_count,
                        failed = statistics.failed_nodes,
                        "Graph executed"
                    );
                    self.statistics.insert(calc_config, statistics);
                }
                Ok(Err(e)) => {
                    error!(cycle_id = %self.id, calc_config = %calc_config, error = %e, "Graph execution failed");
                    for (_, other) in &waiting {
                        other.cancel();
                    }
                    return Err(e);
                }
                Err(_) => {
                    if self.services.cancel.is_cancelled() {
                        execution.cancel();
                        for (_, other) in &waiting {
                            other.cancel();
                        }
                        return Err(GridError::Cancelled);
                    }
                    debug!(cycle_id = %self.id, calc_config = %calc_config, "Still executing");
                    waiting.push_back((calc_config, execution));
                }
            }
        }

        self.state = CycleState::Finished;
        let executed: usize = self.view.calc_configs().map(|c| self.status.executed_count(c)).sum();
        let failed: usize = self.view.calc_configs().map(|c| self.status.failed_count(c)).sum();
        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            cycle_id = %self.id,
            executed,
            failed,
            reused = self.reused_nodes,
            duration_ms,
            "Cycle finished"
        );
        self.services.event_bus.publish(EngineEvent::CycleCompleted {
            cycle_id: self.id.to_string(),
            duration_ms,
            executed_nodes: executed,
            failed_nodes: failed,
            missing_live_data: self.missing_live_data.len(),
        });
        Ok(())
    }

    /// Read every accepted terminal output into a result snapshot.
    pub fn populate_result_model(&self) -> Result<ViewComputationResult> {
        self.require("populate result model", CycleState::Finished)?;
        let filter = self.view.filter();
        let mut calc_results = BTreeMap::new();
        for graph in self.view.graphs() {
            let calc_config = graph.calc_config();
            let mut result = CalcConfigResult {
                executed_nodes: self.status.executed_count(calc_config),
                failed_nodes: self.status.failed_count(calc_config),
                ..Default::default()
            };
            if let Some(cache) = self.caches.get(calc_config) {
                for spec in graph.terminal_outputs().iter().filter(|s| filter.accepts(s)) {
                    if let Some(value) = cache.get(spec) {
                        result.values.insert(spec.clone(), value);
                    }
                }
            }
            calc_results.insert(calc_config.to_string(), result);
        }
        Ok(ViewComputationResult {
            view_name: self.view.name().to_string(),
            cycle_id: self.id.to_string(),
            valuation_time: self.valuation_time,
            calc_results,
            missing_live_data: self.missing_live_data.clone(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        })
    }

    /// Release the live data snapshot and caches. Allowed from any state but
    /// `Cleaned`, so a failed cycle can still give its resources back.
    pub fn release_resources(&mut self) -> Result<()> {
        if self.state == CycleState::Cleaned {
            return Err(GridError::IllegalCycleState {
                operation: "release resources".into(),
                state: self.state.to_string(),
            });
        }
        let time = self.valuation_millis();
        if self.state != CycleState::Created {
            self.services.live_data.release(time);
            self.services.caches.release(self.view.name(), time);
        }
        self.caches.clear();
        self.state = CycleState::Cleaned;
        debug!(cycle_id = %self.id, "Cycle resources released");
        Ok(())
    }
}
