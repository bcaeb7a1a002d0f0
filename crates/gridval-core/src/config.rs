use std::path::Path;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::types::TargetKind;

/// Top-level gridval configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub tuner: Option<TunerConfig>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// How a graph is turned into jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStrategy {
    /// Partition into fragments and dispatch each as its own job.
    #[default]
    MultipleNode,
    /// Whole graph as one job, failures tracked per node.
    SingleNode,
    /// Whole graph as one job, any failure fails every node.
    Atomic,
}

/// Partitioning limits for the multiple-node executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub strategy: ExecutorStrategy,
    /// Graphs this small are sent as a single job; fragments below this and
    /// `min_job_cost` are candidates for merging.
    #[serde(default = "default_min_job_items")]
    pub min_job_items: usize,
    #[serde(default = "default_max_job_items")]
    pub max_job_items: usize,
    #[serde(default = "default_min_job_cost")]
    pub min_job_cost: u64,
    #[serde(default = "default_max_job_cost")]
    pub max_job_cost: u64,
    /// Target number of jobs in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutorStrategy::default(),
            min_job_items: default_min_job_items(),
            max_job_items: default_max_job_items(),
            min_job_cost: default_min_job_cost(),
            max_job_cost: default_max_job_cost(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_min_job_items() -> usize { 16 }
fn default_max_job_items() -> usize { 1_000 }
fn default_min_job_cost() -> u64 { 16 }
fn default_max_job_cost() -> u64 { 100_000 }
fn default_max_concurrency() -> usize { 8 }

/// Per-cycle behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_view_name")]
    pub view_name: String,
    /// Bounded wait for each poll of an executing graph.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay between consecutive cycles of a running view.
    #[serde(default = "default_cycle_interval_ms")]
    pub interval_ms: u64,
    /// Target kinds left out of published results.
    #[serde(default)]
    pub excluded_target_kinds: Vec<TargetKind>,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            view_name: default_view_name(),
            poll_interval_secs: default_poll_interval_secs(),
            interval_ms: default_cycle_interval_ms(),
            excluded_target_kinds: vec![],
        }
    }
}

fn default_view_name() -> String { "default".to_string() }
fn default_poll_interval_secs() -> u64 { 5 }
fn default_cycle_interval_ms() -> u64 { 1_000 }

/// Periodic alignment of `max_concurrency` with worker capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Enable the tuner (default: true when section is present).
    #[serde(default = "default_tuner_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tuner_interval_secs")]
    pub interval_secs: u64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            enabled: default_tuner_enabled(),
            interval_secs: default_tuner_interval_secs(),
        }
    }
}

fn default_tuner_enabled() -> bool { true }
fn default_tuner_interval_secs() -> u64 { 5 }

/// In-process worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs each worker runs at once.
    #[serde(default = "default_nodes_per_worker")]
    pub nodes_per_worker: usize,
    #[serde(default = "default_node_name")]
    pub node_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            nodes_per_worker: default_nodes_per_worker(),
            node_name: default_node_name(),
        }
    }
}

fn default_workers() -> usize { 4 }
fn default_nodes_per_worker() -> usize { 1 }
fn default_node_name() -> String { "local".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GridError::ConfigNotFound(path.display().to_string()))?;

        let config: Self = toml::from_str(&expand_env_vars(&content))
            .map_err(|e| GridError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits the partitioner cannot honour.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.min_job_items > engine.max_job_items {
            return Err(GridError::Config(format!(
                "engine.min_job_items ({}) exceeds engine.max_job_items ({})",
                engine.min_job_items, engine.max_job_items
            )));
        }
        if engine.min_job_cost > engine.max_job_cost {
            return Err(GridError::Config(format!(
                "engine.min_job_cost ({}) exceeds engine.max_job_cost ({})",
                engine.min_job_cost, engine.max_job_cost
            )));
        }
        if engine.max_concurrency == 0 {
            return Err(GridError::Config("engine.max_concurrency must be at least 1".into()));
        }
        if self.dispatcher.workers == 0 || self.dispatcher.nodes_per_worker == 0 {
            return Err(GridError::Config(
                "dispatcher.workers and dispatcher.nodes_per_worker must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns; unset variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    pattern
        .replace_all(input, |caps: &Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
