use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use gridval_core::config::EngineConfig;

/// Partitioning limits as seen by one graph execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLimits {
    pub min_items: usize,
    pub max_items: usize,
    pub min_cost: u64,
    pub max_cost: u64,
    pub max_concurrency: usize,
}

impl From<&EngineConfig> for PartitionLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            min_items: config.min_job_items,
            max_items: config.max_job_items,
            min_cost: config.min_job_cost,
            max_cost: config.max_job_cost,
            max_concurrency: config.max_concurrency,
        }
    }
}

/// Live partitioning limits. The concurrency tuner adjusts these while
/// executions are in flight; each execution takes a snapshot when it starts.
#[derive(Debug)]
pub struct PartitionParameters {
    min_items: AtomicUsize,
    max_items: AtomicUsize,
    min_cost: AtomicU64,
    max_cost: AtomicU64,
    max_concurrency: AtomicUsize,
}

impl PartitionParameters {
    pub fn new(limits: PartitionLimits) -> Self {
        Self {
            min_items: AtomicUsize::new(limits.min_items),
            max_items: AtomicUsize::new(limits.max_items),
            min_cost: AtomicU64::new(limits.min_cost),
            max_cost: AtomicU64::new(limits.max_cost),
            max_concurrency: AtomicUsize::new(limits.max_concurrency),
        }
    }

    pub fn snapshot(&self) -> PartitionLimits {
        PartitionLimits {
            min_items: self.min_items.load(Ordering::Relaxed),
            max_items: self.max_items.load(Ordering::Relaxed),
            min_cost: self.min_cost.load(Ordering::Relaxed),
            max_cost: self.max_cost.load(Ordering::Relaxed),
            max_concurrency: self.max_concurrency.load(Ordering::Relaxed),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::Relaxed)
    }

    /// Returns the previous value.
    pub fn set_max_concurrency(&self, value: usize) -> usize {
        self.max_concurrency.swap(value.max(1), Ordering::Relaxed)
    }
}

impl From<&EngineConfig> for PartitionParameters {
    fn from(config: &EngineConfig) -> Self {
        Self::new(PartitionLimits::from(config))
    }
}
