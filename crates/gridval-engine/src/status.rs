use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use gridval_core::types::NodeId;

#[derive(Debug, Default)]
struct ConfigStatus {
    executed: HashSet<NodeId>,
    failed: HashSet<NodeId>,
}

/// Executed and failed node sets for one cycle, across all calculation
/// configurations, behind a single reader/writer lock.
#[derive(Debug, Default)]
pub struct NodeStatusTracker {
    inner: RwLock<HashMap<String, ConfigStatus>>,
}

impl NodeStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_executed(&self, calc_config: &str, node: NodeId) {
        self.record(calc_config, [(node, false)]);
    }

    /// Marks the node executed as well; a failed node has always run.
    pub fn mark_failed(&self, calc_config: &str, node: NodeId) {
        self.record(calc_config, [(node, true)]);
    }

    /// Record a batch of `(node, failed)` outcomes under one write lock.
    pub fn record(&self, calc_config: &str, outcomes: impl IntoIterator<Item = (NodeId, bool)>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let status = inner.entry(calc_config.to_string()).or_default();
        for (node, failed) in outcomes {
            status.executed.insert(node);
            if failed {
                status.failed.insert(node);
            }
        }
    }

    pub fn is_executed(&self, calc_config: &str, node: NodeId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(calc_config)
            .is_some_and(|s| s.executed.contains(&node))
    }

    pub fn is_failed(&self, calc_config: &str, node: NodeId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(calc_config)
            .is_some_and(|s| s.failed.contains(&node))
    }

    pub fn executed_count(&self, calc_config: &str) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(calc_config)
            .map_or(0, |s| s.executed.len())
    }

    pub fn failed_count(&self, calc_config: &str) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(calc_config)
            .map_or(0, |s| s.failed.len())
    }

    /// Executed nodes that did not fail.
    pub fn succeeded(&self, calc_config: &str) -> HashSet<NodeId> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(calc_config)
            .map(|s| s.executed.difference(&s.failed).copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_implies_executed() {
        let status = NodeStatusTracker::new();
        status.mark_failed("default", NodeId(3));
        assert!(status.is_executed("default", NodeId(3)));
        assert!(status.is_failed("default", NodeId(3)));
        assert!(!status.is_executed("other", NodeId(3)));
    }

    #[test]
    fn test_batch_record() {
        let status = NodeStatusTracker::new();
        status.record("default", [(NodeId(1), false), (NodeId(2), true), (NodeId(3), false)]);
        assert_eq!(status.executed_count("default"), 3);
        assert_eq!(status.failed_count("default"), 1);
        let ok = status.succeeded("default");
        assert!(ok.contains(&NodeId(1)) && ok.contains(&NodeId(3)));
        assert!(!ok.contains(&NodeId(2)));
    }
}
