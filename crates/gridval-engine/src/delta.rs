//! Reuse of a previous cycle's outputs for the part of a graph whose live data
//! has not moved.

use std::collections::HashSet;

use tracing::debug;

use gridval_core::graph::{DependencyGraph, GraphNode};
use gridval_core::traits::ComputationCache;
use gridval_core::types::{NodeId, ValueSpec};

use crate::status::NodeStatusTracker;

/// One calculation configuration's state in the previous cycle.
pub struct PreviousRun<'a> {
    pub graph: &'a DependencyGraph,
    pub cache: &'a dyn ComputationCache,
    pub status: &'a NodeStatusTracker,
}

/// The same calculation configuration in the cycle being prepared.
pub struct CurrentRun<'a> {
    pub graph: &'a DependencyGraph,
    pub cache: &'a dyn ComputationCache,
    pub status: &'a NodeStatusTracker,
}

/// Marks reusable nodes of `current` executed and copies their previous
/// outputs into its cache. Returns the number of nodes reused.
///
/// A node is unchanged when it is identical to the previous cycle's node,
/// succeeded there, sees the same live values and depends only on unchanged
/// nodes. It is reused when it is unchanged and every output the previous
/// cache did not keep is consumed only by nodes that are reused as well.
pub fn compute_delta(previous: &PreviousRun<'_>, current: &CurrentRun<'_>) -> usize {
    let graph = current.graph;
    let calc_config = graph.calc_config();
    let mut unchanged: HashSet<NodeId> = HashSet::new();

    for node in graph.nodes() {
        if is_unchanged(node, previous, current, &unchanged) {
            unchanged.insert(node.id);
        }
    }

    let mut reusable: HashSet<NodeId> = HashSet::new();
    for id in graph.execution_order().iter().rev() {
        if !unchanged.contains(id) {
            continue;
        }
        let Some(node) = graph.node(*id) else {
            continue;
        };
        let outputs_available = node.outputs.iter().all(|out| {
            previous.cache.contains(out)
                || consumers(graph, node.id, out).all(|consumer| reusable.contains(&consumer))
        });
        if outputs_available {
            reusable.insert(*id);
        }
    }

    let mut reused = 0;
    for id in graph.execution_order() {
        if !reusable.contains(id) {
            continue;
        }
        let Some(node) = graph.node(*id) else {
            continue;
        };
        // Live sources are stripped from every execution anyway.
        if node.live_data_source {
            continue;
        }
        for out in &node.outputs {
            if let Some(value) = previous.cache.get(out) {
                current.cache.put(out.clone(), value);
            }
        }
        current.status.mark_executed(calc_config, *id);
        reused += 1;
    }

    debug!(
        calc_config,
        nodes = graph.size(),
        unchanged = unchanged.len(),
        reused,
        "Delta computed"
    );
    reused
}

fn is_unchanged(
    node: &GraphNode,
    previous: &PreviousRun<'_>,
    current: &CurrentRun<'_>,
    unchanged: &HashSet<NodeId>,
) -> bool {
    if previous.graph.node(node.id) != Some(node) {
        return false;
    }
    if node.live_data_source {
        return node.outputs.iter().all(|out| same_live_value(out, previous, current));
    }
    let calc_config = current.graph.calc_config();
    if !previous.status.is_executed(calc_config, node.id) || previous.status.is_failed(calc_config, node.id) {
        return false;
    }
    node.inputs.iter().all(|input| match current.graph.producer_of(input) {
        None => same_live_value(input, previous, current),
        Some(producer) => unchanged.contains(&producer),
    })
}

fn same_live_value(spec: &ValueSpec, previous: &PreviousRun<'_>, current: &CurrentRun<'_>) -> bool {
    match (previous.cache.get(spec), current.cache.get(spec)) {
        (Some(before), Some(now)) => before == now,
        _ => false,
    }
}

/// Nodes that read `spec` from `producer`.
fn consumers<'a>(
    graph: &'a DependencyGraph,
    producer: NodeId,
    spec: &'a ValueSpec,
) -> impl Iterator<Item = NodeId> + 'a {
    graph
        .dependent_nodes(producer)
        .filter(move |id| graph.node(*id).is_some_and(|n| n.inputs.contains(spec)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridval_core::memory::InMemoryCache;
    use gridval_test_utils::graphs;
    use serde_json::json;

    /// Seed quotes, run every node "successfully" and keep the given outputs.
    fn finished_run(graph: &DependencyGraph, keep: impl Fn(&ValueSpec) -> bool) -> (InMemoryCache, NodeStatusTracker) {
        let cache = InMemoryCache::new();
        let status = NodeStatusTracker::new();
        for quote in graphs::valuation_quotes() {
            cache.put(quote, json!(1.25));
        }
        for node in graph.nodes() {
            if node.live_data_source {
                continue;
            }
            for out in &node.outputs {
                if keep(out) {
                    cache.put(out.clone(), json!(format!("{}", out)));
                }
            }
            status.mark_executed(graph.calc_config(), node.id);
        }
        (cache, status)
    }

    fn seeded_cache(quote_value: f64) -> InMemoryCache {
        let cache = InMemoryCache::new();
        for quote in graphs::valuation_quotes() {
            cache.put(quote, json!(quote_value));
        }
        cache
    }

    fn computed_nodes(graph: &DependencyGraph) -> usize {
        graph.nodes().filter(|n| !n.live_data_source).count()
    }

    #[test]
    fn test_identical_live_data_reuses_everything() {
        let graph = graphs::valuation("default", 4);
        let (prev_cache, prev_status) = finished_run(&graph, |_| true);
        let cache = seeded_cache(1.25);
        let status = NodeStatusTracker::new();

        let reused = compute_delta(
            &PreviousRun { graph: &graph, cache: &prev_cache, status: &prev_status },
            &CurrentRun { graph: &graph, cache: &cache, status: &status },
        );
        assert_eq!(reused, computed_nodes(&graph));
        for node in graph.nodes().filter(|n| !n.live_data_source) {
            assert!(status.is_executed("default", node.id));
            for out in &node.outputs {
                assert_eq!(cache.get(out), prev_cache.get(out));
            }
        }
    }

    #[test]
    fn test_moved_quote_invalidates_downstream() {
        let graph = graphs::valuation("default", 3);
        let (prev_cache, prev_status) = finished_run(&graph, |_| true);
        let cache = seeded_cache(1.50);
        let status = NodeStatusTracker::new();

        let reused = compute_delta(
            &PreviousRun { graph: &graph, cache: &prev_cache, status: &prev_status },
            &CurrentRun { graph: &graph, cache: &cache, status: &status },
        );
        // Every computed node sits downstream of the curve.
        assert_eq!(reused, 0);
        assert_eq!(status.executed_count("default"), 0);
    }

    #[test]
    fn test_failed_node_is_recomputed_with_dependents() {
        let graph = graphs::valuation("default", 3);
        let (prev_cache, prev_status) = finished_run(&graph, |_| true);
        let trade = graph
            .nodes()
            .find(|n| n.function == graphs::PV_FUNCTION)
            .map(|n| n.id)
            .unwrap();
        prev_status.mark_failed("default", trade);

        let cache = seeded_cache(1.25);
        let status = NodeStatusTracker::new();
        compute_delta(
            &PreviousRun { graph: &graph, cache: &prev_cache, status: &prev_status },
            &CurrentRun { graph: &graph, cache: &cache, status: &status },
        );
        assert!(!status.is_executed("default", trade));
        for dependent in graph.dependent_nodes(trade) {
            assert!(!status.is_executed("default", dependent));
        }
        let curve = graph.nodes().find(|n| n.function == graphs::CURVE_FUNCTION).unwrap();
        assert!(status.is_executed("default", curve.id));
    }

    #[test]
    fn test_private_output_keeps_producer_with_recomputed_consumer() {
        let graph = graphs::valuation("default", 2);
        let curve = graph.nodes().find(|n| n.function == graphs::CURVE_FUNCTION).unwrap();
        let curve_out = curve.outputs[0].clone();
        // The curve was private last time, so the cache never saw it.
        let (prev_cache, prev_status) = finished_run(&graph, |spec| *spec != curve_out);
        let trade = graph
            .nodes()
            .find(|n| n.function == graphs::PV_FUNCTION)
            .map(|n| n.id)
            .unwrap();
        prev_status.mark_failed("default", trade);

        let cache = seeded_cache(1.25);
        let status = NodeStatusTracker::new();
        compute_delta(
            &PreviousRun { graph: &graph, cache: &prev_cache, status: &prev_status },
            &CurrentRun { graph: &graph, cache: &cache, status: &status },
        );
        // The failed trade must run again and needs the curve, so the curve
        // runs again too.
        assert!(!status.is_executed("default", curve.id));
        assert!(!status.is_executed("default", trade));
    }
}
