//! Shared/private classification of the values a job touches.
//!
//! A value is shared when something outside the job that produced it needs to
//! see it: a terminal output of the view, an input of a node placed in another
//! fragment, or an input no node in the graph produces (and so comes from the
//! cache). Everything else is private to its job.

use std::collections::{BTreeSet, HashSet};

use gridval_core::graph::DependencyGraph;
use gridval_core::job::CacheHint;
use gridval_core::types::{NodeId, ValueSpec};

/// Every shared value of `graph` under the fragment assignment `fragment_of`.
/// Nodes for which `fragment_of` returns `None` count as being in a fragment
/// of their own.
pub fn shared_values(
    graph: &DependencyGraph,
    fragment_of: impl Fn(NodeId) -> Option<usize>,
) -> HashSet<ValueSpec> {
    let mut shared: HashSet<ValueSpec> = graph.terminal_outputs().iter().cloned().collect();

    for node in graph.nodes() {
        let home = fragment_of(node.id);
        for input in &node.inputs {
            match graph.producer_of(input) {
                None => {
                    shared.insert(input.clone());
                }
                Some(producer) => {
                    let producer_home = fragment_of(producer);
                    if producer_home.is_none() || producer_home != home {
                        shared.insert(input.clone());
                    }
                }
            }
        }
    }
    shared
}

/// Cache hint for a job running `nodes`.
pub fn cache_hint(graph: &DependencyGraph, nodes: &[NodeId], shared: &HashSet<ValueSpec>) -> CacheHint {
    let mut shared_here = BTreeSet::new();
    let mut private_here = BTreeSet::new();
    for node in nodes.iter().filter_map(|id| graph.node(*id)) {
        for spec in node.inputs.iter().chain(node.outputs.iter()) {
            if shared.contains(spec) {
                shared_here.insert(spec.clone());
            } else {
                private_here.insert(spec.clone());
            }
        }
    }
    CacheHint::choose(shared_here, private_here)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridval_test_utils::graphs;

    #[test]
    fn test_single_fragment_shares_only_terminals_and_external_inputs() {
        let (graph, [a, b, c, d]) = graphs::diamond();
        let shared = shared_values(&graph, |_| Some(0));
        // Diamond: external input feeds A and B; D's output is terminal.
        let expected: HashSet<ValueSpec> = graph
            .terminal_outputs()
            .iter()
            .cloned()
            .chain(graphs::diamond_external_inputs())
            .collect();
        assert_eq!(shared, expected);

        let hint = cache_hint(&graph, &[a, b, c, d], &shared);
        for node in [a, b, c] {
            for out in &graph.node(node).unwrap().outputs {
                assert!(hint.is_private(out), "{} should be private", out);
            }
        }
        for out in &graph.node(d).unwrap().outputs {
            assert!(!hint.is_private(out));
        }
    }

    #[test]
    fn test_cross_fragment_values_are_shared() {
        let (graph, [a, b, c, d]) = graphs::diamond();
        // {A, B} and {C, D}
        let shared = shared_values(&graph, |n| Some(if n == a || n == b { 0 } else { 1 }));
        for node in [a, b] {
            for out in &graph.node(node).unwrap().outputs {
                assert!(shared.contains(out));
            }
        }
        for out in &graph.node(c).unwrap().outputs {
            assert!(!shared.contains(out), "C feeds D in the same fragment");
        }

        let hint = cache_hint(&graph, &[c, d], &shared);
        for out in &graph.node(c).unwrap().outputs {
            assert!(hint.is_private(out));
        }
        for input in &graph.node(c).unwrap().inputs {
            assert!(!hint.is_private(input));
        }
    }

    #[test]
    fn test_hint_uses_shorter_encoding() {
        let graph = graphs::chain(6);
        let order = graph.execution_order().to_vec();
        let shared = shared_values(&graph, |_| Some(0));
        let hint = cache_hint(&graph, &order, &shared);
        // One external input and one terminal output against five privates.
        assert!(matches!(hint, CacheHint::SharedValues(ref v) if v.len() == 2));
    }
}
