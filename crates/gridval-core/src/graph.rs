//! Immutable dependency graph of function invocations.
//!
//! A `DependencyGraph` is built once per calculation configuration and never
//! mutated afterwards. Node edges are inferred from value specifications: a
//! node depends on every node that produces one of its inputs. Inputs that no
//! node produces are external and must be supplied by live data.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::types::{ComputationTarget, NodeId, ValueSpec};

/// Function name carried by nodes that only source live data.
pub const LIVE_DATA_FUNCTION: &str = "live-data";

/// One function invocation in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Assigned by the builder; `NodeId(0)` until then.
    pub id: NodeId,
    /// Name of the function to invoke.
    pub function: String,
    /// What the function is invoked against.
    pub target: ComputationTarget,
    /// Values the function reads, in declaration order.
    #[serde(default)]
    pub inputs: Vec<ValueSpec>,
    /// Values the function produces.
    #[serde(default)]
    pub outputs: Vec<ValueSpec>,
    /// Relative cost hint used by the partitioner.
    #[serde(default = "default_cost")]
    pub cost: u64,
    /// Nodes that surface a live data value need no computation.
    #[serde(default)]
    pub live_data_source: bool,
}

fn default_cost() -> u64 {
    1
}

impl GraphNode {
    pub fn new(function: impl Into<String>, target: ComputationTarget) -> Self {
        Self {
            id: NodeId(0),
            function: function.into(),
            target,
            inputs: vec![],
            outputs: vec![],
            cost: default_cost(),
            live_data_source: false,
        }
    }

    /// A node that makes a live data value available to the rest of the graph.
    pub fn live_data(spec: ValueSpec) -> Self {
        Self {
            id: NodeId(0),
            function: LIVE_DATA_FUNCTION.to_string(),
            target: spec.target.clone(),
            inputs: vec![],
            outputs: vec![spec],
            cost: 0,
            live_data_source: true,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<ValueSpec>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<ValueSpec>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

/// Collects nodes and terminal outputs, then infers edges and checks the
/// result is acyclic.
pub struct DependencyGraphBuilder {
    calc_config: String,
    nodes: Vec<GraphNode>,
    terminal_outputs: BTreeSet<ValueSpec>,
}

impl DependencyGraphBuilder {
    pub fn new(calc_config: impl Into<String>) -> Self {
        Self {
            calc_config: calc_config.into(),
            nodes: vec![],
            terminal_outputs: BTreeSet::new(),
        }
    }

    /// Add a node and return the identifier assigned to it.
    pub fn add_node(&mut self, mut node: GraphNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.id = id;
        self.nodes.push(node);
        id
    }

    /// Declare a value the view wants published from this graph.
    pub fn add_terminal_output(&mut self, spec: ValueSpec) -> &mut Self {
        self.terminal_outputs.insert(spec);
        self
    }

    pub fn build(self) -> Result<DependencyGraph> {
        let mut producers: HashMap<ValueSpec, NodeId> = HashMap::new();
        for node in &self.nodes {
            for output in &node.outputs {
                if producers.insert(output.clone(), node.id).is_some() {
                    return Err(GridError::DuplicateProducer {
                        value: output.to_string(),
                    });
                }
            }
        }

        let mut input_nodes: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut dependent_nodes: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for node in &self.nodes {
            input_nodes.entry(node.id).or_default();
            dependent_nodes.entry(node.id).or_default();
        }
        for node in &self.nodes {
            for input in &node.inputs {
                if let Some(&producer) = producers.get(input) {
                    if producer == node.id {
                        return Err(GridError::CyclicGraph(node.id.to_string()));
                    }
                    input_nodes.entry(node.id).or_default().insert(producer);
                    dependent_nodes.entry(producer).or_default().insert(node.id);
                }
            }
        }

        let nodes = self
            .nodes
            .into_iter()
            .map(|n| (n.id, Arc::new(n)))
            .collect::<BTreeMap<_, _>>();
        let order = topological_order(&nodes, &input_nodes, &dependent_nodes)?;

        Ok(DependencyGraph {
            calc_config: self.calc_config,
            nodes,
            input_nodes,
            dependent_nodes,
            order,
            terminal_outputs: self.terminal_outputs,
            producers,
        })
    }
}

/// Kahn's algorithm, lowest node id first among ready nodes so the order is
/// deterministic.
fn topological_order(
    nodes: &BTreeMap<NodeId, Arc<GraphNode>>,
    input_nodes: &BTreeMap<NodeId, BTreeSet<NodeId>>,
    dependent_nodes: &BTreeMap<NodeId, BTreeSet<NodeId>>,
) -> Result<Vec<NodeId>> {
    let mut pending: BTreeMap<NodeId, usize> = nodes
        .keys()
        .map(|id| (*id, input_nodes.get(id).map_or(0, |s| s.len())))
        .collect();
    let mut ready: BTreeSet<NodeId> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        pending.remove(&id);
        for dependent in dependent_nodes.get(&id).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if let Some((stuck, _)) = pending.iter().next() {
        return Err(GridError::CyclicGraph(stuck.to_string()));
    }
    Ok(order)
}

/// Immutable DAG for one calculation configuration.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    calc_config: String,
    nodes: BTreeMap<NodeId, Arc<GraphNode>>,
    input_nodes: BTreeMap<NodeId, BTreeSet<NodeId>>,
    dependent_nodes: BTreeMap<NodeId, BTreeSet<NodeId>>,
    order: Vec<NodeId>,
    terminal_outputs: BTreeSet<ValueSpec>,
    producers: HashMap<ValueSpec, NodeId>,
}

impl DependencyGraph {
    pub fn calc_config(&self) -> &str {
        &self.calc_config
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&id).map(|n| n.as_ref())
    }

    /// All nodes, in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> + '_ {
        self.order.iter().filter_map(move |id| self.node(*id))
    }

    /// Node identifiers in an order where every producer precedes its consumers.
    pub fn execution_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes producing inputs of `id` within this graph.
    pub fn input_nodes(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.input_nodes.get(&id).into_iter().flatten().copied()
    }

    /// Nodes consuming outputs of `id` within this graph.
    pub fn dependent_nodes(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.dependent_nodes.get(&id).into_iter().flatten().copied()
    }

    pub fn dependent_count(&self, id: NodeId) -> usize {
        self.dependent_nodes.get(&id).map_or(0, |s| s.len())
    }

    /// Nodes with no dependents: the entry points of a top-down walk.
    pub fn root_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order
            .iter()
            .copied()
            .filter(move |id| self.dependent_count(*id) == 0)
    }

    pub fn terminal_outputs(&self) -> &BTreeSet<ValueSpec> {
        &self.terminal_outputs
    }

    pub fn is_terminal_output(&self, spec: &ValueSpec) -> bool {
        self.terminal_outputs.contains(spec)
    }

    /// Node producing `spec`, if it is part of this graph.
    pub fn producer_of(&self, spec: &ValueSpec) -> Option<NodeId> {
        self.producers.get(spec).copied()
    }

    pub fn total_cost(&self) -> u64 {
        self.nodes.values().map(|n| n.cost).sum()
    }

    /// The graph restricted to nodes accepted by `keep`. Node identifiers are
    /// preserved; edges to removed nodes are dropped, so inputs they produced
    /// become external to the subgraph.
    pub fn subgraph(&self, mut keep: impl FnMut(&GraphNode) -> bool) -> DependencyGraph {
        let nodes: BTreeMap<NodeId, Arc<GraphNode>> = self
            .nodes
            .iter()
            .filter(|(_, n)| keep(n))
            .map(|(id, n)| (*id, Arc::clone(n)))
            .collect();

        let restrict = |edges: &BTreeMap<NodeId, BTreeSet<NodeId>>| {
            nodes
                .keys()
                .map(|id| {
                    let kept = edges
                        .get(id)
                        .into_iter()
                        .flatten()
                        .filter(|other| nodes.contains_key(other))
                        .copied()
                        .collect::<BTreeSet<_>>();
                    (*id, kept)
                })
                .collect::<BTreeMap<_, _>>()
        };
        let input_nodes = restrict(&self.input_nodes);
        let dependent_nodes = restrict(&self.dependent_nodes);
        let order = self
            .order
            .iter()
            .copied()
            .filter(|id| nodes.contains_key(id))
            .collect();
        let producers = self
            .producers
            .iter()
            .filter(|(_, id)| nodes.contains_key(id))
            .map(|(spec, id)| (spec.clone(), *id))
            .collect();

        DependencyGraph {
            calc_config: self.calc_config.clone(),
            nodes,
            input_nodes,
            dependent_nodes,
            order,
            terminal_outputs: self.terminal_outputs.clone(),
            producers,
        }
    }
}
