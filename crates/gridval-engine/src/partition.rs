//! Graph partitioning: splits a dependency graph into right-sized jobs.
//!
//! Every node starts in a fragment of its own. Three merge passes then run in
//! rotation until three consecutive passes change nothing:
//!
//! 1. Siblings with the same input fragments that are individually too small
//!    are appended together.
//! 2. A fragment with exactly one dependent is prepended onto it.
//! 3. Wherever the simulated schedule runs more fragments at once than the
//!    concurrency target, the cheapest overlapping fragments are merged.
//!
//! Fragments live in an arena addressed by index; the logical root sits in
//! slot 0 and collects every fragment that has no other dependent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use gridval_core::graph::DependencyGraph;
use gridval_core::types::NodeId;

use crate::params::PartitionLimits;

type FragmentId = usize;

const ROOT: FragmentId = 0;

/// Consecutive no-change passes that end the merge loop.
const MAX_FAILED_PASSES: usize = 3;

#[derive(Debug, Clone, Default)]
struct Fragment {
    nodes: VecDeque<NodeId>,
    inputs: BTreeSet<FragmentId>,
    dependents: BTreeSet<FragmentId>,
    cost: u64,
}

#[derive(Debug, Clone, Copy)]
enum Placement {
    Append,
    Prepend,
}

/// Mutable fragment graph used while partitioning.
struct FragmentGraph {
    slots: Vec<Option<Fragment>>,
    live: usize,
}

impl FragmentGraph {
    /// One fragment per node, wired to mirror the node edges.
    fn from_graph(graph: &DependencyGraph) -> Self {
        let mut fragments = Self {
            slots: vec![Some(Fragment::default())],
            live: 0,
        };
        let mut by_node: HashMap<NodeId, FragmentId> = HashMap::with_capacity(graph.size());
        for node in graph.nodes() {
            let id = fragments.slots.len();
            fragments.slots.push(Some(Fragment {
                nodes: VecDeque::from([node.id]),
                cost: node.cost,
                ..Fragment::default()
            }));
            fragments.live += 1;
            by_node.insert(node.id, id);
        }
        for node in graph.nodes() {
            let consumer = by_node[&node.id];
            for input in graph.input_nodes(node.id) {
                fragments.link(by_node[&input], consumer);
            }
            if graph.dependent_count(node.id) == 0 {
                fragments.link(consumer, ROOT);
            }
        }
        fragments
    }

    fn get(&self, id: FragmentId) -> &Fragment {
        self.slots[id].as_ref().expect("live fragment")
    }

    fn get_mut(&mut self, id: FragmentId) -> &mut Fragment {
        self.slots[id].as_mut().expect("live fragment")
    }

    fn is_live(&self, id: FragmentId) -> bool {
        self.slots.get(id).is_some_and(|s| s.is_some())
    }

    /// Live fragments excluding the root.
    fn ids(&self) -> Vec<FragmentId> {
        (1..self.slots.len()).filter(|id| self.is_live(*id)).collect()
    }

    fn link(&mut self, producer: FragmentId, consumer: FragmentId) {
        self.get_mut(producer).dependents.insert(consumer);
        self.get_mut(consumer).inputs.insert(producer);
    }

    fn fits(&self, a: FragmentId, b: FragmentId, limits: &PartitionLimits) -> bool {
        let (a, b) = (self.get(a), self.get(b));
        a.nodes.len() + b.nodes.len() <= limits.max_items && a.cost + b.cost <= limits.max_cost
    }

    fn is_undersized(&self, id: FragmentId, limits: &PartitionLimits) -> bool {
        let f = self.get(id);
        f.nodes.len() < limits.min_items && f.cost < limits.min_cost
    }

    /// Move `source` into `target` and rewire every edge that touched it.
    fn merge(&mut self, target: FragmentId, source: FragmentId, placement: Placement) {
        debug_assert!(target != ROOT && source != ROOT && target != source);
        let Some(src) = self.slots[source].take() else {
            return;
        };
        self.live -= 1;

        {
            let dst = self.get_mut(target);
            match placement {
                Placement::Append => dst.nodes.extend(src.nodes),
                Placement::Prepend => {
                    for node in src.nodes.into_iter().rev() {
                        dst.nodes.push_front(node);
                    }
                }
            }
            dst.cost += src.cost;
            dst.inputs.remove(&source);
            dst.dependents.remove(&source);
        }

        for input in src.inputs {
            let producer = self.get_mut(input);
            producer.dependents.remove(&source);
            if input != target {
                producer.dependents.insert(target);
                self.get_mut(target).inputs.insert(input);
            }
        }
        for dependent in src.dependents {
            let consumer = self.get_mut(dependent);
            consumer.inputs.remove(&source);
            if dependent != target {
                consumer.inputs.insert(target);
                self.get_mut(target).dependents.insert(dependent);
            }
        }

        // A fragment feeding real dependents is no longer a top-level entry
        // point; completion still reaches the root through those dependents.
        let dst = self.get_mut(target);
        if dst.dependents.len() > 1 && dst.dependents.remove(&ROOT) {
            self.get_mut(ROOT).inputs.remove(&target);
        }
    }

    /// Live fragments with every producer before its consumers.
    fn topological(&self) -> Vec<FragmentId> {
        let ids = self.ids();
        let mut pending: HashMap<FragmentId, usize> =
            ids.iter().map(|id| (*id, self.get(*id).inputs.len())).collect();
        let mut ready: BTreeSet<FragmentId> = ids
            .iter()
            .copied()
            .filter(|id| pending[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for dependent in &self.get(id).dependents {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }
        order
    }

    /// Earliest start of `id`: the longest cost path through its inputs.
    fn start_time(&self, id: FragmentId, memo: &mut HashMap<FragmentId, u64>) -> u64 {
        let mut stack = vec![id];
        while let Some(&top) = stack.last() {
            if memo.contains_key(&top) {
                stack.pop();
                continue;
            }
            let fragment = self.get(top);
            let unresolved: Vec<FragmentId> = fragment
                .inputs
                .iter()
                .filter(|i| !memo.contains_key(i))
                .copied()
                .collect();
            if unresolved.is_empty() {
                let start = fragment
                    .inputs
                    .iter()
                    .map(|i| memo[i] + self.get(*i).cost)
                    .max()
                    .unwrap_or(0);
                memo.insert(top, start);
                stack.pop();
            } else {
                stack.extend(unresolved);
            }
        }
        memo[&id]
    }
}

/// Start times, recomputed only when the number of fragments changes.
#[derive(Default)]
struct ScheduleCache {
    fragment_count: usize,
    starts: HashMap<FragmentId, u64>,
}

impl ScheduleCache {
    fn start_time(&mut self, fragments: &FragmentGraph, id: FragmentId) -> u64 {
        if self.fragment_count != fragments.live {
            self.starts.clear();
            self.fragment_count = fragments.live;
        }
        fragments.start_time(id, &mut self.starts)
    }
}

/// A converged partition, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFragment {
    /// Nodes in execution order.
    pub nodes: Vec<NodeId>,
    pub inputs: Vec<usize>,
    pub dependents: Vec<usize>,
    pub cost: u64,
}

/// Fragments in topological order; the root sentinel is the last entry.
#[derive(Debug, Clone)]
pub struct FragmentPlan {
    fragments: Vec<PlannedFragment>,
    passes: usize,
}

impl FragmentPlan {
    /// The whole graph as one fragment.
    fn single(graph: &DependencyGraph) -> Self {
        if graph.is_empty() {
            return Self::root_only();
        }
        Self {
            fragments: vec![
                PlannedFragment {
                    nodes: graph.execution_order().to_vec(),
                    inputs: vec![],
                    dependents: vec![1],
                    cost: graph.total_cost(),
                },
                PlannedFragment {
                    nodes: vec![],
                    inputs: vec![0],
                    dependents: vec![],
                    cost: 0,
                },
            ],
            passes: 0,
        }
    }

    fn root_only() -> Self {
        Self {
            fragments: vec![PlannedFragment {
                nodes: vec![],
                inputs: vec![],
                dependents: vec![],
                cost: 0,
            }],
            passes: 0,
        }
    }

    fn freeze(fragments: &FragmentGraph, passes: usize) -> Self {
        let order = fragments.topological();
        let index: HashMap<FragmentId, usize> = order
            .iter()
            .enumerate()
            .map(|(dense, id)| (*id, dense))
            .chain(std::iter::once((ROOT, order.len())))
            .collect();
        let remap = |set: &BTreeSet<FragmentId>| {
            let mut v: Vec<usize> = set.iter().map(|id| index[id]).collect();
            v.sort_unstable();
            v
        };

        let mut planned: Vec<PlannedFragment> = order
            .iter()
            .map(|id| {
                let f = fragments.get(*id);
                PlannedFragment {
                    nodes: f.nodes.iter().copied().collect(),
                    inputs: remap(&f.inputs),
                    dependents: remap(&f.dependents),
                    cost: f.cost,
                }
            })
            .collect();
        planned.push(PlannedFragment {
            nodes: vec![],
            inputs: remap(&fragments.get(ROOT).inputs),
            dependents: vec![],
            cost: 0,
        });
        Self {
            fragments: planned,
            passes,
        }
    }

    pub fn fragments(&self) -> &[PlannedFragment] {
        &self.fragments
    }

    pub fn root(&self) -> usize {
        self.fragments.len() - 1
    }

    /// Fragments that become jobs, i.e. everything but the root.
    pub fn jobs(&self) -> &[PlannedFragment] {
        &self.fragments[..self.root()]
    }

    pub fn job_count(&self) -> usize {
        self.root()
    }

    /// Merge passes run before convergence; zero when the graph was sent
    /// whole without partitioning.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Index of the fragment holding each node.
    pub fn fragment_of(&self) -> HashMap<NodeId, usize> {
        self.jobs()
            .iter()
            .enumerate()
            .flat_map(|(i, f)| f.nodes.iter().map(move |n| (*n, i)))
            .collect()
    }

    /// Simulated start time of each job fragment, assuming unlimited workers
    /// and duration equal to cost.
    pub fn start_times(&self) -> Vec<u64> {
        let mut starts = vec![0u64; self.job_count()];
        // Inputs always precede a fragment in the plan.
        for (i, fragment) in self.jobs().iter().enumerate() {
            starts[i] = fragment
                .inputs
                .iter()
                .map(|input| starts[*input] + self.fragments[*input].cost)
                .max()
                .unwrap_or(0);
        }
        starts
    }

    /// Most job fragments whose simulated intervals overlap at one instant.
    pub fn peak_concurrency(&self) -> usize {
        let starts = self.start_times();
        let mut events: Vec<(u64, i8)> = Vec::with_capacity(starts.len() * 2);
        for (i, fragment) in self.jobs().iter().enumerate() {
            if fragment.cost > 0 {
                events.push((starts[i], 1));
                events.push((starts[i] + fragment.cost, -1));
            }
        }
        // Ends sort before starts at the same instant.
        events.sort_unstable();
        let mut active: i64 = 0;
        let mut peak: i64 = 0;
        for (_, delta) in events {
            active += i64::from(delta);
            peak = peak.max(active);
        }
        peak as usize
    }
}

/// Splits graphs into fragments under a set of limits.
#[derive(Debug, Clone)]
pub struct GraphPartitioner {
    limits: PartitionLimits,
}

impl GraphPartitioner {
    pub fn new(limits: PartitionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &PartitionLimits {
        &self.limits
    }

    pub fn partition(&self, graph: &DependencyGraph) -> FragmentPlan {
        if graph.size() <= self.limits.min_items {
            debug!(
                calc_config = graph.calc_config(),
                nodes = graph.size(),
                "Graph below minimum job size, sending as a single job"
            );
            return FragmentPlan::single(graph);
        }

        let mut fragments = FragmentGraph::from_graph(graph);
        let mut schedule = ScheduleCache::default();
        let mut failed = 0;
        let mut passes = 0;

        'converge: loop {
            for pass in 0..3 {
                passes += 1;
                let changed = match pass {
                    0 => self.merge_shared_inputs(&mut fragments),
                    1 => self.merge_single_dependencies(&mut fragments),
                    _ => self.reduce_concurrency(&mut fragments, &mut schedule),
                };
                if changed {
                    failed = 0;
                } else {
                    failed += 1;
                    if failed >= MAX_FAILED_PASSES {
                        break 'converge;
                    }
                }
            }
        }

        debug!(
            calc_config = graph.calc_config(),
            nodes = graph.size(),
            fragments = fragments.live,
            passes,
            "Graph partitioned"
        );
        FragmentPlan::freeze(&fragments, passes)
    }

    /// Pass 1: append undersized siblings that share an identical input set.
    fn merge_shared_inputs(&self, fragments: &mut FragmentGraph) -> bool {
        let mut groups: BTreeMap<Vec<FragmentId>, Vec<FragmentId>> = BTreeMap::new();
        for id in fragments.ids() {
            let key = fragments.get(id).inputs.iter().copied().collect();
            groups.entry(key).or_default().push(id);
        }

        let mut changed = false;
        for members in groups.into_values() {
            let candidates: Vec<FragmentId> = members
                .into_iter()
                .filter(|id| fragments.is_undersized(*id, &self.limits))
                .collect();
            if candidates.len() < 2 {
                continue;
            }
            let mut accumulator: Option<FragmentId> = None;
            for candidate in candidates {
                let Some(target) = accumulator else {
                    accumulator = Some(candidate);
                    continue;
                };
                if fragments.fits(target, candidate, &self.limits) {
                    fragments.merge(target, candidate, Placement::Append);
                    changed = true;
                    if !fragments.is_undersized(target, &self.limits) {
                        accumulator = None;
                    }
                } else {
                    accumulator = Some(candidate);
                }
            }
        }
        changed
    }

    /// Pass 2: fold single-consumer producers into their consumer, working
    /// from the root downwards so chains collapse from the top.
    fn merge_single_dependencies(&self, fragments: &mut FragmentGraph) -> bool {
        let mut changed = false;
        for id in fragments.topological().into_iter().rev() {
            if !fragments.is_live(id) {
                continue;
            }
            let fragment = fragments.get(id);
            if fragment.dependents.len() != 1 {
                continue;
            }
            let Some(&dependent) = fragment.dependents.iter().next() else {
                continue;
            };
            if dependent == ROOT || !fragments.fits(dependent, id, &self.limits) {
                continue;
            }
            fragments.merge(dependent, id, Placement::Prepend);
            changed = true;
        }
        changed
    }

    /// Pass 3: merge the cheapest overlapping fragments wherever the simulated
    /// schedule exceeds the concurrency target. First fit, not optimal.
    fn reduce_concurrency(&self, fragments: &mut FragmentGraph, schedule: &mut ScheduleCache) -> bool {
        let mut changed = false;
        while self.merge_overlaps(fragments, schedule) > 0 {
            changed = true;
        }
        changed
    }

    /// One sweep over the simulated schedule. Start times are those the
    /// sweep began with, so a fragment takes part in at most one merge per
    /// sweep. Returns the number of merges.
    fn merge_overlaps(&self, fragments: &mut FragmentGraph, schedule: &mut ScheduleCache) -> usize {
        // (time, 0 = end / 1 = start, fragment): ends sort first at equal times.
        let mut events: Vec<(u64, u8, FragmentId)> = Vec::new();
        for id in fragments.ids() {
            let cost = fragments.get(id).cost;
            if cost == 0 {
                continue;
            }
            let start = schedule.start_time(fragments, id);
            events.push((start, 1, id));
            events.push((start + cost, 0, id));
        }
        events.sort_unstable();

        let mut active: BTreeSet<FragmentId> = BTreeSet::new();
        let mut merged: HashSet<FragmentId> = HashSet::new();
        let mut merges = 0;
        for (_, kind, id) in events {
            if kind == 0 {
                active.remove(&id);
                continue;
            }
            active.insert(id);
            if active.len() <= self.limits.max_concurrency {
                continue;
            }
            // Zero-cost fragments are left out of the sweep, so every active
            // interval is non-empty and fragments active at the same instant
            // never depend on each other. Any pair of them can merge without
            // creating a cycle, and so can further untouched pairs later in
            // the same sweep.
            let mut by_cost: Vec<FragmentId> = active.iter().copied().filter(|f| !merged.contains(f)).collect();
            by_cost.sort_by_key(|f| (fragments.get(*f).cost, *f));
            if let Some((a, b)) = self.first_fit(fragments, &by_cost) {
                fragments.merge(a, b, Placement::Append);
                active.remove(&b);
                merged.insert(a);
                merged.insert(b);
                merges += 1;
            }
        }
        merges
    }

    fn first_fit(&self, fragments: &FragmentGraph, by_cost: &[FragmentId]) -> Option<(FragmentId, FragmentId)> {
        for (i, &a) in by_cost.iter().enumerate() {
            for &b in &by_cost[i + 1..] {
                if fragments.fits(a, b, &self.limits) {
                    return Some((a, b));
                }
            }
        }
        None
    }
}
