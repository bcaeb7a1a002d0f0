use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use gridval_core::graph::DependencyGraph;
use gridval_core::types::{TargetKind, ValueSpec};

/// Target kinds left out of published results.
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    excluded: HashSet<TargetKind>,
}

impl ResultFilter {
    pub fn new(excluded: impl IntoIterator<Item = TargetKind>) -> Self {
        Self {
            excluded: excluded.into_iter().collect(),
        }
    }

    pub fn accepts(&self, spec: &ValueSpec) -> bool {
        !self.excluded.contains(&spec.target.kind)
    }
}

/// A view compiled into one dependency graph per calculation configuration.
#[derive(Debug, Clone)]
pub struct CompiledView {
    name: String,
    graphs: Vec<Arc<DependencyGraph>>,
    filter: ResultFilter,
}

impl CompiledView {
    pub fn new(name: impl Into<String>, graphs: Vec<DependencyGraph>) -> Self {
        Self {
            name: name.into(),
            graphs: graphs.into_iter().map(Arc::new).collect(),
            filter: ResultFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: ResultFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn calc_configs(&self) -> impl Iterator<Item = &str> + '_ {
        self.graphs.iter().map(|g| g.calc_config())
    }

    pub fn graphs(&self) -> &[Arc<DependencyGraph>] {
        &self.graphs
    }

    pub fn graph(&self, calc_config: &str) -> Option<&Arc<DependencyGraph>> {
        self.graphs.iter().find(|g| g.calc_config() == calc_config)
    }

    pub fn filter(&self) -> &ResultFilter {
        &self.filter
    }

    /// Values the cycle must fetch from live data: outputs of live data
    /// source nodes and any input nothing in the graph produces.
    pub fn live_data_requirements(&self) -> BTreeSet<ValueSpec> {
        let mut requirements = BTreeSet::new();
        for graph in &self.graphs {
            for node in graph.nodes() {
                if node.live_data_source {
                    requirements.extend(node.outputs.iter().cloned());
                }
                for input in &node.inputs {
                    if graph.producer_of(input).is_none() {
                        requirements.insert(input.clone());
                    }
                }
            }
        }
        requirements
    }
}
