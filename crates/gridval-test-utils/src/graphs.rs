//! Graph fixtures. Every fixture uses the calculation configuration
//! `"default"` unless it takes a name.

use gridval_core::graph::{DependencyGraph, DependencyGraphBuilder, GraphNode};
use gridval_core::types::{ComputationTarget, NodeId, TargetKind, ValueSpec};

pub const CURVE_FUNCTION: &str = "curve";
pub const PV_FUNCTION: &str = "pv";
pub const SUM_FUNCTION: &str = "sum";

fn value(name: &str, id: impl Into<String>) -> ValueSpec {
    ValueSpec::new(name, ComputationTarget::primitive(id))
}

fn build(builder: DependencyGraphBuilder) -> DependencyGraph {
    builder.build().expect("fixture graph is acyclic")
}

/// Spot value the two diamond roots read.
pub fn diamond_external_inputs() -> Vec<ValueSpec> {
    vec![value("Spot", "X")]
}

/// `A -> C`, `B -> C`, `C -> D`, unit costs. D's output is terminal.
pub fn diamond() -> (DependencyGraph, [NodeId; 4]) {
    let spot = diamond_external_inputs();
    let out = |n: &str| value("Out", n);
    let mut builder = DependencyGraphBuilder::new("default");
    let a = builder.add_node(
        GraphNode::new("a", ComputationTarget::primitive("A"))
            .with_inputs(spot.clone())
            .with_outputs(vec![out("A")]),
    );
    let b = builder.add_node(
        GraphNode::new("b", ComputationTarget::primitive("B"))
            .with_inputs(spot)
            .with_outputs(vec![out("B")]),
    );
    let c = builder.add_node(
        GraphNode::new("c", ComputationTarget::primitive("C"))
            .with_inputs(vec![out("A"), out("B")])
            .with_outputs(vec![out("C")]),
    );
    let d = builder.add_node(
        GraphNode::new("d", ComputationTarget::primitive("D"))
            .with_inputs(vec![out("C")])
            .with_outputs(vec![out("D")]),
    );
    builder.add_terminal_output(out("D"));
    (build(builder), [a, b, c, d])
}

/// `n` unit-cost nodes in a line; the first reads an external seed and the
/// last output is terminal. `chain(0)` is the empty graph.
pub fn chain(n: usize) -> DependencyGraph {
    let mut builder = DependencyGraphBuilder::new("default");
    for i in 0..n {
        let input = if i == 0 {
            value("Seed", "chain")
        } else {
            value("Step", format!("{}", i - 1))
        };
        builder.add_node(
            GraphNode::new("step", ComputationTarget::primitive(format!("chain-{}", i)))
                .with_inputs(vec![input])
                .with_outputs(vec![value("Step", format!("{}", i))]),
        );
    }
    if n > 0 {
        builder.add_terminal_output(value("Step", format!("{}", n - 1)));
    }
    build(builder)
}

/// One source feeding `width` terminal leaves.
pub fn fan_out(width: usize) -> DependencyGraph {
    let mut builder = DependencyGraphBuilder::new("default");
    let source = value("Source", "fan");
    builder.add_node(
        GraphNode::new("source", ComputationTarget::primitive("fan"))
            .with_inputs(vec![value("Seed", "fan")])
            .with_outputs(vec![source.clone()]),
    );
    for i in 0..width {
        let leaf = value("Leaf", format!("{}", i));
        builder.add_node(
            GraphNode::new("leaf", ComputationTarget::primitive(format!("leaf-{}", i)))
                .with_inputs(vec![source.clone()])
                .with_outputs(vec![leaf.clone()]),
        );
        builder.add_terminal_output(leaf);
    }
    build(builder)
}

/// `layers` rows of `width` nodes. Each node past the first row reads
/// `fan_in` outputs of the row above; costs cycle through 1, 2, 3. The last
/// row is terminal.
pub fn layered(layers: usize, width: usize, fan_in: usize) -> DependencyGraph {
    let cell = |layer: usize, j: usize| value("Cell", format!("{}-{}", layer, j));
    let mut builder = DependencyGraphBuilder::new("default");
    for layer in 0..layers {
        for j in 0..width {
            let inputs = if layer == 0 {
                vec![value("Seed", "layered")]
            } else {
                (0..fan_in.min(width))
                    .map(|k| cell(layer - 1, (j + k) % width))
                    .collect()
            };
            builder.add_node(
                GraphNode::new("cell", ComputationTarget::primitive(format!("{}-{}", layer, j)))
                    .with_inputs(inputs)
                    .with_outputs(vec![cell(layer, j)])
                    .with_cost(1 + ((layer * width + j) % 3) as u64),
            );
            if layer + 1 == layers {
                builder.add_terminal_output(cell(layer, j));
            }
        }
    }
    build(builder)
}

/// Market quotes the valuation fixture sources from live data.
pub fn valuation_quotes() -> Vec<ValueSpec> {
    ["USD-1Y", "USD-5Y", "USD-10Y"]
        .into_iter()
        .map(|tenor| ValueSpec::new("MarketQuote", ComputationTarget::new(TargetKind::Security, tenor)))
        .collect()
}

/// Quotes as live data sources, a curve built from them, one present value
/// per trade and a portfolio sum. Trade and portfolio values are terminal.
pub fn valuation(calc_config: &str, trades: usize) -> DependencyGraph {
    let mut builder = DependencyGraphBuilder::new(calc_config);
    let quotes = valuation_quotes();
    for quote in &quotes {
        builder.add_node(GraphNode::live_data(quote.clone()));
    }
    let curve = value("YieldCurve", "USD");
    builder.add_node(
        GraphNode::new(CURVE_FUNCTION, ComputationTarget::primitive("USD"))
            .with_inputs(quotes)
            .with_outputs(vec![curve.clone()])
            .with_cost(2),
    );

    let mut pvs = Vec::with_capacity(trades);
    for i in 0..trades {
        let target = ComputationTarget::new(TargetKind::Position, format!("trade-{}", i));
        let pv = ValueSpec::new("PresentValue", target.clone());
        builder.add_node(
            GraphNode::new(PV_FUNCTION, target)
                .with_inputs(vec![curve.clone()])
                .with_outputs(vec![pv.clone()]),
        );
        builder.add_terminal_output(pv.clone());
        pvs.push(pv);
    }

    let book = ComputationTarget::new(TargetKind::Portfolio, "book");
    let total = ValueSpec::new("PresentValue", book.clone());
    builder.add_node(
        GraphNode::new(SUM_FUNCTION, book)
            .with_inputs(pvs)
            .with_outputs(vec![total.clone()]),
    );
    builder.add_terminal_output(total);
    build(builder)
}
