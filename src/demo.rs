//! Demo valuation view: swap quotes feed a flat curve, every trade gets a
//! present value and a DV01, and the book sums the present values.

use serde_json::json;

use gridval_core::error::{GridError, Result};
use gridval_core::graph::{DependencyGraph, DependencyGraphBuilder, GraphNode};
use gridval_core::memory::InMemoryLiveData;
use gridval_core::types::{ComputationTarget, TargetKind, Value, ValueSpec};
use gridval_engine::{CompiledView, ResultFilter};
use gridval_worker::{FunctionInputs, FunctionRepository};

pub const BASE_CONFIG: &str = "default";
pub const BUMPED_CONFIG: &str = "bumped";

const QUOTES: [(&str, f64); 3] = [("USD-1Y", 0.0410), ("USD-5Y", 0.0385), ("USD-10Y", 0.0392)];
const ONE_BP: f64 = 0.0001;

pub fn quote(tenor: &str) -> ValueSpec {
    ValueSpec::new("MarketQuote", ComputationTarget::new(TargetKind::Security, tenor))
}

fn curve() -> ValueSpec {
    ValueSpec::new("YieldCurve", ComputationTarget::primitive("USD"))
}

fn trade(i: usize) -> ComputationTarget {
    ComputationTarget::new(TargetKind::Position, format!("trade-{}", i))
}

pub fn book() -> ComputationTarget {
    ComputationTarget::new(TargetKind::Portfolio, "book")
}

/// Notional and maturity in years, derived from the trade number.
fn trade_terms(target: &ComputationTarget) -> Option<(f64, f64)> {
    let n: u32 = target.id.strip_prefix("trade-")?.parse().ok()?;
    Some((1_000_000.0 * f64::from(1 + n % 5), f64::from(1 + n % 10)))
}

fn discount(notional: f64, rate: f64, years: f64) -> f64 {
    notional * (-rate * years).exp()
}

/// Seed the live data with the starting quotes.
pub fn seed_quotes(live: &InMemoryLiveData) {
    for (tenor, rate) in QUOTES {
        live.set(quote(tenor), json!(rate));
    }
}

/// Move one quote by `shift`, leaving the others alone.
pub fn shift_quote(live: &InMemoryLiveData, tenor: &str, shift: f64) {
    if let Some((_, rate)) = QUOTES.iter().find(|(t, _)| *t == tenor) {
        live.set(quote(tenor), json!(rate + shift));
    }
}

/// One graph per calculation configuration. The bumped configuration builds
/// its curve one basis point higher.
pub fn build_view(name: &str, trades: usize, filter: ResultFilter) -> Result<CompiledView> {
    let graphs = vec![graph(BASE_CONFIG, "curve", trades)?, graph(BUMPED_CONFIG, "curve+1bp", trades)?];
    Ok(CompiledView::new(name, graphs).with_filter(filter))
}

fn graph(calc_config: &str, curve_function: &str, trades: usize) -> Result<DependencyGraph> {
    let mut builder = DependencyGraphBuilder::new(calc_config);
    let quotes: Vec<ValueSpec> = QUOTES.iter().map(|(tenor, _)| quote(tenor)).collect();
    for q in &quotes {
        builder.add_node(GraphNode::live_data(q.clone()));
    }
    builder.add_node(
        GraphNode::new(curve_function, ComputationTarget::primitive("USD"))
            .with_inputs(quotes)
            .with_outputs(vec![curve()])
            .with_cost(5),
    );

    let mut pvs = Vec::with_capacity(trades);
    for i in 0..trades {
        let target = trade(i);
        let pv = ValueSpec::new("PresentValue", target.clone());
        let dv01 = ValueSpec::new("DV01", target.clone());
        builder.add_node(
            GraphNode::new("pv", target.clone())
                .with_inputs(vec![curve()])
                .with_outputs(vec![pv.clone()])
                .with_cost(2),
        );
        builder.add_node(
            GraphNode::new("dv01", target)
                .with_inputs(vec![curve()])
                .with_outputs(vec![dv01.clone()])
                .with_cost(3),
        );
        builder.add_terminal_output(pv.clone());
        builder.add_terminal_output(dv01);
        pvs.push(pv);
    }

    let total = ValueSpec::new("PresentValue", book());
    builder.add_node(
        GraphNode::new("sum", book())
            .with_inputs(pvs)
            .with_outputs(vec![total.clone()])
            .with_cost(1),
    );
    builder.add_terminal_output(total);
    builder.build()
}

fn single(outputs: &[ValueSpec], value: Value) -> Vec<(ValueSpec, Value)> {
    outputs.iter().map(|o| (o.clone(), value.clone())).collect()
}

fn terms(function: &str, target: &ComputationTarget) -> Result<(f64, f64)> {
    trade_terms(target).ok_or_else(|| GridError::Invocation {
        function: function.to_string(),
        message: format!("{} is not a demo trade", target),
    })
}

fn flat_curve(inputs: &FunctionInputs) -> Result<f64> {
    let mut total = 0.0;
    for (tenor, _) in QUOTES {
        total += inputs.number("curve", &quote(tenor))?;
    }
    Ok(total / QUOTES.len() as f64)
}

/// The demo's calculation functions.
pub fn functions() -> FunctionRepository {
    let mut repo = FunctionRepository::new();
    repo.register_fn("curve", |_, inputs, outputs| Ok(single(outputs, json!(flat_curve(inputs)?))));
    repo.register_fn("curve+1bp", |_, inputs, outputs| {
        Ok(single(outputs, json!(flat_curve(inputs)? + ONE_BP)))
    });
    repo.register_fn("pv", |target, inputs, outputs| {
        let (notional, years) = terms("pv", target)?;
        let rate = inputs.number("pv", &curve())?;
        Ok(single(outputs, json!(discount(notional, rate, years))))
    });
    repo.register_fn("dv01", |target, inputs, outputs| {
        let (notional, years) = terms("dv01", target)?;
        let rate = inputs.number("dv01", &curve())?;
        let dv01 = discount(notional, rate, years) - discount(notional, rate + ONE_BP, years);
        Ok(single(outputs, json!(dv01)))
    });
    repo.register_fn("sum", |_, inputs, outputs| {
        let total: f64 = inputs.iter().filter_map(|(_, v)| v.as_f64()).sum();
        Ok(single(outputs, json!(total)))
    });
    repo
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_view_has_both_configs() {
        let view = build_view("demo", 4, ResultFilter::default()).unwrap();
        let configs: Vec<&str> = view.calc_configs().collect();
        assert_eq!(configs, vec![BASE_CONFIG, BUMPED_CONFIG]);
        // 3 quotes, curve, 2 per trade, book sum.
        assert_eq!(view.graph(BASE_CONFIG).unwrap().size(), 3 + 1 + 8 + 1);
        assert_eq!(view.live_data_requirements().len(), 3);
    }

    #[test]
    fn test_dv01_is_positive() {
        let repo = functions();
        let inputs = FunctionInputs::new(HashMap::from([(curve(), json!(0.04))]));
        let out = ValueSpec::new("DV01", trade(3));
        let values = repo.invoke("dv01", &trade(3), &inputs, &[out]).unwrap();
        assert!(values[0].1.as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_pv_rejects_non_trade_target() {
        let repo = functions();
        let inputs = FunctionInputs::new(HashMap::from([(curve(), json!(0.04))]));
        assert!(repo.invoke("pv", &book(), &inputs, &[]).is_err());
    }
}
