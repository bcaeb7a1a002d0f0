mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use gridval_core::config::AppConfig;
use gridval_core::event::{EngineEvent, EventBus};
use gridval_core::memory::{InMemoryCacheSource, InMemoryLiveData};
use gridval_core::traits::JobDispatcher;
use gridval_core::types::ValueSpec;
use gridval_engine::{
    build_executor, ConcurrencyTuner, CycleServices, ExecutorServices, GraphPartitioner, JobInspectionRegistry,
    PartitionLimits, PartitionParameters, ResultFilter, ViewComputationResult, ViewRunner,
};
use gridval_worker::{JobInvoker, LocalDispatcher};

#[derive(Parser)]
#[command(name = "gridval", version, about = "Partitioned valuation of dependency graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gridval.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run cycles of the demo valuation view
    Run {
        /// Number of cycles to run
        #[arg(long, default_value_t = 3)]
        cycles: usize,
        /// Trades in the demo book
        #[arg(long, default_value_t = 100)]
        trades: usize,
    },
    /// Print how the demo graphs are partitioned into jobs
    Plan {
        /// Trades in the demo book
        #[arg(long, default_value_t = 100)]
        trades: usize,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gridval=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file found; using defaults");
        AppConfig::default()
    };

    match cli.command.unwrap_or(Commands::Run { cycles: 3, trades: 100 }) {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Plan { trades } => print_plans(&config, trades)?,
        Commands::Run { cycles, trades } => run(config, cycles, trades).await?,
    }
    Ok(())
}

fn print_plans(config: &AppConfig, trades: usize) -> anyhow::Result<()> {
    let view = demo::build_view(&config.cycle.view_name, trades, ResultFilter::default())?;
    let partitioner = GraphPartitioner::new(PartitionLimits::from(&config.engine));

    for graph in view.graphs() {
        // Live sources never reach a worker.
        let graph = graph.subgraph(|n| !n.live_data_source);
        let plan = partitioner.partition(&graph);
        println!(
            "{}: {} nodes, cost {}, {} jobs, peak concurrency {}",
            graph.calc_config(),
            graph.size(),
            graph.total_cost(),
            plan.job_count(),
            plan.peak_concurrency()
        );
        for (i, fragment) in plan.jobs().iter().enumerate() {
            println!(
                "  job {:>3}: {:>4} items, cost {:>6}, {} inputs, {} dependents",
                i,
                fragment.nodes.len(),
                fragment.cost,
                fragment.inputs.len(),
                fragment.dependents.len()
            );
        }
    }
    Ok(())
}

async fn run(config: AppConfig, cycles: usize, trades: usize) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, shutting down...");
        ctrl_c_cancel.cancel();
    });

    let event_bus = Arc::new(EventBus::default());
    spawn_event_logger(&event_bus, cancel.clone());

    let caches = Arc::new(InMemoryCacheSource::new());
    let live = Arc::new(InMemoryLiveData::new());
    demo::seed_quotes(&live);

    let invoker = JobInvoker::new(
        Arc::new(demo::functions()),
        caches.clone(),
        config.dispatcher.node_name.clone(),
    );
    let dispatcher: Arc<dyn JobDispatcher> = Arc::new(LocalDispatcher::new(&config.dispatcher, invoker)?);
    let params = Arc::new(PartitionParameters::from(&config.engine));
    let executor = build_executor(
        config.engine.strategy,
        ExecutorServices {
            dispatcher: Arc::clone(&dispatcher),
            params: Arc::clone(&params),
            event_bus: Arc::clone(&event_bus),
            registry: Some(Arc::new(JobInspectionRegistry::new())),
        },
    );

    if let Some(tuner_config) = config.tuner.as_ref().filter(|t| t.enabled) {
        let tuner = ConcurrencyTuner::new(
            tuner_config,
            Arc::clone(&params),
            Arc::clone(&dispatcher),
            Arc::clone(&event_bus),
            cancel.clone(),
        );
        tokio::spawn(async move { tuner.run().await });
    }

    let filter = ResultFilter::new(config.cycle.excluded_target_kinds.iter().copied());
    let view = Arc::new(demo::build_view(&config.cycle.view_name, trades, filter)?);
    let services = CycleServices {
        live_data: live.clone(),
        caches,
        executor,
        event_bus,
        poll_interval: Duration::from_secs(config.cycle.poll_interval_secs.max(1)),
        cancel: cancel.clone(),
    };
    let runner = ViewRunner::new(view, services, Duration::from_millis(config.cycle.interval_ms));

    let (tx, mut rx) = mpsc::channel::<ViewComputationResult>(4);
    let consumer = async {
        let mut seen = 0usize;
        while let Some(result) = rx.recv().await {
            seen += 1;
            print_result(&result);
            // Tick the long end every other cycle so later cycles mix
            // reused and recomputed nodes.
            if seen % 2 == 0 {
                demo::shift_quote(&live, "USD-10Y", 0.0001 * seen as f64);
            }
        }
    };
    let (completed, ()) = tokio::join!(runner.run(tx, Some(cycles)), consumer);
    let completed = completed?;

    cancel.cancel();
    info!(completed, requested = cycles, "Done");
    Ok(())
}

fn print_result(result: &ViewComputationResult) {
    println!(
        "cycle {} @ {} in {} ms: {} executed, {} failed",
        result.cycle_id,
        result.valuation_time.format("%H:%M:%S%.3f"),
        result.duration_ms,
        result.executed_nodes(),
        result.failed_nodes()
    );
    let total = ValueSpec::new("PresentValue", demo::book());
    for (calc_config, calc) in &result.calc_results {
        let book_pv = calc.values.get(&total).and_then(|v| v.as_f64());
        match book_pv {
            Some(pv) => println!("  {:<8} book PV {:>18.2} ({} values)", calc_config, pv, calc.values.len()),
            None => println!("  {:<8} book PV unavailable ({} values)", calc_config, calc.values.len()),
        }
    }
    if !result.missing_live_data.is_empty() {
        warn!(missing = result.missing_live_data.len(), "Cycle ran with missing live data");
    }
}

fn spawn_event_logger(event_bus: &EventBus, cancel: CancellationToken) {
    let mut events = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(EngineEvent::GraphExecuted { statistics }) => info!(
                        calc_config = %statistics.calc_config,
                        nodes = statistics.node_count,
                        jobs = statistics.job_count,
                        failed = statistics.failed_nodes,
                        wall_ms = statistics.wall_time_ms,
                        "Graph executed"
                    ),
                    Ok(EngineEvent::ConcurrencyTuned { previous, current }) => {
                        info!(previous, current, "Concurrency target changed")
                    }
                    Ok(other) => debug!(event = ?other, "Engine event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event logger lagged")
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    });
}
