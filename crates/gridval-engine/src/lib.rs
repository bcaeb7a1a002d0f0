pub mod context;
pub mod cycle;
pub mod delta;
pub mod executor;
pub mod hint;
pub mod listener;
pub mod params;
pub mod partition;
pub mod registry;
pub mod result;
pub mod runner;
pub mod simple;
pub mod status;
pub mod tuner;
pub mod view;

pub use context::MultipleNodeExecutor;
pub use cycle::{CycleServices, CycleState, SingleComputationCycle};
pub use executor::{
    build_executor, DependencyGraphExecutor, ExecutorServices, GraphExecution, GraphExecutionRequest,
};
pub use listener::{ExecutionListener, LoggingListener};
pub use params::{PartitionLimits, PartitionParameters};
pub use partition::{FragmentPlan, GraphPartitioner, PlannedFragment};
pub use registry::JobInspectionRegistry;
pub use result::{CalcConfigResult, ViewComputationResult};
pub use runner::ViewRunner;
pub use simple::{AtomicExecutor, SingleNodeExecutor};
pub use status::NodeStatusTracker;
pub use tuner::ConcurrencyTuner;
pub use view::{CompiledView, ResultFilter};
