pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod job;
pub mod memory;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{GridError, Result};
pub use event::{EngineEvent, EventBus};
pub use graph::{DependencyGraph, DependencyGraphBuilder, GraphNode};
pub use types::*;
