use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Graph errors
    #[error("Dependency graph contains a cycle through node {0}")]
    CyclicGraph(String),

    #[error("Node not found in graph: {0}")]
    UnknownNode(String),

    #[error("Value {value} is produced by more than one node")]
    DuplicateProducer { value: String },

    // Cycle errors
    #[error("Illegal cycle transition: cannot {operation} while {state}")]
    IllegalCycleState { operation: String, state: String },

    #[error("Delta requires a finished previous cycle, found {0}")]
    DeltaAgainstUnfinished(String),

    // Execution errors
    #[error("Remote execution of job {job_id} failed: {message}")]
    RemoteExecution { job_id: u64, message: String },

    #[error("Job dispatch failed: {0}")]
    Dispatch(String),

    #[error("Graph execution cancelled")]
    Cancelled,

    // Invocation errors
    #[error("Function not found: {0}")]
    UnknownFunction(String),

    #[error("Function {function} failed: {message}")]
    Invocation { function: String, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GridError>;
