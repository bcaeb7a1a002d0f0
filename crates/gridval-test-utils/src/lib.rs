pub mod dispatcher;
pub mod graphs;

pub use dispatcher::MockDispatcher;
