pub mod dispatcher;
pub mod function;
pub mod invoker;

pub use dispatcher::LocalDispatcher;
pub use function::{CalcFunction, FunctionInputs, FunctionRepository};
pub use invoker::JobInvoker;
