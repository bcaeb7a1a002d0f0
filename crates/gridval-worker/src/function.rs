use std::collections::HashMap;
use std::sync::Arc;

use gridval_core::error::{GridError, Result};
use gridval_core::types::{ComputationTarget, Value, ValueSpec};

/// Input values handed to one invocation, keyed by spec.
#[derive(Debug, Clone, Default)]
pub struct FunctionInputs {
    values: HashMap<ValueSpec, Value>,
}

impl FunctionInputs {
    pub fn new(values: HashMap<ValueSpec, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, spec: &ValueSpec) -> Option<&Value> {
        self.values.get(spec)
    }

    /// Numeric input, or an invocation error naming `function`.
    pub fn number(&self, function: &str, spec: &ValueSpec) -> Result<f64> {
        self.get(spec)
            .and_then(Value::as_f64)
            .ok_or_else(|| GridError::Invocation {
                function: function.to_string(),
                message: format!("input {} is missing or not a number", spec),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpec, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A calculation a worker can invoke against a target.
pub trait CalcFunction: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Compute `outputs` for `target`. Every requested output should be
    /// returned; extra values are ignored.
    fn invoke(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        outputs: &[ValueSpec],
    ) -> Result<Vec<(ValueSpec, Value)>>;
}

type FunctionBody =
    dyn Fn(&ComputationTarget, &FunctionInputs, &[ValueSpec]) -> Result<Vec<(ValueSpec, Value)>> + Send + Sync;

/// Adapter so plain closures can be registered.
struct FnFunction {
    name: String,
    body: Box<FunctionBody>,
}

impl CalcFunction for FnFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        outputs: &[ValueSpec],
    ) -> Result<Vec<(ValueSpec, Value)>> {
        (self.body)(target, inputs, outputs)
    }
}

/// Functions available to the workers, by name.
pub struct FunctionRepository {
    functions: HashMap<String, Arc<dyn CalcFunction>>,
}

impl FunctionRepository {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register a function. Replaces any function with the same name.
    pub fn register(&mut self, function: impl CalcFunction) {
        let name = function.name().to_string();
        self.functions.insert(name, Arc::new(function));
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(&ComputationTarget, &FunctionInputs, &[ValueSpec]) -> Result<Vec<(ValueSpec, Value)>>
            + Send
            + Sync
            + 'static,
    {
        self.register(FnFunction {
            name: name.into(),
            body: Box::new(body),
        });
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CalcFunction>> {
        self.functions.get(name).cloned()
    }

    /// Registered function names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn invoke(
        &self,
        name: &str,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        outputs: &[ValueSpec],
    ) -> Result<Vec<(ValueSpec, Value)>> {
        let function = self
            .get(name)
            .ok_or_else(|| GridError::UnknownFunction(name.to_string()))?;
        function.invoke(target, inputs, outputs)
    }
}

impl Default for FunctionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str) -> ValueSpec {
        ValueSpec::new(name, ComputationTarget::primitive("x"))
    }

    fn doubler() -> FunctionRepository {
        let mut repo = FunctionRepository::new();
        repo.register_fn("double", |_, inputs, outputs| {
            let x = inputs.number("double", &spec("In"))?;
            Ok(outputs.iter().map(|o| (o.clone(), json!(x * 2.0))).collect())
        });
        repo
    }

    #[test]
    fn test_register_and_invoke_closure() {
        let repo = doubler();
        let inputs = FunctionInputs::new(HashMap::from([(spec("In"), json!(1.5))]));
        let values = repo
            .invoke("double", &ComputationTarget::primitive("x"), &inputs, &[spec("Out")])
            .unwrap();
        assert_eq!(values, vec![(spec("Out"), json!(3.0))]);
    }

    #[test]
    fn test_unknown_function() {
        let repo = doubler();
        let err = repo
            .invoke("missing", &ComputationTarget::primitive("x"), &FunctionInputs::default(), &[])
            .unwrap_err();
        assert!(matches!(err, GridError::UnknownFunction(name) if name == "missing"));
    }

    #[test]
    fn test_non_numeric_input_is_invocation_error() {
        let repo = doubler();
        let inputs = FunctionInputs::new(HashMap::from([(spec("In"), json!("abc"))]));
        let err = repo
            .invoke("double", &ComputationTarget::primitive("x"), &inputs, &[spec("Out")])
            .unwrap_err();
        assert!(matches!(err, GridError::Invocation { ref function, .. } if function == "double"));
    }

    #[test]
    fn test_list_and_unregister() {
        let mut repo = doubler();
        repo.register_fn("add", |_, _, _| Ok(vec![]));
        assert_eq!(repo.list(), vec!["add", "double"]);
        assert!(repo.unregister("add"));
        assert!(!repo.unregister("add"));
        assert_eq!(repo.len(), 1);
    }
}
