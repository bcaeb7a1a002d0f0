use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use gridval_core::graph::LIVE_DATA_FUNCTION;
use gridval_core::job::{CacheHint, InvocationOutcome, Job, JobItem, JobResult, JobResultItem};
use gridval_core::traits::{ComputationCache, ComputationCacheSource};
use gridval_core::types::{Value, ValueSpec};

use crate::function::{FunctionInputs, FunctionRepository};

/// Runs the items of a job in order against one worker's function
/// repository.
///
/// Inputs are read from values produced earlier in the same job, then from
/// the shared cache. Outputs the job's cache hint marks private stay inside
/// the job; everything else is written to the shared cache.
pub struct JobInvoker {
    functions: Arc<FunctionRepository>,
    caches: Arc<dyn ComputationCacheSource>,
    node_name: String,
}

impl JobInvoker {
    pub fn new(
        functions: Arc<FunctionRepository>,
        caches: Arc<dyn ComputationCacheSource>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            functions,
            caches,
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn invoke(&self, job: &Job) -> JobResult {
        let started = Instant::now();
        let cache = self
            .caches
            .cache(&job.spec.view_name, &job.spec.calc_config, job.spec.valuation_time);
        let mut private: HashMap<ValueSpec, Value> = HashMap::new();

        let items: Vec<JobResultItem> = job
            .items
            .iter()
            .map(|item| self.invoke_item(item, &job.cache_hint, cache.as_ref(), &mut private))
            .collect();

        let failed = items.iter().filter(|i| !i.outcome.is_success()).count();
        debug!(
            job = %job.spec,
            items = items.len(),
            failed,
            node = %self.node_name,
            "Job invoked"
        );
        JobResult {
            spec: job.spec.clone(),
            items,
            duration_nanos: started.elapsed().as_nanos() as u64,
            compute_node: self.node_name.clone(),
        }
    }

    fn invoke_item(
        &self,
        item: &JobItem,
        hint: &CacheHint,
        cache: &dyn ComputationCache,
        private: &mut HashMap<ValueSpec, Value>,
    ) -> JobResultItem {
        let started = Instant::now();
        let lookup = |spec: &ValueSpec| private.get(spec).cloned().or_else(|| cache.get(spec));

        // Live sources are satisfied by the snapshot already in the cache.
        if item.function == LIVE_DATA_FUNCTION {
            let missing: Vec<ValueSpec> = item.outputs.iter().filter(|o| lookup(o).is_none()).cloned().collect();
            let outcome = if missing.is_empty() {
                InvocationOutcome::Success
            } else {
                InvocationOutcome::MissingInputs { missing }
            };
            return finished(outcome, started);
        }

        let mut values = HashMap::with_capacity(item.inputs.len());
        let mut missing = vec![];
        for input in &item.inputs {
            match lookup(input) {
                Some(value) => {
                    values.insert(input.clone(), value);
                }
                None => missing.push(input.clone()),
            }
        }
        if !missing.is_empty() {
            debug!(function = %item.function, target = %item.target, missing = missing.len(), "Inputs missing");
            return finished(InvocationOutcome::MissingInputs { missing }, started);
        }

        let Some(function) = self.functions.get(&item.function) else {
            warn!(function = %item.function, "Function not registered");
            return finished(
                InvocationOutcome::FunctionFailed {
                    message: format!("function not found: {}", item.function),
                },
                started,
            );
        };

        let inputs = FunctionInputs::new(values);
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| function.invoke(&item.target, &inputs, &item.outputs)));
        let produced = match invoked {
            Ok(Ok(produced)) => produced,
            Ok(Err(e)) => {
                warn!(function = %item.function, target = %item.target, error = %e, "Function failed");
                return finished(InvocationOutcome::FunctionFailed { message: e.to_string() }, started);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(function = %item.function, target = %item.target, panic = %message, "Function panicked");
                return finished(
                    InvocationOutcome::FunctionFailed {
                        message: format!("{} panicked: {}", item.function, message),
                    },
                    started,
                );
            }
        };

        let mut written = 0;
        for (spec, value) in produced {
            if !item.outputs.contains(&spec) {
                continue;
            }
            if hint.is_private(&spec) {
                private.insert(spec, value);
            } else {
                cache.put(spec, value);
            }
            written += 1;
        }
        let outcome = if written < item.outputs.len() {
            InvocationOutcome::FunctionFailed {
                message: format!(
                    "{} produced {} of {} outputs for {}",
                    item.function,
                    written,
                    item.outputs.len(),
                    item.target
                ),
            }
        } else {
            InvocationOutcome::Success
        };
        finished(outcome, started)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn finished(outcome: InvocationOutcome, started: Instant) -> JobResultItem {
    JobResultItem {
        outcome,
        duration_nanos: started.elapsed().as_nanos() as u64,
    }
}
