use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use gridval_core::error::{GridError, Result};
use gridval_core::job::{Job, JobIdSource, JobResult, JobResultItem};
use gridval_core::traits::{ComputationCacheSource, JobDispatcher, JobResultReceiver, WorkerCapacity};

type PendingJob = (Job, Arc<dyn JobResultReceiver>);

struct MockState {
    dispatched: Vec<Job>,
    pending: VecDeque<PendingJob>,
    /// Auto-complete answers not yet delivered.
    ready: VecDeque<PendingJob>,
    draining: bool,
    capacity: Vec<WorkerCapacity>,
}

/// Scripted dispatcher. Jobs queue up until a test answers them, or are
/// answered during `dispatch` in auto-complete mode.
///
/// Auto-complete answers are queued and delivered by the outermost
/// `dispatch` call, so a job dispatched from inside an answer returns at
/// once instead of nesting another delivery on the stack.
///
/// Cancelling a job's token does not stop it from being answered; tests use
/// this to model late results.
pub struct MockDispatcher {
    state: Mutex<MockState>,
    job_ids: Arc<JobIdSource>,
    auto_complete: bool,
    failing_functions: HashSet<String>,
    cache_source: Option<Arc<dyn ComputationCacheSource>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                dispatched: vec![],
                pending: VecDeque::new(),
                ready: VecDeque::new(),
                draining: false,
                capacity: vec![WorkerCapacity {
                    name: "mock".into(),
                    nodes_per_worker: 1,
                }],
            }),
            job_ids: Arc::new(JobIdSource::new()),
            auto_complete: false,
            failing_functions: HashSet::new(),
            cache_source: None,
        }
    }

    /// Answer every job as soon as it is dispatched.
    pub fn auto_complete(mut self) -> Self {
        self.auto_complete = true;
        self
    }

    /// Items invoking `function` fail in default answers.
    pub fn failing_function(mut self, function: impl Into<String>) -> Self {
        self.failing_functions.insert(function.into());
        self
    }

    /// Write `1.0` for every shared output of a successful item, the way a
    /// worker would publish it.
    pub fn with_cache_source(mut self, caches: Arc<dyn ComputationCacheSource>) -> Self {
        self.cache_source = Some(caches);
        self
    }

    pub fn set_capacity(&self, capacity: Vec<WorkerCapacity>) {
        self.lock().capacity = capacity;
    }

    /// Every job dispatched so far, in dispatch order.
    pub fn dispatched_jobs(&self) -> Vec<Job> {
        self.lock().dispatched.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Answer the oldest pending job with the default outcome.
    pub fn complete_next(&self) -> bool {
        self.complete_next_with(|job| self.default_items(job))
    }

    /// Answer the oldest pending job with the given item results.
    pub fn complete_next_with(&self, items: impl FnOnce(&Job) -> Vec<JobResultItem>) -> bool {
        let next = self.lock().pending.pop_front();
        match next {
            Some((job, receiver)) => {
                let items = items(&job);
                self.deliver(job, items, receiver);
                true
            }
            None => false,
        }
    }

    /// Answer pending jobs, including any they release, until none are left.
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    /// Report the oldest pending job as lost.
    pub fn fail_next(&self, message: &str) -> bool {
        let next = self.lock().pending.pop_front();
        match next {
            Some((job, receiver)) => {
                receiver.on_failure(job.spec, GridError::Dispatch(message.to_string()));
                true
            }
            None => false,
        }
    }

    fn drain_ready(&self) {
        loop {
            let next = {
                let mut state = self.lock();
                let next = state.ready.pop_front();
                if next.is_none() {
                    state.draining = false;
                }
                next
            };
            let Some((job, receiver)) = next else {
                return;
            };
            let items = self.default_items(&job);
            self.deliver(job, items, receiver);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn default_items(&self, job: &Job) -> Vec<JobResultItem> {
        job.items
            .iter()
            .map(|item| {
                if self.failing_functions.contains(&item.function) {
                    JobResultItem::failed("injected failure")
                } else {
                    JobResultItem::success(1_000)
                }
            })
            .collect()
    }

    fn deliver(&self, job: Job, items: Vec<JobResultItem>, receiver: Arc<dyn JobResultReceiver>) {
        if let Some(caches) = &self.cache_source {
            let cache = caches.cache(&job.spec.view_name, &job.spec.calc_config, job.spec.valuation_time);
            for (item, result) in job.items.iter().zip(&items) {
                if !result.outcome.is_success() {
                    continue;
                }
                for output in item.outputs.iter().filter(|o| !job.cache_hint.is_private(o)) {
                    cache.put(output.clone(), json!(1.0));
                }
            }
        }
        let duration_nanos = items.iter().map(|i| i.duration_nanos).sum();
        receiver.on_result(JobResult {
            spec: job.spec,
            items,
            duration_nanos,
            compute_node: "mock".into(),
        });
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl JobDispatcher for MockDispatcher {
    fn dispatch(&self, job: Job, receiver: Arc<dyn JobResultReceiver>) -> Result<CancellationToken> {
        {
            let mut state = self.lock();
            state.dispatched.push(job.clone());
            if !self.auto_complete {
                state.pending.push_back((job, receiver));
                return Ok(CancellationToken::new());
            }
            state.ready.push_back((job, receiver));
            if state.draining {
                return Ok(CancellationToken::new());
            }
            state.draining = true;
        }
        self.drain_ready();
        Ok(CancellationToken::new())
    }

    fn job_ids(&self) -> Arc<JobIdSource> {
        Arc::clone(&self.job_ids)
    }

    fn capacity(&self) -> Vec<WorkerCapacity> {
        self.lock().capacity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gridval_core::job::{CacheHint, JobSpecification};

    fn job(job_id: u64) -> Job {
        Job {
            spec: JobSpecification {
                view_name: "v".into(),
                calc_config: "default".into(),
                valuation_time: 1,
                job_id,
            },
            items: vec![],
            cache_hint: CacheHint::all_shared(),
        }
    }

    /// Dispatches the next job from inside each answer until `limit` jobs
    /// have gone out, and records the deepest nesting seen.
    struct Relay {
        dispatcher: Arc<MockDispatcher>,
        this: std::sync::Weak<Relay>,
        limit: u64,
        depth: AtomicUsize,
        deepest: AtomicUsize,
        answered: AtomicUsize,
    }

    impl JobResultReceiver for Relay {
        fn on_result(&self, result: JobResult) {
            let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
            self.deepest.fetch_max(depth, Ordering::SeqCst);
            self.answered.fetch_add(1, Ordering::SeqCst);
            let next = result.spec.job_id + 1;
            if next <= self.limit {
                if let Some(this) = self.this.upgrade() {
                    self.dispatcher.dispatch(job(next), this).unwrap();
                }
            }
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _spec: JobSpecification, _error: GridError) {}
    }

    #[test]
    fn test_auto_complete_delivers_nested_dispatches_iteratively() {
        let dispatcher = Arc::new(MockDispatcher::new().auto_complete());
        let relay = Arc::new_cyclic(|this| Relay {
            dispatcher: Arc::clone(&dispatcher),
            this: this.clone(),
            limit: 50_000,
            depth: AtomicUsize::new(0),
            deepest: AtomicUsize::new(0),
            answered: AtomicUsize::new(0),
        });

        dispatcher.dispatch(job(1), relay.clone()).unwrap();
        assert_eq!(relay.answered.load(Ordering::SeqCst), 50_000);
        assert_eq!(relay.deepest.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.dispatched_jobs().len(), 50_000);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_manual_mode_waits_for_the_test() {
        let dispatcher = MockDispatcher::new();
        let relay = Arc::new_cyclic(|this| Relay {
            dispatcher: Arc::new(MockDispatcher::new()),
            this: this.clone(),
            limit: 0,
            depth: AtomicUsize::new(0),
            deepest: AtomicUsize::new(0),
            answered: AtomicUsize::new(0),
        });
        dispatcher.dispatch(job(1), relay.clone()).unwrap();
        assert_eq!(relay.answered.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.complete_all(), 1);
        assert_eq!(relay.answered.load(Ordering::SeqCst), 1);
    }
}
