//! In-process implementations of the cache and live data collaborators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::traits::{ComputationCache, ComputationCacheSource, LiveDataProvider};
use crate::types::{Value, ValueSpec};

/// Thread-safe hash map cache.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    values: RwLock<HashMap<ValueSpec, Value>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ComputationCache for InMemoryCache {
    fn get(&self, spec: &ValueSpec) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(spec)
            .cloned()
    }

    fn put(&self, spec: ValueSpec, value: Value) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec, value);
    }
}

type CacheKey = (String, String, i64);

/// Keeps one `InMemoryCache` per (view, calc config, valuation time) until
/// released.
#[derive(Default)]
pub struct InMemoryCacheSource {
    caches: Mutex<HashMap<CacheKey, Arc<InMemoryCache>>>,
}

impl InMemoryCacheSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live caches.
    pub fn live_caches(&self) -> usize {
        self.caches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl ComputationCacheSource for InMemoryCacheSource {
    fn cache(&self, view_name: &str, calc_config: &str, valuation_time: i64) -> Arc<dyn ComputationCache> {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let cache = caches
            .entry((view_name.to_string(), calc_config.to_string(), valuation_time))
            .or_insert_with(|| Arc::new(InMemoryCache::new()));
        Arc::clone(cache) as Arc<dyn ComputationCache>
    }

    fn release(&self, view_name: &str, valuation_time: i64) {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let before = caches.len();
        caches.retain(|(view, _, time), _| !(view == view_name && *time == valuation_time));
        debug!(
            view = view_name,
            valuation_time,
            released = before - caches.len(),
            "Released computation caches"
        );
    }
}

/// Live data held in memory. `set` updates the ticking values; `snapshot`
/// freezes a copy for a valuation time.
#[derive(Default)]
pub struct InMemoryLiveData {
    current: Mutex<HashMap<ValueSpec, Value>>,
    snapshots: Mutex<HashMap<i64, HashMap<ValueSpec, Value>>>,
}

impl InMemoryLiveData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, spec: ValueSpec, value: Value) {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec, value);
    }

    pub fn remove(&self, spec: &ValueSpec) {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(spec);
    }

    /// Number of snapshots not yet released.
    pub fn open_snapshots(&self) -> usize {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl LiveDataProvider for InMemoryLiveData {
    fn snapshot(&self, valuation_time: i64) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(valuation_time)
            .or_insert(current);
    }

    fn query(&self, valuation_time: i64, requirement: &ValueSpec) -> Option<Value> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&valuation_time)
            .and_then(|snapshot| snapshot.get(requirement).cloned())
    }

    fn release(&self, valuation_time: i64) {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&valuation_time);
    }
}
