use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gridval_core::config::TunerConfig;
use gridval_core::event::{EngineEvent, EventBus};
use gridval_core::traits::JobDispatcher;

use crate::params::PartitionParameters;

/// Periodically aligns the partitioner's concurrency target with the
/// capacity the dispatcher advertises.
pub struct ConcurrencyTuner {
    params: Arc<PartitionParameters>,
    dispatcher: Arc<dyn JobDispatcher>,
    event_bus: Arc<EventBus>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ConcurrencyTuner {
    pub fn new(
        config: &TunerConfig,
        params: Arc<PartitionParameters>,
        dispatcher: Arc<dyn JobDispatcher>,
        event_bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            params,
            dispatcher,
            event_bus,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            cancel,
        }
    }

    /// Run the tuning loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Concurrency tuner started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Concurrency tuner shutting down");
                    break;
                }
            }
            self.tune();
        }
    }

    /// Sample capacity once. Returns the new target when it changed.
    pub fn tune(&self) -> Option<usize> {
        let capacity = self.dispatcher.capacity();
        if capacity.is_empty() {
            debug!("No workers advertised; concurrency target unchanged");
            return None;
        }
        let total: usize = capacity.iter().map(|w| w.nodes_per_worker).sum();
        let target = (total / capacity.len()).max(1);

        let previous = self.params.set_max_concurrency(target);
        if previous == target {
            return None;
        }
        info!(previous, current = target, workers = capacity.len(), "Concurrency target tuned");
        self.event_bus.publish(EngineEvent::ConcurrencyTuned {
            previous,
            current: target,
        });
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridval_core::config::EngineConfig;
    use gridval_core::traits::WorkerCapacity;
    use gridval_test_utils::MockDispatcher;

    fn worker(name: &str, nodes_per_worker: usize) -> WorkerCapacity {
        WorkerCapacity {
            name: name.into(),
            nodes_per_worker,
        }
    }

    fn tuner(dispatcher: Arc<MockDispatcher>, event_bus: Arc<EventBus>) -> (ConcurrencyTuner, Arc<PartitionParameters>) {
        let params = Arc::new(PartitionParameters::from(&EngineConfig::default()));
        let tuner = ConcurrencyTuner::new(
            &TunerConfig::default(),
            Arc::clone(&params),
            dispatcher,
            event_bus,
            CancellationToken::new(),
        );
        (tuner, params)
    }

    #[tokio::test]
    async fn test_tune_to_average_capacity() {
        let dispatcher = Arc::new(MockDispatcher::new());
        dispatcher.set_capacity(vec![worker("a", 4), worker("b", 2), worker("c", 3)]);
        let event_bus = Arc::new(EventBus::default());
        let mut rx = event_bus.subscribe();
        let (tuner, params) = tuner(Arc::clone(&dispatcher), Arc::clone(&event_bus));

        assert_eq!(tuner.tune(), Some(3));
        assert_eq!(params.max_concurrency(), 3);
        match rx.recv().await.unwrap() {
            EngineEvent::ConcurrencyTuned { previous, current } => {
                assert_eq!(previous, 8);
                assert_eq!(current, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Unchanged capacity is a no-op.
        assert_eq!(tuner.tune(), None);
    }

    #[test]
    fn test_no_workers_keeps_target() {
        let dispatcher = Arc::new(MockDispatcher::new());
        dispatcher.set_capacity(vec![]);
        let (tuner, params) = tuner(dispatcher, Arc::new(EventBus::default()));
        assert_eq!(tuner.tune(), None);
        assert_eq!(params.max_concurrency(), 8);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let (tuner, _) = tuner(dispatcher, Arc::new(EventBus::default()));
        tuner.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), tuner.run()).await.unwrap();
    }
}
