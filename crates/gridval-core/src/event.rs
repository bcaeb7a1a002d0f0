use chrono::{DateTime, Utc};

use crate::types::GraphExecutionStatistics;

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A computation cycle began preparing inputs.
    CycleStarted { cycle_id: String, valuation_time: DateTime<Utc> },
    /// A cycle executed every calculation configuration and published results.
    CycleCompleted {
        cycle_id: String,
        duration_ms: u64,
        executed_nodes: usize,
        failed_nodes: usize,
        missing_live_data: usize,
    },
    /// A cycle aborted.
    CycleFailed { cycle_id: String, error: String },
    /// One calculation configuration's graph finished executing.
    GraphExecuted { statistics: GraphExecutionStatistics },
    /// A job was handed to the dispatcher.
    JobDispatched { job_id: u64, calc_config: String, items: usize },
    /// The concurrency tuner changed the partitioner's target.
    ConcurrencyTuned { previous: usize, current: usize },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::ConcurrencyTuned {
            previous: 4,
            current: 8,
        });
        match rx.recv().await.unwrap() {
            EngineEvent::ConcurrencyTuned { previous, current } => {
                assert_eq!(previous, 4);
                assert_eq!(current, 8);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::CycleFailed {
            cycle_id: "c1".into(),
            error: "boom".into(),
        });
    }
}
