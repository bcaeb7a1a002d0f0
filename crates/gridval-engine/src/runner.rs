use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gridval_core::error::{GridError, Result};
use gridval_core::event::EngineEvent;

use crate::cycle::{CycleServices, CycleState, SingleComputationCycle};
use crate::result::ViewComputationResult;
use crate::view::CompiledView;

/// Runs cycles of a view back to back, each one reusing what it can from the
/// last successful one.
pub struct ViewRunner {
    view: Arc<CompiledView>,
    services: CycleServices,
    interval: Duration,
    cancel: CancellationToken,
}

impl ViewRunner {
    pub fn new(view: Arc<CompiledView>, services: CycleServices, interval: Duration) -> Self {
        let cancel = services.cancel.clone();
        Self {
            view,
            services,
            interval,
            cancel,
        }
    }

    /// Run one cycle, computing a delta against `previous` when it finished.
    /// A failed cycle releases its own resources before returning the error.
    pub async fn run_cycle(
        &self,
        previous: Option<&SingleComputationCycle>,
        valuation_time: DateTime<Utc>,
    ) -> Result<(SingleComputationCycle, ViewComputationResult)> {
        if let Some(previous) = previous {
            if valuation_time.timestamp_millis() <= previous.valuation_time().timestamp_millis() {
                return Err(GridError::IllegalCycleState {
                    operation: format!("start cycle at {}", valuation_time),
                    state: format!("previous cycle valued at {}", previous.valuation_time()),
                });
            }
        }

        let mut cycle = SingleComputationCycle::new(Arc::clone(&self.view), valuation_time, self.services.clone());
        match self.drive(&mut cycle, previous).await {
            Ok(result) => Ok((cycle, result)),
            Err(e) => {
                self.services.event_bus.publish(EngineEvent::CycleFailed {
                    cycle_id: cycle.id().to_string(),
                    error: e.to_string(),
                });
                if let Err(release_err) = cycle.release_resources() {
                    warn!(cycle_id = %cycle.id(), error = %release_err, "Release after failure failed");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        cycle: &mut SingleComputationCycle,
        previous: Option<&SingleComputationCycle>,
    ) -> Result<ViewComputationResult> {
        cycle.prepare_inputs()?;
        if let Some(previous) = previous.filter(|p| p.state() == CycleState::Finished) {
            cycle.compute_delta(previous)?;
        }
        cycle.execute_plans().await?;
        cycle.populate_result_model()
    }

    /// Run until cancelled, until `max_cycles` cycles have been attempted, or
    /// until the result receiver goes away. Returns the number of cycles that
    /// completed.
    pub async fn run(&self, results: mpsc::Sender<ViewComputationResult>, max_cycles: Option<usize>) -> Result<usize> {
        info!(view = self.view.name(), interval_ms = self.interval.as_millis() as u64, "View runner started");
        let mut previous: Option<SingleComputationCycle> = None;
        let mut attempted = 0;
        let mut completed = 0;

        while !self.cancel.is_cancelled() && max_cycles.map_or(true, |max| attempted < max) {
            attempted += 1;
            let valuation_time = next_valuation_time(previous.as_ref().map(|p| p.valuation_time()));
            match self.run_cycle(previous.as_ref(), valuation_time).await {
                Ok((cycle, result)) => {
                    completed += 1;
                    if let Some(mut old) = previous.replace(cycle) {
                        old.release_resources()?;
                    }
                    if results.send(result).await.is_err() {
                        info!("Result receiver dropped; stopping view runner");
                        break;
                    }
                }
                Err(GridError::Cancelled) => break,
                Err(e) => error!(view = self.view.name(), error = %e, "Cycle failed"),
            }

            if max_cycles.is_some_and(|max| attempted >= max) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        if let Some(mut last) = previous {
            last.release_resources()?;
        }
        info!(view = self.view.name(), attempted, completed, "View runner stopped");
        Ok(completed)
    }
}

/// Now at millisecond precision, nudged forward when the clock has not moved
/// past the last cycle. Caches are keyed by epoch millis.
fn next_valuation_time(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    let now = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
    match previous {
        Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
        _ => now,
    }
}
