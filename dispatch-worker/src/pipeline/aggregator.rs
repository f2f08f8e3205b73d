//! Result aggregator.
//!
//! Turns the stream of delivery outcomes into bulk store writes. A flush
//! happens when the buffer reaches `bulk_size` or when the `bulk_period`
//! timer fires with anything buffered. One task owns the buffer, so two
//! flushes never overlap; outcomes arriving mid-flush wait in the channel
//! for the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use super::outcome::OutcomeReceiver;
use crate::model::DeliveryOutcome;
use crate::store::Store;

/// Shortest flush period accepted; `interval_at` rejects zero.
const MIN_BULK_PERIOD: Duration = Duration::from_millis(1);

/// Why a flush ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Totals over the aggregator's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorReport {
    pub flushes: u64,
    pub failed_flushes: u64,
    pub outcomes_written: u64,
    pub outcomes_dropped: u64,
}

pub struct Aggregator {
    outcomes: OutcomeReceiver,
    store: Arc<dyn Store>,
    bulk_size: usize,
    bulk_period: Duration,
}

impl Aggregator {
    pub fn new(
        outcomes: OutcomeReceiver,
        store: Arc<dyn Store>,
        bulk_size: usize,
        bulk_period: Duration,
    ) -> Self {
        Self {
            outcomes,
            store,
            bulk_size: bulk_size.max(1),
            bulk_period: bulk_period.max(MIN_BULK_PERIOD),
        }
    }

    /// Run until every outcome producer is gone, then flush what is left.
    pub async fn run(mut self) -> AggregatorReport {
        let mut buffer: Vec<DeliveryOutcome> = Vec::with_capacity(self.bulk_size);
        let mut report = AggregatorReport::default();

        let mut ticker = interval_at(Instant::now() + self.bulk_period, self.bulk_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            bulk_size = self.bulk_size,
            bulk_period_seconds = self.bulk_period.as_secs_f64(),
            "aggregator_started"
        );

        loop {
            tokio::select! {
                outcome = self.outcomes.recv() => match outcome {
                    Some(outcome) => {
                        buffer.push(outcome);
                        if buffer.len() >= self.bulk_size {
                            self.flush(&mut buffer, FlushTrigger::Size, &mut report).await;
                        }
                    }
                    None => {
                        self.flush(&mut buffer, FlushTrigger::Shutdown, &mut report).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.flush(&mut buffer, FlushTrigger::Timer, &mut report).await;
                }
            }
        }

        info!(
            flushes = report.flushes,
            failed_flushes = report.failed_flushes,
            outcomes_written = report.outcomes_written,
            outcomes_dropped = report.outcomes_dropped,
            "aggregator_shutdown_complete"
        );

        report
    }

    /// Write the buffer in one transaction. The buffer is cleared whether or
    /// not the write succeeded; a failed batch is logged and dropped.
    async fn flush(
        &self,
        buffer: &mut Vec<DeliveryOutcome>,
        trigger: FlushTrigger,
        report: &mut AggregatorReport,
    ) {
        if buffer.is_empty() {
            return;
        }

        let batch_size = buffer.len() as u64;
        report.flushes += 1;

        match self.store.bulk_update(buffer.as_slice()).await {
            Ok(()) => {
                report.outcomes_written += batch_size;
                info!(
                    batch_size = batch_size,
                    trigger = trigger.as_str(),
                    "bulk_update_success"
                );
            }
            Err(e) => {
                report.failed_flushes += 1;
                report.outcomes_dropped += batch_size;
                let first = buffer.first().map(|o| o.request_id());
                let last = buffer.last().map(|o| o.request_id());
                error!(
                    batch_size = batch_size,
                    trigger = trigger.as_str(),
                    first_request_id = ?first,
                    last_request_id = ?last,
                    error = %e,
                    "bulk_update_failed"
                );
            }
        }

        buffer.clear();
    }
}
