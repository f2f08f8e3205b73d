//! Dispatch pipeline.
//!
//! ```text
//! Intake ─┐
//!         ├─► DispatchQueue ─► Dispatcher ─► delivery tasks ─► outcome stream ─► Aggregator ─► Store
//! Poller ─┘    (bounded FIFO)   (rate clock)   (one per request)   (unbounded)     (bulk flush)
//! ```
//!
//! All channels are created here and owned by the workers they connect;
//! nothing in the pipeline is global.

pub mod aggregator;
pub mod delivery;
pub mod dispatcher;
pub mod outcome;
pub mod queue;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::store::Store;
use crate::transport::Transport;

pub use aggregator::{Aggregator, AggregatorReport};
pub use delivery::{Deliverer, TrackingPixel};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use outcome::{outcome_stream, OutcomeReceiver, OutcomeSender};
pub use queue::{dispatch_queue, DispatchQueue, Dequeued, QueueClosed, QueueReceiver};

/// Result of a fully stopped pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub dispatch: DispatchReport,
    pub aggregate: AggregatorReport,
}

/// Running dispatcher and aggregator workers.
pub struct Pipeline {
    queue: DispatchQueue,
    dispatcher: JoinHandle<DispatchReport>,
    aggregator: JoinHandle<AggregatorReport>,
}

impl Pipeline {
    /// Wire the pipeline and spawn its two long-lived workers.
    pub fn start(
        config: &Config,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        let (queue, receiver) = dispatch_queue(config.queue_capacity, shutdown.clone());
        let (outcomes, outcome_receiver) = outcome_stream();

        let deliverer = Deliverer::new(
            transport,
            TrackingPixel::new(config.server_host.clone()),
            config.send_timeout,
        );
        let dispatcher = Dispatcher::new(
            receiver,
            deliverer,
            outcomes,
            config.dispatch_interval(),
            config.shutdown_grace,
            shutdown,
        );
        let aggregator = Aggregator::new(
            outcome_receiver,
            store,
            config.bulk_size,
            config.bulk_period,
        );

        info!(
            rate_per_second = config.rate_per_second,
            queue_capacity = config.queue_capacity,
            send_timeout_seconds = config.send_timeout.as_secs_f64(),
            "pipeline_started"
        );

        Pipeline {
            queue,
            dispatcher: tokio::spawn(dispatcher.run()),
            aggregator: tokio::spawn(aggregator.run()),
        }
    }

    /// Producer handle for intake.
    pub fn queue(&self) -> DispatchQueue {
        self.queue.clone()
    }

    /// Wait for both workers to finish.
    ///
    /// The dispatcher stops once the shutdown token fires (or every producer
    /// is gone); the aggregator follows after flushing the last outcomes.
    pub async fn join(self) -> Result<PipelineReport, tokio::task::JoinError> {
        drop(self.queue);
        let dispatch = self.dispatcher.await?;
        let aggregate = self.aggregator.await?;
        Ok(PipelineReport {
            dispatch,
            aggregate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::intake::Intake;
    use crate::model::{Deadline, RequestStatus};
    use crate::pipeline::delivery::tests::MockTransport;
    use crate::queue::EmailMessage;
    use crate::store::SqliteStore;
    use crate::transport::TransportError;

    fn config() -> Config {
        Config {
            rate_per_second: 200,
            send_timeout: Duration::from_secs(1),
            bulk_size: 100,
            bulk_period: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(1),
            ..Config::default()
        }
    }

    fn message(email: &str) -> EmailMessage {
        EmailMessage {
            topic_id: "t1".to_string(),
            email: email.to_string(),
            subject: "Subject".to_string(),
            content: "<p>Hello</p>".to_string(),
        }
    }

    async fn wait_until_resolved(store: &SqliteStore, topic: &str, expected: u64) {
        for _ in 0..200 {
            if store.count_by_status(topic).await.unwrap().resolved() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Requests on {topic} never resolved");
    }

    #[tokio::test]
    async fn test_every_request_resolves_exactly_once() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let transport = Arc::new(MockTransport::default());
        let shutdown = CancellationToken::new();
        let pipeline = Pipeline::start(&config(), store.clone(), transport.clone(), shutdown.clone());
        let intake = Intake::new(store.clone(), pipeline.queue());

        let first = intake
            .submit(&message("a@example.com"), Deadline::none())
            .await
            .unwrap()
            .unwrap();
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let second = intake
            .submit(&message("b@example.com"), Deadline::new(cancelled))
            .await
            .unwrap()
            .unwrap();
        let third = intake
            .submit(&message("c@example.com"), Deadline::none())
            .await
            .unwrap()
            .unwrap();

        wait_until_resolved(&store, "t1", 3).await;
        drop(intake);
        shutdown.cancel();
        let report = pipeline.join().await.unwrap();

        let counts = store.count_by_status("t1").await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.sent + counts.failed + counts.stopped, 3);
        assert_eq!(counts.stopped, 1);
        assert_eq!(transport.send_count(), 2);
        assert_eq!(report.aggregate.outcomes_written, 3);

        let stopped = store.fetch(second).await.unwrap().unwrap();
        assert_eq!(stopped.status, RequestStatus::Stopped);
        assert_eq!(stopped.error.as_deref(), Some("request cancelled"));
        for id in [first, third] {
            let row = store.fetch(id).await.unwrap().unwrap();
            assert_eq!(row.status, RequestStatus::Sent);
            assert!(row.message_id.unwrap().starts_with("mock-"));
        }
    }

    #[tokio::test]
    async fn test_transport_errors_are_recorded_verbatim() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let transport = Arc::new(MockTransport::failing("mailbox unavailable"));
        let shutdown = CancellationToken::new();
        let pipeline = Pipeline::start(&config(), store.clone(), transport, shutdown.clone());
        let intake = Intake::new(store.clone(), pipeline.queue());

        let mut ids = Vec::new();
        for email in ["a@example.com", "b@example.com"] {
            let id = intake
                .submit(&message(email), Deadline::none())
                .await
                .unwrap()
                .unwrap();
            ids.push(id);
        }

        wait_until_resolved(&store, "t1", 2).await;
        drop(intake);
        shutdown.cancel();
        pipeline.join().await.unwrap();

        let expected = TransportError::InvalidResponse("mailbox unavailable".to_string()).to_string();
        for id in ids {
            let row = store.fetch(id).await.unwrap().unwrap();
            assert_eq!(row.status, RequestStatus::Failed);
            assert_eq!(row.error.as_deref(), Some(expected.as_str()));
        }
    }
}
