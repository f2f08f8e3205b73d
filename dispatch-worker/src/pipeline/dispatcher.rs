//! Rate-limited dispatcher.
//!
//! Pops one request per slot from the dispatch queue and hands it to an
//! independent delivery task. Slots are at least `1 / rate_per_second`
//! apart, whatever the queue depth, and the loop never waits on a
//! delivery to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::delivery::Deliverer;
use super::outcome::OutcomeSender;
use super::queue::{Dequeued, QueueReceiver};
use crate::model::DeliveryOutcome;

/// Outcome detail for requests still queued when shutdown began.
pub const DRAINED_AT_SHUTDOWN: &str = "dispatcher shut down before send";

/// Outcome detail for deliveries still running after the grace period.
pub const ABANDONED_AT_SHUTDOWN: &str = "delivery abandoned at shutdown";

/// What the dispatcher did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Requests handed to a delivery task
    pub dispatched: u64,
    /// Requests stopped at their slot because they were cancelled or expired
    pub stopped: u64,
    /// Requests drained from the queue at shutdown
    pub drained: u64,
    /// Delivery tasks abandoned after the grace period
    pub abandoned: u64,
}

pub struct Dispatcher {
    queue: QueueReceiver,
    deliverer: Arc<Deliverer>,
    outcomes: OutcomeSender,
    interval: Duration,
    shutdown_grace: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        queue: QueueReceiver,
        deliverer: Deliverer,
        outcomes: OutcomeSender,
        interval: Duration,
        shutdown_grace: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            deliverer: Arc::new(deliverer),
            outcomes,
            interval,
            shutdown_grace,
            shutdown,
        }
    }

    /// Run until shutdown or until every producer is gone.
    ///
    /// Every request that leaves the queue resolves to exactly one outcome
    /// before this returns, including those drained or abandoned at
    /// shutdown.
    pub async fn run(mut self) -> DispatchReport {
        let tasks = TaskTracker::new();
        let abandon = CancellationToken::new();
        let mut report = DispatchReport::default();
        let mut next_slot = Instant::now();

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "dispatcher_started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = sleep_until(next_slot) => {}
            }

            let request = match self.queue.dequeue().await {
                Dequeued::Item(request) => request,
                Dequeued::Shutdown => break,
            };
            next_slot = Instant::now() + self.interval;

            if let Some(reason) = request.deadline.interrupted() {
                info!(request_id = request.id, reason = reason, "dispatch_stopped");
                self.outcomes
                    .emit(DeliveryOutcome::stopped(request.id, reason));
                report.stopped += 1;
                continue;
            }

            let pending = self.outcomes.pending(request.id);
            let deliverer = Arc::clone(&self.deliverer);
            let abandon = abandon.clone();

            tasks.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = abandon.cancelled() => {
                        DeliveryOutcome::failed(request.id, ABANDONED_AT_SHUTDOWN)
                    }
                    outcome = deliverer.deliver(&request) => outcome,
                };
                pending.resolve(outcome);
            });
            report.dispatched += 1;
        }

        info!("dispatcher_stopping");

        for request in self.queue.close_and_drain().await {
            self.outcomes
                .emit(DeliveryOutcome::stopped(request.id, DRAINED_AT_SHUTDOWN));
            report.drained += 1;
        }

        tasks.close();
        if timeout(self.shutdown_grace, tasks.wait()).await.is_err() {
            report.abandoned = tasks.len() as u64;
            warn!(
                in_flight = report.abandoned,
                grace_seconds = self.shutdown_grace.as_secs_f64(),
                "dispatcher_abandoning_deliveries"
            );
            abandon.cancel();
            tasks.wait().await;
        }

        info!(
            dispatched = report.dispatched,
            stopped = report.stopped,
            drained = report.drained,
            abandoned = report.abandoned,
            "dispatcher_shutdown_complete"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::model::{Deadline, RequestStatus};
    use crate::pipeline::delivery::tests::{request, MockTransport};
    use crate::pipeline::delivery::TrackingPixel;
    use crate::pipeline::outcome::{outcome_stream, OutcomeReceiver, LOST_OUTCOME};
    use crate::pipeline::queue::{dispatch_queue, DispatchQueue};
    use crate::transport::{OutboundEmail, Transport, TransportError};

    struct Harness {
        queue: DispatchQueue,
        outcomes: OutcomeReceiver,
        shutdown: CancellationToken,
        dispatcher: Dispatcher,
    }

    fn harness(transport: Arc<dyn Transport>, rate_per_second: u32, grace: Duration) -> Harness {
        let shutdown = CancellationToken::new();
        let (queue, receiver) = dispatch_queue(100, shutdown.clone());
        let (sender, outcomes) = outcome_stream();
        let deliverer = Deliverer::new(
            transport,
            TrackingPixel::new("http://track.test"),
            Duration::from_secs(10),
        );
        let dispatcher = Dispatcher::new(
            receiver,
            deliverer,
            sender,
            Duration::from_secs(1) / rate_per_second,
            grace,
            shutdown.clone(),
        );
        Harness {
            queue,
            outcomes,
            shutdown,
            dispatcher,
        }
    }

    async fn collect(outcomes: &mut OutcomeReceiver) -> Vec<DeliveryOutcome> {
        let mut all = Vec::new();
        while let Some(outcome) = outcomes.recv().await {
            all.push(outcome);
        }
        all
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rate_is_bounded() {
        let transport = Arc::new(MockTransport::default());
        let Harness {
            queue,
            mut outcomes,
            dispatcher,
            ..
        } = harness(transport.clone(), 10, Duration::from_secs(5));

        for id in 1..=25 {
            queue.enqueue(request(id, Deadline::none())).await.unwrap();
        }
        drop(queue);

        let report = dispatcher.run().await;
        assert_eq!(report.dispatched, 25);

        let times = transport.send_times();
        assert_eq!(times.len(), 25);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }

        // No one-second window holds more than ceil(10 * 1) + 1 sends.
        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .take_while(|t| **t - *start <= Duration::from_secs(1))
                .count();
            assert!(in_window <= 11, "{in_window} sends inside one second");
        }

        assert_eq!(collect(&mut outcomes).await.len(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_is_fifo() {
        let transport = Arc::new(MockTransport::default());
        let Harness {
            queue,
            mut outcomes,
            dispatcher,
            ..
        } = harness(transport.clone(), 50, Duration::from_secs(5));

        for id in 1..=10 {
            queue.enqueue(request(id, Deadline::none())).await.unwrap();
        }
        drop(queue);
        dispatcher.run().await;

        let order: Vec<String> = transport
            .sends
            .lock()
            .unwrap()
            .iter()
            .map(|(_, email)| email.body.clone())
            .collect();
        for (i, body) in order.iter().enumerate() {
            assert!(body.ends_with(&format!("requestId={}\">", i + 1)));
        }
        assert_eq!(collect(&mut outcomes).await.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_delivery_does_not_stall_clock() {
        let transport = Arc::new(MockTransport::slow(Duration::from_secs(5)));
        let Harness {
            queue,
            mut outcomes,
            dispatcher,
            ..
        } = harness(transport.clone(), 10, Duration::from_secs(30));

        for id in 1..=5 {
            queue.enqueue(request(id, Deadline::none())).await.unwrap();
        }
        drop(queue);

        let started = Instant::now();
        dispatcher.run().await;

        let times = transport.send_times();
        assert_eq!(times.len(), 5);
        assert!(times[4] - started < Duration::from_secs(1));

        let all = collect(&mut outcomes).await;
        assert!(all.iter().all(|o| o.status() == RequestStatus::Sent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_is_never_sent() {
        let transport = Arc::new(MockTransport::default());
        let Harness {
            queue,
            mut outcomes,
            dispatcher,
            ..
        } = harness(transport.clone(), 10, Duration::from_secs(5));

        let token = CancellationToken::new();
        queue.enqueue(request(1, Deadline::none())).await.unwrap();
        queue
            .enqueue(request(2, Deadline::new(token.clone())))
            .await
            .unwrap();
        queue
            .enqueue(request(
                3,
                Deadline::none().with_expiry(Instant::now() + Duration::from_millis(50)),
            ))
            .await
            .unwrap();
        token.cancel();
        drop(queue);

        let report = dispatcher.run().await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.stopped, 2);
        assert_eq!(transport.send_count(), 1);

        let mut all = collect(&mut outcomes).await;
        all.sort_by_key(|o| o.request_id());
        assert_eq!(all[0].status(), RequestStatus::Sent);
        assert_eq!(all[1], DeliveryOutcome::stopped(2, "request cancelled"));
        assert_eq!(
            all[2],
            DeliveryOutcome::stopped(3, "request deadline exceeded")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_queue_as_stopped() {
        let transport = Arc::new(MockTransport::default());
        let Harness {
            queue,
            mut outcomes,
            shutdown,
            dispatcher,
        } = harness(transport.clone(), 1, Duration::from_secs(5));

        for id in 1..=5 {
            queue.enqueue(request(id, Deadline::none())).await.unwrap();
        }

        let run = tokio::spawn(dispatcher.run());
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();

        let report = run.await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.drained, 4);
        drop(queue);

        let all = collect(&mut outcomes).await;
        assert_eq!(all.len(), 5);
        assert_eq!(
            all.iter()
                .filter(|o| o.error_detail() == Some(DRAINED_AT_SHUTDOWN))
                .count(),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_after_grace() {
        let transport = Arc::new(MockTransport::slow(Duration::from_secs(60)));
        let Harness {
            queue,
            mut outcomes,
            shutdown,
            dispatcher,
        } = harness(transport.clone(), 10, Duration::from_secs(1));

        queue.enqueue(request(1, Deadline::none())).await.unwrap();

        let run = tokio::spawn(dispatcher.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();

        let report = run.await.unwrap();
        assert_eq!(report.abandoned, 1);

        let all = collect(&mut outcomes).await;
        assert_eq!(all, vec![DeliveryOutcome::failed(1, ABANDONED_AT_SHUTDOWN)]);
    }

    struct PanickingTransport;

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn send(&self, _email: &OutboundEmail) -> Result<String, TransportError> {
            panic!("transport bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_delivery_still_yields_outcome() {
        let Harness {
            queue,
            mut outcomes,
            dispatcher,
            ..
        } = harness(Arc::new(PanickingTransport), 10, Duration::from_secs(5));

        queue.enqueue(request(1, Deadline::none())).await.unwrap();
        drop(queue);
        dispatcher.run().await;

        let all = collect(&mut outcomes).await;
        assert_eq!(all, vec![DeliveryOutcome::failed(1, LOST_OUTCOME)]);
    }
}
