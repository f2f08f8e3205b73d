//! Durable-queue consumer loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{DurableQueue, EmailBatch, QueueMessage};
use crate::intake::Intake;
use crate::model::Deadline;

/// Messages requested per receive call.
const RECEIVE_MAX: usize = 1;

/// Long-poll wait for a receive call.
const RECEIVE_WAIT: Duration = Duration::from_secs(10);

/// Pause after an empty or failed receive.
const IDLE_BACKOFF: Duration = Duration::from_secs(3);

/// Polls a [`DurableQueue`] and feeds every batch into intake.
pub struct Poller {
    queue: Arc<dyn DurableQueue>,
    intake: Intake,
    shutdown: CancellationToken,
    backoff: Duration,
}

impl Poller {
    pub fn new(queue: Arc<dyn DurableQueue>, intake: Intake, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            intake,
            shutdown,
            backoff: IDLE_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Poll until shutdown. Returns the number of queue messages handled.
    pub async fn run(self) -> u64 {
        let mut handled = 0;
        info!("poller_started");

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.queue.receive(RECEIVE_MAX, RECEIVE_WAIT) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "poller_receive_failed");
                    Vec::new()
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = sleep(self.backoff) => continue,
                }
            }

            for message in &messages {
                self.handle(message).await;
                handled += 1;
            }
        }

        info!(handled = handled, "poller_shutdown_complete");
        handled
    }

    /// Submit one queue message and delete it, whether or not it parsed.
    async fn handle(&self, message: &QueueMessage) {
        let message_id = message.message_id.as_deref().unwrap_or("unknown");

        match serde_json::from_slice::<EmailBatch>(&message.body) {
            Ok(batch) => {
                let shutdown = &self.shutdown;
                let accepted = self
                    .intake
                    .submit_batch(&batch, || Deadline::new(shutdown.child_token()))
                    .await;
                info!(
                    message_id = %message_id,
                    submitted = batch.messages.len(),
                    accepted = accepted,
                    "poller_batch_submitted"
                );
            }
            Err(e) => {
                error!(
                    message_id = %message_id,
                    error = %e,
                    body_preview = %String::from_utf8_lossy(
                        &message.body[..message.body.len().min(500)]
                    ),
                    "poller_batch_parse_failed"
                );
            }
        }

        if let Err(e) = self.queue.delete(message).await {
            error!(message_id = %message_id, error = %e, "poller_delete_failed");
        }
    }
}
