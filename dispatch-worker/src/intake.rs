//! Request intake shared by the HTTP API and the durable-queue poller.
//!
//! A submission is validated, persisted with status `created`, and only
//! then placed on the dispatch queue.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::model::{Deadline, NewRequest, RequestId, SendRequest};
use crate::pipeline::{DispatchQueue, QueueClosed};
use crate::queue::{EmailBatch, EmailMessage};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("failed to persist request: {0}")]
    Store(#[from] StoreError),

    /// The request was persisted but the pipeline no longer accepts work.
    #[error("pipeline shutting down, request {0} left in created state")]
    ShuttingDown(RequestId),
}

#[derive(Clone)]
pub struct Intake {
    store: Arc<dyn Store>,
    queue: DispatchQueue,
}

impl Intake {
    pub fn new(store: Arc<dyn Store>, queue: DispatchQueue) -> Self {
        Self { store, queue }
    }

    /// Submit a single email.
    ///
    /// Returns `Ok(None)` without touching the store when recipient,
    /// subject or body is empty. Waits while the dispatch queue is full.
    pub async fn submit(
        &self,
        message: &EmailMessage,
        deadline: Deadline,
    ) -> Result<Option<RequestId>, IntakeError> {
        let Some(request) = NewRequest::validated(
            &message.topic_id,
            &message.email,
            &message.subject,
            &message.content,
        ) else {
            warn!(
                topic = %message.topic_id,
                has_email = !message.email.is_empty(),
                has_subject = !message.subject.is_empty(),
                has_content = !message.content.is_empty(),
                "intake_invalid_message"
            );
            return Ok(None);
        };

        let id = self.store.create(&request).await?;

        let topic = request.topic.clone();
        match self.queue.enqueue(SendRequest::new(id, request, deadline)).await {
            Ok(()) => {
                info!(request_id = id, topic = %topic, "intake_enqueued");
                Ok(Some(id))
            }
            Err(QueueClosed(request)) => {
                warn!(request_id = request.id, topic = %topic, "intake_queue_closed");
                Err(IntakeError::ShuttingDown(request.id))
            }
        }
    }

    /// Submit every message of a batch in order, returning how many were
    /// accepted. Failures are logged per message and do not stop the batch.
    pub async fn submit_batch<F>(&self, batch: &EmailBatch, mut deadline: F) -> usize
    where
        F: FnMut() -> Deadline,
    {
        let mut accepted = 0;
        for message in &batch.messages {
            match self.submit(message, deadline()).await {
                Ok(Some(_)) => accepted += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(topic = %message.topic_id, error = %e, "intake_submit_failed");
                }
            }
        }
        accepted
    }
}
