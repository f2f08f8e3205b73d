//! Durable queue ingress.
//!
//! A second producer for the dispatch queue: a poller drains an external
//! durable queue and submits its batches through the same intake as the
//! HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! durable queue (RabbitMQ) → Poller → Intake → DispatchQueue
//! ```

pub mod amqp;
pub mod poller;
pub mod types;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use amqp::AmqpQueue;
pub use poller::Poller;
pub use types::{EmailBatch, EmailMessage, QueueMessage, DEFAULT_QUEUE_NAME};

/// An external queue that redelivers messages until they are deleted.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Receive up to `max` messages, waiting at most `wait` for the first.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>>;

    /// Remove a processed message from the queue.
    async fn delete(&self, message: &QueueMessage) -> Result<()>;
}
