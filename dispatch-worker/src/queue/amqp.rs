//! RabbitMQ-backed durable queue using lapin.
//!
//! Messages are pulled with `basic_get` and stay unacknowledged until
//! [`DurableQueue::delete`]; the broker redelivers anything still unacked
//! when the channel goes away.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicGetOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use super::{DurableQueue, QueueMessage};

/// Pause between two empty `basic_get` polls while waiting for messages.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Durable queue on a single AMQP channel.
pub struct AmqpQueue {
    name: String,
    connection: Connection,
    channel: Channel,
}

impl AmqpQueue {
    /// Connect and declare `name` as a durable queue (idempotent).
    pub async fn get_or_create(url: &str, name: &str) -> Result<Self> {
        info!(url_length = url.len(), "rabbitmq_connecting");

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_connected");

        let channel = connection
            .create_channel()
            .await
            .context("Failed to create channel")?;

        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("Failed to declare queue")?;

        info!(queue = name, "rabbitmq_queue_declared");

        Ok(Self {
            name: name.to_string(),
            connection,
            channel,
        })
    }

    /// Close the channel and connection gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }
        if let Err(e) = self.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }
        info!(queue = %self.name, "rabbitmq_queue_closed");
    }
}

#[async_trait]
impl DurableQueue for AmqpQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + wait;
        let mut messages = Vec::new();

        while messages.len() < max {
            let got = self
                .channel
                .basic_get(&self.name, BasicGetOptions { no_ack: false })
                .await
                .context("Failed to get message")?;

            match got {
                Some(message) => {
                    let delivery = message.delivery;
                    messages.push(QueueMessage {
                        receipt: delivery.delivery_tag,
                        message_id: delivery
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|s| s.to_string()),
                        body: delivery.data,
                    });
                }
                None => {
                    if !messages.is_empty() || Instant::now() >= deadline {
                        break;
                    }
                    sleep(POLL_INTERVAL).await;
                }
            }
        }

        Ok(messages)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<()> {
        self.channel
            .basic_ack(message.receipt, BasicAckOptions::default())
            .await
            .context("Failed to ack message")?;
        Ok(())
    }
}
