//! Development transport that only logs.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use super::{OutboundEmail, Transport, TransportError};

/// Accepts every message and returns a synthetic id.
#[derive(Debug, Default)]
pub struct LogTransport {
    sequence: AtomicU64,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let message_id = format!("log-{n}");

        info!(
            message_id = %message_id,
            recipients = ?email.recipients,
            subject = %email.subject,
            body_length = email.body.len(),
            "log_transport_send"
        );

        Ok(message_id)
    }
}
