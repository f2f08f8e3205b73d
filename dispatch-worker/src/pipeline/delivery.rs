//! Delivery task: one send attempt, one outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::model::{DeliveryOutcome, RequestId, SendRequest};
use crate::transport::{OutboundEmail, Transport};

/// Builds the open-tracking marker appended to every outbound body.
#[derive(Debug, Clone)]
pub struct TrackingPixel {
    server_host: String,
}

impl TrackingPixel {
    pub fn new(server_host: impl Into<String>) -> Self {
        let server_host: String = server_host.into();
        Self {
            server_host: server_host.trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, request_id: RequestId) -> String {
        format!("{}/v1/events/open?requestId={}", self.server_host, request_id)
    }

    /// `body` with the marker for `request_id` appended.
    pub fn embed(&self, body: &str, request_id: RequestId) -> String {
        format!(r#"{}<img src="{}">"#, body, self.url(request_id))
    }
}

/// Performs send attempts against the transport under a fixed deadline.
#[derive(Clone)]
pub struct Deliverer {
    transport: Arc<dyn Transport>,
    tracking: TrackingPixel,
    send_timeout: Duration,
}

impl Deliverer {
    pub fn new(transport: Arc<dyn Transport>, tracking: TrackingPixel, send_timeout: Duration) -> Self {
        Self {
            transport,
            tracking,
            send_timeout,
        }
    }

    /// Attempt delivery of `request` exactly once.
    ///
    /// Never fails: transport errors and timeouts become `failed`, a
    /// request already cancelled or expired becomes `stopped` without
    /// touching the transport.
    pub async fn deliver(&self, request: &SendRequest) -> DeliveryOutcome {
        if let Some(reason) = request.deadline.interrupted() {
            info!(request_id = request.id, reason = reason, "delivery_stopped");
            return DeliveryOutcome::stopped(request.id, reason);
        }

        let email = OutboundEmail {
            subject: request.subject.clone(),
            body: self.tracking.embed(&request.body, request.id),
            recipients: vec![request.recipient.clone()],
        };

        match timeout(self.send_timeout, self.transport.send(&email)).await {
            Ok(Ok(message_id)) => {
                info!(
                    request_id = request.id,
                    topic = %request.topic,
                    message_id = %message_id,
                    "delivery_sent"
                );
                DeliveryOutcome::sent(request.id, message_id)
            }
            Ok(Err(e)) => {
                warn!(
                    request_id = request.id,
                    topic = %request.topic,
                    error = %e,
                    "delivery_failed"
                );
                DeliveryOutcome::failed(request.id, e.to_string())
            }
            Err(_) => {
                warn!(
                    request_id = request.id,
                    topic = %request.topic,
                    timeout_seconds = self.send_timeout.as_secs_f64(),
                    "delivery_timeout"
                );
                DeliveryOutcome::failed(
                    request.id,
                    format!("send timed out after {:?}", self.send_timeout),
                )
            }
        }
    }
}
