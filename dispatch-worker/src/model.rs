//! Core pipeline records: send requests, their deadline context, and the
//! outcome every request eventually resolves to.

use std::fmt;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identifier assigned by the store when a request is created.
pub type RequestId = i64;

/// Persisted lifecycle of a request.
///
/// Stored as an integer; the only legal transitions are from `Created` to
/// one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Created = 0,
    Sent = 1,
    Failed = 2,
    Stopped = 3,
}

impl RequestStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(RequestStatus::Created),
            1 => Some(RequestStatus::Sent),
            2 => Some(RequestStatus::Failed),
            3 => Some(RequestStatus::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Created => "created",
            RequestStatus::Sent => "sent",
            RequestStatus::Failed => "failed",
            RequestStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A validated email ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub topic: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl NewRequest {
    /// Returns `None` when any of recipient, subject or body is empty.
    pub fn validated(topic: &str, recipient: &str, subject: &str, body: &str) -> Option<Self> {
        if recipient.is_empty() || subject.is_empty() || body.is_empty() {
            return None;
        }

        Some(NewRequest {
            topic: topic.to_string(),
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        })
    }
}

/// Cancellation signal plus optional expiry carried by every request.
#[derive(Debug, Clone)]
pub struct Deadline {
    cancel: CancellationToken,
    expires_at: Option<Instant>,
}

impl Deadline {
    pub fn new(cancel: CancellationToken) -> Self {
        Deadline {
            cancel,
            expires_at: None,
        }
    }

    /// A deadline nobody will ever cancel.
    pub fn none() -> Self {
        Deadline::new(CancellationToken::new())
    }

    pub fn with_expiry(mut self, expires_at: Instant) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Why the request must not be sent, if it has already been cancelled
    /// or has expired.
    pub fn interrupted(&self) -> Option<&'static str> {
        if self.cancel.is_cancelled() {
            return Some("request cancelled");
        }
        match self.expires_at {
            Some(at) if Instant::now() >= at => Some("request deadline exceeded"),
            _ => None,
        }
    }
}

/// An email that has been persisted and is waiting in the dispatch queue.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub id: RequestId,
    pub topic: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub deadline: Deadline,
}

impl SendRequest {
    pub fn new(id: RequestId, request: NewRequest, deadline: Deadline) -> Self {
        SendRequest {
            id,
            topic: request.topic,
            recipient: request.recipient,
            subject: request.subject,
            body: request.body,
            deadline,
        }
    }
}

/// How one delivery attempt ended.
///
/// Each variant carries only the fields that are meaningful for it, so a
/// failed outcome has no message id to read by mistake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent {
        request_id: RequestId,
        transport_message_id: String,
    },
    Failed {
        request_id: RequestId,
        error: String,
    },
    Stopped {
        request_id: RequestId,
        error: String,
    },
}

impl DeliveryOutcome {
    pub fn sent(request_id: RequestId, transport_message_id: impl Into<String>) -> Self {
        DeliveryOutcome::Sent {
            request_id,
            transport_message_id: transport_message_id.into(),
        }
    }

    pub fn failed(request_id: RequestId, error: impl Into<String>) -> Self {
        DeliveryOutcome::Failed {
            request_id,
            error: error.into(),
        }
    }

    pub fn stopped(request_id: RequestId, error: impl Into<String>) -> Self {
        DeliveryOutcome::Stopped {
            request_id,
            error: error.into(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            DeliveryOutcome::Sent { request_id, .. }
            | DeliveryOutcome::Failed { request_id, .. }
            | DeliveryOutcome::Stopped { request_id, .. } => *request_id,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            DeliveryOutcome::Sent { .. } => RequestStatus::Sent,
            DeliveryOutcome::Failed { .. } => RequestStatus::Failed,
            DeliveryOutcome::Stopped { .. } => RequestStatus::Stopped,
        }
    }

    pub fn transport_message_id(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::Sent {
                transport_message_id,
                ..
            } => Some(transport_message_id),
            _ => None,
        }
    }

    pub fn error_detail(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::Failed { error, .. } | DeliveryOutcome::Stopped { error, .. } => {
                Some(error)
            }
            DeliveryOutcome::Sent { .. } => None,
        }
    }
}

/// Per-topic request counts, grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub created: u64,
    pub sent: u64,
    pub failed: u64,
    pub stopped: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: RequestStatus, count: u64) {
        match status {
            RequestStatus::Created => self.created += count,
            RequestStatus::Sent => self.sent += count,
            RequestStatus::Failed => self.failed += count,
            RequestStatus::Stopped => self.stopped += count,
        }
        self.total += count;
    }

    /// Requests that reached a terminal status.
    pub fn resolved(&self) -> u64 {
        self.sent + self.failed + self.stopped
    }
}
