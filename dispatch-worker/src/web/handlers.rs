//! HTTP endpoint handlers.
//!
//! Submissions go through the shared [`Intake`]; read endpoints query the
//! store directly.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::intake::Intake;
use crate::model::{Deadline, RequestId};
use crate::queue::{EmailBatch, EmailMessage};
use crate::store::Store;
use crate::web::signature::WebhookSignature;

/// Window used by the sent counter when `hours` is not given.
const DEFAULT_SENT_WINDOW_HOURS: i64 = 24;

/// 1x1 transparent PNG served by the open-tracking endpoint.
static TRANSPARENT_PIXEL: [u8; 67] = [
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// Default maximum age of a webhook signature.
const DEFAULT_SIGNATURE_MAX_AGE: u64 = 300;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub intake: Intake,
    /// Parent of every HTTP submission's cancellation token.
    pub shutdown: CancellationToken,
    /// Mailgun webhook signing key; result events are not verified when unset.
    pub signing_key: Option<Arc<str>>,
    pub signature_max_age: u64,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, intake: Intake, shutdown: CancellationToken) -> Self {
        Self {
            store,
            intake,
            shutdown,
            signing_key: None,
            signature_max_age: DEFAULT_SIGNATURE_MAX_AGE,
        }
    }

    /// Require signed result events. A blank key leaves verification off.
    pub fn with_signing_key(mut self, signing_key: Option<&str>, max_age_seconds: u64) -> Self {
        self.signing_key = signing_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(Arc::from);
        self.signature_max_age = max_age_seconds;
        self
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Message Submission
// =============================================================================

/// Body of `POST /v1/messages`.
#[derive(Debug, Deserialize)]
pub struct CreateMessagesRequest {
    #[serde(default)]
    pub messages: Vec<EmailMessage>,
    /// Optional expiry applied to every message of the request.
    #[serde(default, rename = "ttlSeconds")]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateMessagesResponse {
    pub count: usize,
    pub accepted: usize,
    pub elapsed: String,
}

/// Submit a batch of emails.
///
/// The body is parsed by hand so malformed JSON gets a JSON error body.
pub async fn create_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let started = Instant::now();

    let request: CreateMessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, body_length = body.len(), "create_messages_invalid_json");
            return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {e}"));
        }
    };

    let expires_at = match request.ttl_seconds {
        None => None,
        Some(ttl) => match started.checked_add(Duration::from_secs(ttl)) {
            Some(at) => Some(at),
            None => {
                warn!(ttl_seconds = ttl, "create_messages_ttl_out_of_range");
                return error_response(StatusCode::BAD_REQUEST, "ttlSeconds out of range");
            }
        },
    };
    let batch = EmailBatch {
        messages: request.messages,
    };

    let shutdown = &state.shutdown;
    let accepted = state
        .intake
        .submit_batch(&batch, || {
            let deadline = Deadline::new(shutdown.child_token());
            match expires_at {
                Some(at) => deadline.with_expiry(at),
                None => deadline,
            }
        })
        .await;

    let elapsed = started.elapsed();
    info!(
        count = batch.messages.len(),
        accepted = accepted,
        elapsed_ms = elapsed.as_millis() as u64,
        "create_messages_complete"
    );

    Json(CreateMessagesResponse {
        count: batch.messages.len(),
        accepted,
        elapsed: format!("{elapsed:?}"),
    })
    .into_response()
}

// =============================================================================
// Open Tracking
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenQuery {
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
}

/// Tracking-pixel endpoint. Always answers with the pixel; the open is
/// recorded in the background.
pub async fn open_event(State(state): State<AppState>, Query(query): Query<OpenQuery>) -> Response {
    match query
        .request_id
        .as_deref()
        .map(|raw| raw.parse::<RequestId>())
    {
        Some(Ok(request_id)) => {
            let store = state.store.clone();
            tokio::spawn(async move {
                match store.mark_opened(request_id).await {
                    Ok(()) => info!(request_id = request_id, "open_recorded"),
                    Err(e) => error!(request_id = request_id, error = %e, "open_record_failed"),
                }
            });
        }
        Some(Err(_)) | None => {
            warn!(request_id = ?query.request_id, "open_event_invalid_request_id");
        }
    }

    (
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        &TRANSPARENT_PIXEL[..],
    )
        .into_response()
}

// =============================================================================
// Provider Result Events
// =============================================================================

/// Mailgun event webhook body.
#[derive(Debug, Deserialize)]
pub struct ResultEventPayload {
    #[serde(default)]
    pub signature: WebhookSignature,
    #[serde(rename = "event-data")]
    pub event_data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ResultEventResponse {
    pub status: &'static str,
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
}

/// Mailgun delivery-result webhook.
///
/// Verifies the signature when a signing key is configured, resolves the
/// provider message id to a request and stores the event with its raw
/// payload.
pub async fn result_event(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: ResultEventPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, body_length = body.len(), "result_event_invalid_json");
            return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {e}"));
        }
    };

    if let Some(signing_key) = &state.signing_key {
        if let Err(e) = payload
            .signature
            .verify(signing_key, state.signature_max_age, Utc::now())
        {
            warn!(error = %e, "result_event_signature_invalid");
            return error_response(StatusCode::UNAUTHORIZED, "invalid signature");
        }
    }

    let event = payload.event_data["event"].as_str();
    let message_id = payload.event_data["message"]["headers"]["message-id"]
        .as_str()
        .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>'));

    let (Some(event), Some(message_id)) = (event, message_id) else {
        warn!(
            has_event = event.is_some(),
            has_message_id = message_id.is_some(),
            "result_event_missing_fields"
        );
        return error_response(StatusCode::BAD_REQUEST, "event and message-id are required");
    };

    let raw = payload.event_data.to_string();
    match state.store.record_result(message_id, event, &raw).await {
        Ok(Some(request_id)) => {
            info!(
                request_id = request_id,
                message_id = %message_id,
                event = %event,
                "result_event_recorded"
            );
            Json(ResultEventResponse {
                status: "recorded",
                request_id,
            })
            .into_response()
        }
        Ok(None) => {
            warn!(message_id = %message_id, event = %event, "result_event_unknown_message");
            error_response(StatusCode::NOT_FOUND, "unknown message id")
        }
        Err(e) => {
            error!(message_id = %message_id, error = %e, "result_event_record_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to record result")
        }
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Status breakdown for one topic.
pub async fn topic_counts(State(state): State<AppState>, Path(topic_id): Path<String>) -> Response {
    match state.store.count_by_status(&topic_id).await {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => {
            error!(topic = %topic_id, error = %e, "topic_counts_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to count requests")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SentCountQuery {
    #[serde(default)]
    pub hours: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Number of requests sent within the last `hours` hours.
pub async fn sent_count(
    State(state): State<AppState>,
    Query(query): Query<SentCountQuery>,
) -> Response {
    let hours = match query.hours.as_deref() {
        None => DEFAULT_SENT_WINDOW_HOURS,
        Some(raw) => match raw.parse::<i64>() {
            Ok(hours) if hours >= 0 => hours,
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("hours must be a non-negative integer, got {raw:?}"),
                );
            }
        },
    };
    let Some(window) = chrono::Duration::try_hours(hours) else {
        return error_response(StatusCode::BAD_REQUEST, "hours out of range");
    };

    let since = Utc::now() - window;
    match state.store.count_sent_since(since).await {
        Ok(count) => Json(CountResponse { count }).into_response(),
        Err(e) => {
            error!(hours = hours, error = %e, "sent_count_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to count sent requests")
        }
    }
}
