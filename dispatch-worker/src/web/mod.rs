//! HTTP surface: message submission, open tracking, provider result
//! events and delivery counters.

pub mod handlers;
pub mod signature;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    create_messages, health, open_event, result_event, sent_count, topic_counts, AppState,
    CountResponse, CreateMessagesRequest, CreateMessagesResponse, ErrorResponse, HealthResponse,
    ResultEventPayload, ResultEventResponse,
};
pub use signature::{SignatureError, WebhookSignature};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/messages", post(create_messages))
        .route("/v1/events/open", get(open_event))
        .route("/v1/events/results", post(result_event))
        .route("/v1/events/counts/sent", get(sent_count))
        .route("/v1/topics/:topic_id/counts", get(topic_counts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
