//! Request persistence.
//!
//! Only two points in the process write here: intake creates requests and
//! the result aggregator applies outcome batches. Everything else reads.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{DeliveryOutcome, NewRequest, RequestId, StatusCounts};

pub use sqlite::SqliteStore;

/// Errors raised by a [`Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown status value {0} in store")]
    CorruptStatus(i64),
}

/// Durable store keyed by request id.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new request with status `created` and return its id.
    async fn create(&self, request: &NewRequest) -> Result<RequestId, StoreError>;

    /// Apply a batch of outcomes atomically.
    ///
    /// Only requests still in `created` are updated, so applying the same
    /// outcome twice is a no-op.
    async fn bulk_update(&self, outcomes: &[DeliveryOutcome]) -> Result<(), StoreError>;

    async fn count_by_status(&self, topic: &str) -> Result<StatusCounts, StoreError>;

    /// Number of requests created after `since` that were sent.
    async fn count_sent_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Record an open event for a request.
    async fn mark_opened(&self, request_id: RequestId) -> Result<(), StoreError>;

    /// Record a provider result event against the request sent with
    /// `message_id`. Returns `None` when no request carries that id.
    async fn record_result(
        &self,
        message_id: &str,
        event: &str,
        raw: &str,
    ) -> Result<Option<RequestId>, StoreError>;
}
