//! SQLite-backed request store using sqlx.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::info;

use super::{Store, StoreError};
use crate::model::{DeliveryOutcome, NewRequest, RequestId, RequestStatus, StatusCounts};

/// Outcomes per multi-row UPDATE statement. Four binds each keeps a chunk
/// well below SQLite's bind parameter limit.
const UPDATE_CHUNK: usize = 500;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS email_requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic_id TEXT NOT NULL,
        message_id TEXT,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL,
        content TEXT NOT NULL,
        status INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_email_requests_topic_id ON email_requests (topic_id)",
    "CREATE INDEX IF NOT EXISTS idx_email_requests_message_id ON email_requests (message_id)",
    "CREATE TABLE IF NOT EXISTS email_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id INTEGER NOT NULL REFERENCES email_requests (id),
        status TEXT NOT NULL,
        raw TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_email_results_request_id ON email_results (request_id)",
];

/// A row of `email_requests` as it currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRequest {
    pub id: RequestId,
    pub topic: String,
    pub recipient: String,
    pub status: RequestStatus,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

/// Request store over a sqlx SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url` and make sure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = SqliteStore { pool };
        store.ensure_schema().await?;
        info!("store_connected");
        Ok(store)
    }

    /// A private in-memory database. Pinned to one connection that never
    /// expires, since every connection would otherwise see its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = SqliteStore { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Look up a single request.
    pub async fn fetch(&self, id: RequestId) -> Result<Option<StoredRequest>, StoreError> {
        let row = sqlx::query(
            "SELECT id, topic_id, recipient, status, message_id, error
             FROM email_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw_status: i64 = row.try_get("status")?;
        let status =
            RequestStatus::from_i64(raw_status).ok_or(StoreError::CorruptStatus(raw_status))?;

        Ok(Some(StoredRequest {
            id: row.try_get("id")?,
            topic: row.try_get("topic_id")?,
            recipient: row.try_get("recipient")?,
            status,
            message_id: row.try_get("message_id")?,
            error: row.try_get("error")?,
        }))
    }

    async fn insert_result(
        &self,
        request_id: RequestId,
        event: &str,
        raw: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO email_results (request_id, status, raw, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(event)
        .bind(raw)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Result events recorded for a request, oldest first, as
    /// `(event, raw payload)`.
    pub async fn results(&self, id: RequestId) -> Result<Vec<(String, Option<String>)>, StoreError> {
        let rows = sqlx::query(
            "SELECT status, raw FROM email_results WHERE request_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("status")?, row.try_get("raw")?)))
            .collect()
    }

    /// Number of open events recorded for a request.
    pub async fn open_count(&self, id: RequestId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM email_results WHERE request_id = ? AND status = 'Open'",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create(&self, request: &NewRequest) -> Result<RequestId, StoreError> {
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO email_requests
                (topic_id, recipient, subject, content, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.topic)
        .bind(&request.recipient)
        .bind(&request.subject)
        .bind(&request.body)
        .bind(RequestStatus::Created.as_i64())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn bulk_update(&self, outcomes: &[DeliveryOutcome]) -> Result<(), StoreError> {
        if outcomes.is_empty() {
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for chunk in outcomes.chunks(UPDATE_CHUNK) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("WITH batch (id, status, message_id, error) AS (");

            query.push_values(chunk, |mut row, outcome| {
                row.push_bind(outcome.request_id())
                    .push_bind(outcome.status().as_i64())
                    .push_bind(outcome.transport_message_id().map(str::to_string))
                    .push_bind(outcome.error_detail().map(str::to_string));
            });

            query.push(
                ") UPDATE email_requests SET status = batch.status, \
                 message_id = batch.message_id, error = batch.error, updated_at = ",
            );
            query.push_bind(now);
            query.push(
                " FROM batch WHERE email_requests.id = batch.id AND email_requests.status = ",
            );
            query.push_bind(RequestStatus::Created.as_i64());

            query.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count_by_status(&self, topic: &str) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM email_requests
             WHERE topic_id = ? GROUP BY status",
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let raw_status: i64 = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status =
                RequestStatus::from_i64(raw_status).ok_or(StoreError::CorruptStatus(raw_status))?;
            counts.add(status, count as u64);
        }
        Ok(counts)
    }

    async fn count_sent_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM email_requests WHERE created_at > ? AND status = ?",
        )
        .bind(since.timestamp_millis())
        .bind(RequestStatus::Sent.as_i64())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn mark_opened(&self, request_id: RequestId) -> Result<(), StoreError> {
        self.insert_result(request_id, "Open", None).await
    }

    async fn record_result(
        &self,
        message_id: &str,
        event: &str,
        raw: &str,
    ) -> Result<Option<RequestId>, StoreError> {
        let request_id: Option<RequestId> =
            sqlx::query_scalar("SELECT id FROM email_requests WHERE message_id = ? LIMIT 1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(request_id) = request_id else {
            return Ok(None);
        };

        self.insert_result(request_id, event, Some(raw)).await?;
        Ok(Some(request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn request(topic: &str, to: &str) -> NewRequest {
        NewRequest::validated(topic, to, "Subject", "<p>Body</p>").unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let store = SqliteStore::in_memory().await.unwrap();
        let first = store.create(&request("t1", "a@example.com")).await.unwrap();
        let second = store.create(&request("t1", "b@example.com")).await.unwrap();
        assert!(second > first);

        let row = store.fetch(first).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Created);
        assert_eq!(row.recipient, "a@example.com");
        assert_eq!(row.message_id, None);
    }

    #[tokio::test]
    async fn test_bulk_update_applies_each_variant() {
        let store = SqliteStore::in_memory().await.unwrap();
        let sent = store.create(&request("t1", "a@example.com")).await.unwrap();
        let failed = store.create(&request("t1", "b@example.com")).await.unwrap();
        let stopped = store.create(&request("t1", "c@example.com")).await.unwrap();

        store
            .bulk_update(&[
                DeliveryOutcome::sent(sent, "mg-123"),
                DeliveryOutcome::failed(failed, "550 mailbox unavailable"),
                DeliveryOutcome::stopped(stopped, "request cancelled"),
            ])
            .await
            .unwrap();

        let row = store.fetch(sent).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Sent);
        assert_eq!(row.message_id.as_deref(), Some("mg-123"));
        assert_eq!(row.error, None);

        let row = store.fetch(failed).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Failed);
        assert_eq!(row.message_id, None);
        assert_eq!(row.error.as_deref(), Some("550 mailbox unavailable"));

        let row = store.fetch(stopped).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Stopped);
    }

    #[tokio::test]
    async fn test_bulk_update_never_moves_status_backwards() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.create(&request("t1", "a@example.com")).await.unwrap();

        store
            .bulk_update(&[DeliveryOutcome::sent(id, "mg-1")])
            .await
            .unwrap();
        store
            .bulk_update(&[DeliveryOutcome::failed(id, "late failure")])
            .await
            .unwrap();

        let row = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Sent);
        assert_eq!(row.message_id.as_deref(), Some("mg-1"));
        assert_eq!(row.error, None);
    }

    #[tokio::test]
    async fn test_bulk_update_spans_multiple_chunks() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut outcomes = Vec::new();
        for i in 0..(UPDATE_CHUNK + 7) {
            let id = store
                .create(&request("bulk", &format!("user{i}@example.com")))
                .await
                .unwrap();
            outcomes.push(DeliveryOutcome::sent(id, format!("mg-{i}")));
        }

        store.bulk_update(&outcomes).await.unwrap();

        let counts = store.count_by_status("bulk").await.unwrap();
        assert_eq!(counts.sent, (UPDATE_CHUNK + 7) as u64);
        assert_eq!(counts.created, 0);
    }

    #[tokio::test]
    async fn test_count_by_status_is_per_topic() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create(&request("t1", "a@example.com")).await.unwrap();
        store.create(&request("t1", "b@example.com")).await.unwrap();
        store.create(&request("t2", "c@example.com")).await.unwrap();
        store
            .bulk_update(&[DeliveryOutcome::failed(a, "nope")])
            .await
            .unwrap();

        let counts = store.count_by_status("t1").await.unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                total: 2,
                created: 1,
                sent: 0,
                failed: 1,
                stopped: 0,
            }
        );
        assert_eq!(store.count_by_status("missing").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_count_sent_since() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create(&request("t1", "a@example.com")).await.unwrap();
        let b = store.create(&request("t1", "b@example.com")).await.unwrap();
        store
            .bulk_update(&[
                DeliveryOutcome::sent(a, "mg-a"),
                DeliveryOutcome::failed(b, "nope"),
            ])
            .await
            .unwrap();

        let hour_ago = Utc::now() - ChronoDuration::hours(1);
        assert_eq!(store.count_sent_since(hour_ago).await.unwrap(), 1);

        let future = Utc::now() + ChronoDuration::hours(1);
        assert_eq!(store.count_sent_since(future).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_result_resolves_message_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.create(&request("t1", "a@example.com")).await.unwrap();
        store
            .bulk_update(&[DeliveryOutcome::sent(id, "20260101.abc@mg.example.com")])
            .await
            .unwrap();

        let resolved = store
            .record_result("20260101.abc@mg.example.com", "delivered", r#"{"event":"delivered"}"#)
            .await
            .unwrap();
        assert_eq!(resolved, Some(id));
        assert_eq!(
            store.results(id).await.unwrap(),
            vec![(
                "delivered".to_string(),
                Some(r#"{"event":"delivered"}"#.to_string())
            )]
        );

        let unknown = store
            .record_result("missing@mg.example.com", "delivered", "{}")
            .await
            .unwrap();
        assert_eq!(unknown, None);
    }

    #[tokio::test]
    async fn test_mark_opened_records_event() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.create(&request("t1", "a@example.com")).await.unwrap();
        store.mark_opened(id).await.unwrap();
        store.mark_opened(id).await.unwrap();
        assert_eq!(store.open_count(id).await.unwrap(), 2);
    }
}
