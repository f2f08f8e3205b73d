//! Maildispatch - rate-limited email dispatch with batched delivery tracking.
//!
//! Requests arrive over HTTP or from a durable queue, are persisted, and
//! flow through a bounded queue to a dispatcher that starts one delivery
//! per tick of a fixed-rate clock. Every request resolves to exactly one
//! outcome, which the aggregator writes back to the store in bulk.
//!
//! ## Architecture
//!
//! ```text
//! HTTP / durable queue → Intake → DispatchQueue → Dispatcher → Transport
//!                                                     │
//!                                  Store ← Aggregator ← outcomes
//! ```

pub mod config;
pub mod intake;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod transport;
pub mod web;

// Re-export commonly used types
pub use config::{Config, TransportKind};
pub use intake::{Intake, IntakeError};
pub use model::{Deadline, DeliveryOutcome, RequestId, RequestStatus, SendRequest, StatusCounts};
pub use pipeline::{Pipeline, PipelineReport};
pub use queue::{AmqpQueue, DurableQueue, Poller};
pub use store::{SqliteStore, Store, StoreError};
pub use transport::{LogTransport, MailgunTransport, Transport, TransportError};
pub use web::AppState;
