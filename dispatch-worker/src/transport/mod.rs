//! Outbound mail transport.
//!
//! The pipeline only needs one capability from a provider: hand over a
//! message and get back the provider's message id, or an error.

pub mod log;
pub mod mailgun;

use async_trait::async_trait;
use thiserror::Error;

pub use self::log::LogTransport;
pub use mailgun::MailgunTransport;

/// A message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

/// Errors raised by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("provider rate limit exceeded")]
    RateLimited,

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("transport misconfigured: {0}")]
    Config(String),
}

/// The mail-sending capability used by delivery tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message, returning the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError>;
}
