//! Mailgun webhook signature verification.
//!
//! Mailgun signs every webhook with a hex HMAC-SHA256 of `timestamp + token`
//! keyed by the account's webhook signing key.
//! Reference: https://documentation.mailgun.com/docs/mailgun/user-manual/events/webhooks/#securing-webhooks

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// The `signature` object of a Mailgun webhook body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookSignature {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature fields missing")]
    Missing,

    #[error("invalid signature timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("signature timestamp is {age_seconds}s away from now")]
    Stale { age_seconds: u64 },

    #[error("signature does not match")]
    Mismatch,
}

impl WebhookSignature {
    /// Check the signature against `signing_key`, rejecting timestamps more
    /// than `max_age_seconds` away from `now` in either direction.
    pub fn verify(
        &self,
        signing_key: &str,
        max_age_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        if signing_key.is_empty()
            || self.timestamp.is_empty()
            || self.token.is_empty()
            || self.signature.is_empty()
        {
            return Err(SignatureError::Missing);
        }

        let signed_at: i64 = self
            .timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp(self.timestamp.clone()))?;

        let age_seconds = now.timestamp().abs_diff(signed_at);
        if age_seconds > max_age_seconds {
            return Err(SignatureError::Stale { age_seconds });
        }

        let provided = hex::decode(self.signature.trim()).map_err(|_| SignatureError::Mismatch)?;

        let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(self.timestamp.as_bytes());
        mac.update(self.token.as_bytes());

        // verify_slice compares in constant time.
        mac.verify_slice(&provided)
            .map_err(|_| SignatureError::Mismatch)
    }
}

/// Hex signature Mailgun would send for `timestamp` and `token`.
#[cfg(test)]
pub(crate) fn sign(signing_key: &str, timestamp: &str, token: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes()).unwrap();
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
