//! Mailgun HTTP API transport.
//!
//! Messages are posted to `{api_base}/v3/{domain}/messages` as form data.
//! Reference: https://documentation.mailgun.com/docs/mailgun/api-reference/openapi-final/tag/Messages/

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{OutboundEmail, Transport, TransportError};
use crate::config::Config;

/// Retries after a 429 before the rate limit surfaces as an error.
const MAX_RATE_LIMIT_RETRIES: u32 = 2;

/// First backoff when the provider gives no `Retry-After`.
const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Longest we ever wait between two attempts.
const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(2);

/// Success body returned by the messages endpoint.
#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
    #[serde(default)]
    message: String,
}

/// Transport for the Mailgun messages API.
#[derive(Clone)]
pub struct MailgunTransport {
    client: Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl MailgunTransport {
    pub fn new(
        api_base: &str,
        domain: &str,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().pool_max_idle_per_host(100).build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/v3/{}/messages", api_base.trim_end_matches('/'), domain),
            api_key: api_key.into(),
            from: from.into(),
        })
    }

    /// Build the transport from configuration, failing when credentials are
    /// missing.
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let api_key = config
            .mailgun_api_key
            .as_deref()
            .ok_or_else(|| TransportError::Config("MAILGUN_API_KEY is not set".to_string()))?;
        let domain = config
            .mailgun_domain
            .as_deref()
            .ok_or_else(|| TransportError::Config("MAILGUN_DOMAIN is not set".to_string()))?;
        let from = config
            .mail_from
            .clone()
            .unwrap_or_else(|| format!("noreply@{domain}"));

        Self::new(&config.mailgun_api_base, domain, api_key, from)
    }
}

/// Delay requested by the provider, capped.
fn retry_delay(headers: &HeaderMap, attempt: u32) -> Duration {
    let requested = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    requested
        .unwrap_or(RATE_LIMIT_BASE_DELAY * 2u32.pow(attempt))
        .min(RATE_LIMIT_MAX_DELAY)
}

#[async_trait]
impl Transport for MailgunTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let to = email.recipients.join(",");
        let mut attempt = 0;

        loop {
            let response = self
                .client
                .post(&self.endpoint)
                .basic_auth("api", Some(&self.api_key))
                .form(&[
                    ("from", self.from.as_str()),
                    ("to", to.as_str()),
                    ("subject", email.subject.as_str()),
                    ("html", email.body.as_str()),
                ])
                .send()
                .await?;

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= MAX_RATE_LIMIT_RETRIES {
                    return Err(TransportError::RateLimited);
                }
                let delay = retry_delay(response.headers(), attempt);
                warn!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "mailgun_rate_limited"
                );
                sleep(delay).await;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed: SendResponse = response
                .json()
                .await
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

            let message_id = parsed
                .id
                .trim_matches(|c| c == '<' || c == '>')
                .to_string();

            info!(
                message_id = %message_id,
                provider_message = %parsed.message,
                recipients = email.recipients.len(),
                "mailgun_send_accepted"
            );

            return Ok(message_id);
        }
    }
}
