//! Configuration module for environment variable parsing.
//!
//! Every option is optional; invalid values fall back to the default with a
//! warning so a typo never takes the pipeline down.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::queue::DEFAULT_QUEUE_NAME;

/// Which mail transport the delivery tasks talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Mailgun HTTP API
    Mailgun,
    /// Log-only transport for local development
    Log,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Pipeline
    // =========================================================================
    /// Steady send rate of the dispatcher (sends per second)
    pub rate_per_second: u32,

    /// Deadline for a single transport send attempt
    pub send_timeout: Duration,

    /// Outcome count that triggers an immediate flush
    pub bulk_size: usize,

    /// Interval of the time-based flush
    pub bulk_period: Duration,

    /// Capacity of the in-memory dispatch queue
    pub queue_capacity: usize,

    /// How long shutdown waits for in-flight deliveries before abandoning them
    pub shutdown_grace: Duration,

    // =========================================================================
    // Web Server
    // =========================================================================
    /// Public base URL used in the open-tracking marker
    pub server_host: String,

    /// Port for the web server to listen on
    pub port: u16,

    // =========================================================================
    // Collaborators
    // =========================================================================
    /// sqlx connection string for the request store
    pub database_url: String,

    /// AMQP broker URL; the durable-queue poller only runs when this is set
    pub amqp_url: Option<String>,

    /// Name of the durable queue feeding the dispatch queue
    pub durable_queue_name: String,

    /// Selected mail transport
    pub transport: TransportKind,

    /// Mailgun API base URL
    pub mailgun_api_base: String,

    /// Mailgun API key
    pub mailgun_api_key: Option<String>,

    /// Mailgun sending domain
    pub mailgun_domain: Option<String>,

    /// Sender address used for every outbound email
    pub mail_from: Option<String>,

    /// Mailgun webhook signing key; result events are accepted unsigned when unset
    pub mailgun_signing_key: Option<String>,

    /// Maximum age of a webhook signature timestamp (seconds)
    pub mailgun_signature_max_age: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rate_per_second: 14,
            send_timeout: Duration::from_secs(10),
            bulk_size: 1000,
            bulk_period: Duration::from_secs(10),
            queue_capacity: 1000,
            shutdown_grace: Duration::from_secs(15),
            server_host: "http://localhost:3000".to_string(),
            port: 3000,
            database_url: "sqlite://maildispatch.db?mode=rwc".to_string(),
            amqp_url: None,
            durable_queue_name: DEFAULT_QUEUE_NAME.to_string(),
            transport: TransportKind::Mailgun,
            mailgun_api_base: "https://api.mailgun.net".to_string(),
            mailgun_api_key: None,
            mailgun_domain: None,
            mail_from: None,
            mailgun_signing_key: None,
            mailgun_signature_max_age: 300,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            rate_per_second: parse_positive("EMAIL_RATE", defaults.rate_per_second),

            send_timeout: parse_secs("SEND_TIMEOUT_SECS", defaults.send_timeout),

            bulk_size: parse_positive("BULK_SIZE", defaults.bulk_size),

            bulk_period: parse_secs("BULK_PERIOD_SECS", defaults.bulk_period),

            queue_capacity: parse_positive("QUEUE_CAPACITY", defaults.queue_capacity),

            shutdown_grace: parse_secs("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),

            server_host: env::var("SERVER_HOST")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.server_host),

            port: parse_positive("SERVER_PORT", defaults.port),

            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),

            amqp_url: parse_optional("AMQP_URL"),

            durable_queue_name: env::var("DURABLE_QUEUE_NAME")
                .unwrap_or(defaults.durable_queue_name),

            transport: parse_transport("MAIL_TRANSPORT", defaults.transport),

            mailgun_api_base: env::var("MAILGUN_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.mailgun_api_base),

            mailgun_api_key: parse_optional("MAILGUN_API_KEY"),

            mailgun_domain: parse_optional("MAILGUN_DOMAIN"),

            mail_from: parse_optional("MAIL_FROM"),

            mailgun_signing_key: parse_optional("MAILGUN_SIGNING_KEY"),

            mailgun_signature_max_age: parse_positive(
                "MAILGUN_SIGNATURE_MAX_AGE",
                defaults.mailgun_signature_max_age,
            ),
        }
    }

    /// Interval between two dispatch slots.
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(1) / self.rate_per_second.max(1)
    }
}

/// Parse a strictly positive number, keeping the default on zero or garbage.
fn parse_positive<T>(name: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy,
{
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid positive number, using default");
            default
        }
    }
}

/// Parse a whole number of seconds. Zero is rejected.
fn parse_secs(name: &str, default: Duration) -> Duration {
    let secs = parse_positive(name, default.as_secs());
    Duration::from_secs(secs)
}

/// Read a variable, treating blank values as unset.
fn parse_optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_transport(name: &str, default: TransportKind) -> TransportKind {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "mailgun" => TransportKind::Mailgun,
        "log" => TransportKind::Log,
        _ => {
            warn!(env_var = name, value = %raw, "Unknown mail transport, using default");
            default
        }
    }
}
