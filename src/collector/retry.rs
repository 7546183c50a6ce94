//! Retry classification, backoff, and retry log formatting.

use super::client::TransportError;
use super::config::{DEFAULT_MAX_RETRIES, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Classification of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "status", rename_all = "snake_case")]
pub enum RetryErrorType {
    /// Request timed out
    NetworkTimeout,
    /// Connection refused, DNS failure, TLS failure
    NetworkOffline,
    /// Any other transport failure
    NetworkGeneric,
    /// HTTP 429
    RateLimit,
    /// HTTP 5xx
    ServerError(u16),
    /// HTTP 404
    NotFound,
    /// Any other non-success status
    ClientError(u16),
}

impl RetryErrorType {
    /// Classify a response status. Returns `None` for 2xx.
    pub fn from_status(status: StatusCode) -> Option<Self> {
        if status.is_success() {
            None
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Some(Self::RateLimit)
        } else if status == StatusCode::NOT_FOUND {
            Some(Self::NotFound)
        } else if status.is_server_error() {
            Some(Self::ServerError(status.as_u16()))
        } else {
            Some(Self::ClientError(status.as_u16()))
        }
    }

    /// Classify a transport failure.
    pub fn from_transport(error: &TransportError) -> Self {
        match error {
            TransportError::Timeout(_) => Self::NetworkTimeout,
            TransportError::Connect(_) => Self::NetworkOffline,
            _ => Self::NetworkGeneric,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound | Self::ClientError(_))
    }

    /// Short description for log lines.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::NetworkGeneric => "network error",
            Self::RateLimit => "rate limit exceeded",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::NotFound => "resource not found",
            Self::ClientError(code) => match code {
                401 | 403 => "authentication failed",
                422 => "unprocessable request",
                _ => "client error",
            },
        }
    }
}

impl fmt::Display for RetryErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerError(code) | Self::ClientError(code) => {
                write!(f, "{} ({code})", self.description())
            }
            Self::RateLimit => write!(f, "{} (429)", self.description()),
            Self::NotFound => write!(f, "{} (404)", self.description()),
            _ => f.write_str(self.description()),
        }
    }
}

/// Retry budget and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Ceiling for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Policy with the default delays and a custom retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Policy with custom delays.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Exponential backoff for the given 0-based retry count.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before the next attempt, preferring a server-provided hint.
    pub fn retry_delay(&self, retry_count: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_backoff),
            None => self.backoff(retry_count),
        }
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Parse a `Retry-After` header given in delta-seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Lossy, char-boundary safe truncation of a body for logs.
pub fn truncate_body(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &text[..end])
}

/// Standard retry log line.
pub fn format_retry(
    attempt: u32,
    max_attempts: u32,
    error_type: RetryErrorType,
    backoff: Duration,
    item: &str,
) -> String {
    format!(
        "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds... [item {}]",
        attempt,
        max_attempts,
        error_type,
        backoff.as_secs_f64(),
        item
    )
}

/// Standard retry exhaustion line, used as the skip reason.
pub fn format_exhausted(attempts: u32, error_type: RetryErrorType, body: &str) -> String {
    if body.is_empty() {
        format!("gave up after {attempts} attempts: {error_type}")
    } else {
        format!("gave up after {attempts} attempts: {error_type}: {body}")
    }
}
