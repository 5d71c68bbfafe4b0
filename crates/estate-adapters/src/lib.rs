//! Listing source contracts, raw record normalization and source implementations.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_storage::{Classify, FetchError, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub mod html;
pub mod mock;
pub mod normalize;

pub use html::{parse_search_page, HtmlListingSource, HtmlSourceConfig};
pub use mock::{GeneratorConfig, LocationProfile, MockListingGenerator};
pub use normalize::normalize;

pub const CRATE_NAME: &str = "estate-adapters";

/// A scraped or generated record before normalization: arbitrary keys, mixed encodings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, JsonValue>);

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// First non-null value among `keys`.
    pub fn first_of(&self, keys: &[&str]) -> Option<&JsonValue> {
        keys.iter().find_map(|key| self.get(key))
    }

    /// First value among `keys` rendered as trimmed, non-empty text.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| match self.get(key)? {
            JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, JsonValue>> for RawRecord {
    fn from(value: Map<String, JsonValue>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientCause {
    Timeout,
    Connect,
    ServerError(u16),
    RateLimited { retry_after: Option<Duration> },
    Other(String),
}

impl fmt::Display for TransientCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientCause::Timeout => f.write_str("timeout"),
            TransientCause::Connect => f.write_str("connection failed"),
            TransientCause::ServerError(status) => write!(f, "server error {status}"),
            TransientCause::RateLimited { retry_after: Some(d) } => {
                write!(f, "rate limited (retry after {}s)", d.as_secs())
            }
            TransientCause::RateLimited { retry_after: None } => f.write_str("rate limited"),
            TransientCause::Other(msg) => f.write_str(msg),
        }
    }
}

/// Transient failures mean "source is down"; permanent ones mean "source changed shape".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("transient source failure: {0}")]
    Transient(TransientCause),
    #[error("permanent source failure: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl Classify for SourceError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            SourceError::Transient(TransientCause::RateLimited { retry_after }) => {
                RetryDisposition::RateLimited {
                    retry_after: *retry_after,
                }
            }
            SourceError::Transient(_) => RetryDisposition::Retryable,
            SourceError::Permanent(_) => RetryDisposition::NonRetryable,
        }
    }
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match (&err, err.disposition()) {
            (_, RetryDisposition::RateLimited { retry_after }) => {
                SourceError::Transient(TransientCause::RateLimited { retry_after })
            }
            (_, RetryDisposition::NonRetryable) => SourceError::Permanent(err.to_string()),
            (FetchError::HttpStatus { status, .. }, RetryDisposition::Retryable) => {
                SourceError::Transient(TransientCause::ServerError(*status))
            }
            (FetchError::Request(inner), RetryDisposition::Retryable) if inner.is_timeout() => {
                SourceError::Transient(TransientCause::Timeout)
            }
            (FetchError::Request(inner), RetryDisposition::Retryable) if inner.is_connect() => {
                SourceError::Transient(TransientCause::Connect)
            }
            (FetchError::Request(_), RetryDisposition::Retryable) => {
                SourceError::Transient(TransientCause::Other(err.to_string()))
            }
        }
    }
}

/// An external listing source. Implementations return raw records; callers normalize.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source(&self) -> &str;

    /// Cheap reachability check, retried by the caller.
    async fn probe(&self) -> Result<(), SourceError>;

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawRecord>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_accepts_strings_and_numbers() {
        let record = RawRecord::new()
            .with("id", 4711)
            .with("address", "  Damrak 1 ")
            .with("city", "")
            .with("price", JsonValue::Null);

        assert_eq!(record.text(&["source_id", "id"]).as_deref(), Some("4711"));
        assert_eq!(record.text(&["address"]).as_deref(), Some("Damrak 1"));
        assert_eq!(record.text(&["city"]), None);
        assert!(record.first_of(&["price"]).is_none());
    }

    #[test]
    fn raw_records_round_trip_as_plain_json_objects() {
        let value = json!({"source_id": "a1", "price": "€ 425.000 k.k."});
        let record: RawRecord = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(serde_json::to_value(&record).unwrap(), value);
    }

    #[test]
    fn status_errors_map_onto_the_source_taxonomy() {
        let limited = SourceError::from(FetchError::HttpStatus {
            status: 429,
            url: "https://example.test".into(),
            retry_after: None,
        });
        assert_eq!(
            limited,
            SourceError::Transient(TransientCause::RateLimited { retry_after: None })
        );

        let down = SourceError::from(FetchError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
            retry_after: None,
        });
        assert_eq!(down, SourceError::Transient(TransientCause::ServerError(503)));

        let gone = SourceError::from(FetchError::HttpStatus {
            status: 404,
            url: "https://example.test".into(),
            retry_after: None,
        });
        assert!(!gone.is_transient());
        assert_eq!(gone.disposition(), RetryDisposition::NonRetryable);
    }
}
