//! Listing storage backends + HTTP fetch utilities for the ingestion pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod listings;
pub mod postgres;
pub mod retry;

pub use listings::{
    BatchSession, ListingQuery, ListingStore, MarketFilter, MarketOverview, MemoryListingStore,
    StorageError, UpsertOutcome, UpsertWriter, DEFAULT_OVERVIEW_DAYS, DEFAULT_QUERY_LIMIT,
    MAX_QUERY_LIMIT,
};
pub use postgres::PgListingStore;
pub use retry::{
    retry_with_backoff, BackoffPolicy, Classify, Clock, ManualClock, RetryDisposition, RetryError,
    TokioClock,
};

pub const CRATE_NAME: &str = "estate-storage";

pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Reads a `Retry-After` value, either delta-seconds or an HTTP-date.
///
/// A date already in the past means "retry now".
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    /// Pause before every request, to stay polite towards listing sites.
    pub request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 3,
            request_delay: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },
}

impl Classify for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus {
                status,
                retry_after,
                ..
            } => match StatusCode::from_u16(*status) {
                Ok(status) => classify_status(status, *retry_after),
                Err(_) => RetryDisposition::NonRetryable,
            },
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    request_delay: Duration,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            request_delay: config.request_delay,
            backoff: config.backoff,
            clock,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// One GET without retries. Non-success statuses become [`FetchError::HttpStatus`].
    pub async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        // The semaphore is never closed, so acquisition only waits.
        let _permit = self.limit.acquire().await.ok();

        if !self.request_delay.is_zero() {
            self.clock.sleep(self.request_delay).await;
        }

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                retry_after,
            });
        }

        let body = resp.bytes().await?.to_vec();
        debug!(url = %final_url, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// GET with the configured bounded retry; returns the last error once retries are spent.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source, url);
        retry_with_backoff(&self.backoff, self.clock.as_ref(), source, |_| self.fetch_once(url))
            .instrument(span)
            .await
            .map_err(RetryError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_many_requests_is_rate_limited() {
        let disposition = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)));
        assert_eq!(
            disposition,
            RetryDisposition::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn server_errors_retry_and_client_errors_do_not() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, None),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, None),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn http_status_errors_classify_through_their_status() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test/koop/amsterdam/p1/".into(),
            retry_after: None,
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_retry_after(" 120 ", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Sun, 01 Mar 2026 09:01:30 GMT", now),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_retry_after("Sun, 01 Mar 2026 08:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-5", now), None);
    }

    #[test]
    fn fetcher_builds_from_default_config() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default(), Arc::new(ManualClock::new()))
            .expect("client");
        assert_eq!(fetcher.backoff().max_attempts, 3);
    }
}
