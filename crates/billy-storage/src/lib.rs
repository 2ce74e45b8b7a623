//! Catalog persistence + HTTP fetch utilities for Billy.

mod catalog;
mod postgres;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub use catalog::{Attribution, CatalogStore, MemoryCatalog, StoreError, Upserted};
pub use postgres::PgCatalog;

pub const CRATE_NAME: &str = "billy-storage";

const ERROR_BODY_LIMIT: usize = 2048;

/// Drops the query string, which carries API keys for most upstreams.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?…"),
        None => url.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on requests in flight across every adapter sharing this fetcher.
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Unset means no pacing beyond `global_concurrency`.
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Request budget shared by every adapter: `capacity` requests up front, then one more
/// every `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    state: Mutex<Allowance>,
}

#[derive(Debug)]
struct Allowance {
    available: u32,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit: RateLimit {
                capacity: limit.capacity.max(1),
                refill_every: limit.refill_every,
            },
            state: Mutex::new(Allowance {
                available: limit.capacity.max(1),
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until a request may go out and consumes its slot.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut allowance = self.state.lock().await;
                self.refill(&mut allowance);
                if allowance.available > 0 {
                    allowance.available -= 1;
                    return;
                }
                (allowance.refilled_at + self.limit.refill_every)
                    .saturating_duration_since(Instant::now())
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, allowance: &mut Allowance) {
        let period = self.limit.refill_every;
        if period.is_zero() {
            allowance.available = self.limit.capacity;
            return;
        }
        let elapsed = allowance.refilled_at.elapsed();
        let periods = (elapsed.as_nanos() / period.as_nanos()).min(u128::from(u32::MAX)) as u32;
        if periods == 0 {
            return;
        }
        allowance.available = allowance.available.saturating_add(periods).min(self.limit.capacity);
        // Keep the partial period so a steady caller is not slowed by rounding.
        allowance.refilled_at += period * periods;
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        /// Leading bytes of the response body; upstream APIs put their error detail here.
        body: String,
    },
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Request(err) if err.is_timeout())
    }
}

/// Shared HTTP client used by every source adapter.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    rate_limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, label: &str, url: &str) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", label, url = %redact_query(url));
        self.send_with_retry(|| self.client.get(url))
            .instrument(span)
            .await
    }

    pub async fn post_bytes(
        &self,
        label: &str,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_post", label, url = %redact_query(url), bytes = body.len());
        self.send_with_retry(|| {
            self.client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body.clone())
        })
        .instrument(span)
        .await
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<FetchedResponse, HttpError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let mut attempt = 0usize;
        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = redact_query(resp.url().as_str());

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|e| HttpError::Request(e.without_url()))?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp
                        .text()
                        .await
                        .map(|text| text.chars().take(ERROR_BODY_LIMIT).collect())
                        .unwrap_or_default();
                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    let err = err.without_url();
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}
