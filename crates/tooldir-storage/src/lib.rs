//! HTTP fetch utilities, the shared retry wrapper and the persistent record stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{redirect, Method, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub mod postgres;
pub mod records;
pub mod retry;

pub use postgres::PgRecordStore;
pub use records::{merge_content, ContentWrite, InMemoryRecordStore, RecordStore, StatusChange, StoreError};
pub use retry::{retry_counted, with_retry, Attempted, Backoff, RetryPolicy, Retryable};

pub const CRATE_NAME: &str = "tooldir-storage";

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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_partition_concurrency: usize,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_partition_concurrency: 4,
            max_redirects: 5,
            max_body_bytes: 8 * 1024 * 1024,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.is_zero() {
                return;
            }
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1))
                    .min(u128::from(self.capacity)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }

    /// Full error chain, which is where hyper reports resolver failures.
    pub fn chain_text(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            text.push_str(": ");
            text.push_str(&err.to_string());
            source = err.source();
        }
        text
    }
}

impl Retryable for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::Closed => RetryDisposition::NonRetryable,
        }
    }
}

/// Rate- and concurrency-limited HTTP client. A single request per call; retries belong to callers.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_partition_limit: usize,
    per_partition: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .redirect(redirect::Policy::limited(config.max_redirects));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_partition_limit: config.per_partition_concurrency.max(1),
            per_partition: Mutex::new(HashMap::new()),
            token_bucket,
            max_body_bytes: config.max_body_bytes,
        })
    }

    async fn partition_semaphore(&self, partition: &str) -> Arc<Semaphore> {
        let mut map = self.per_partition.lock().await;
        map.entry(partition.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_partition_limit)))
            .clone()
    }

    /// Issues one request and returns whatever status came back. The body is read up to
    /// the configured cap and the rest is dropped.
    pub async fn request(
        &self,
        partition: &str,
        method: Method,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_partition = self.partition_semaphore(partition).await;
        let _partition = per_partition.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", partition, %method, url);
        async {
            let mut builder = self.client.request(method.clone(), url);
            if let Some(token) = bearer_token {
                builder = builder.bearer_auth(token);
            }
            let mut resp = builder.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            let mut body = Vec::new();
            let mut truncated = false;
            if method != Method::HEAD {
                while let Some(chunk) = resp.chunk().await? {
                    let room = self.max_body_bytes.saturating_sub(body.len());
                    if chunk.len() > room {
                        body.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
            }
            debug!(status = status.as_u16(), bytes = body.len(), truncated, "http response");

            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
                truncated,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_marks_throttling_and_server_errors_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_waits_for_refill_once_drained() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(500));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(10));

        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn fetcher_builds_with_defaults() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("tooldir-test/0.1".into()),
            token_bucket: Some(TokenBucketConfig {
                capacity: 5,
                refill_every: Duration::from_millis(200),
            }),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
