//! Provider HTTP fetch layer + the SQLite findings archive for Scout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod findings;

pub use findings::{ScoutStore, StoreError};

pub const CRATE_NAME: &str = "scout-storage";

/// Hard ceiling on request attempts per provider call.
pub const MAX_ATTEMPTS: usize = 2;

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
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.clamp(1, MAX_ATTEMPTS)
    }
}

/// Uniform random pause taken before a request to a rate-sensitive provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterWindow {
    pub min: Duration,
    pub max: Duration,
}

impl Default for JitterWindow {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1000),
            max: Duration::from_millis(3500),
        }
    }
}

impl JitterWindow {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn sample(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A GET against a provider endpoint. Query pairs are kept apart from `url`
/// so credentials never reach logs or error messages.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub jitter: Option<JitterWindow>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_jitter(mut self, jitter: Option<JitterWindow>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Fetch with the provider's jitter and retries held under its own permit,
    /// so two calls to one provider never overlap.
    pub async fn fetch(
        &self,
        sweep_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(jitter) = request.jitter {
            let pause = jitter.sample();
            debug!(source_id, pause_ms = pause.as_millis() as u64, "pre-request jitter");
            tokio::time::sleep(pause).await;
        }

        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %sweep_id, source_id, url = %request.url);
        self.send_with_retries(source_id, request).instrument(span).await
    }

    async fn send_with_retries(
        &self,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let attempts = self.backoff.attempts();
        let mut attempt = 0usize;

        loop {
            let is_last = attempt + 1 >= attempts;
            let resp_result = self
                .client
                .get(&request.url)
                .query(&request.query)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let mut final_url = resp.url().clone();
                    final_url.set_query(None);
                    let final_url = final_url.to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && !is_last {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(source_id, status = status.as_u16(), attempt = attempt + 1, "retrying provider request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && !is_last {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(source_id, error = %err, attempt = attempt + 1, "retrying provider request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}
