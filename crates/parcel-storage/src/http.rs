//! Rate-limited HTTP fetcher with bounded retry and a per-attempt timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// `max_attempts` counts every request, including the first.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt_index + 1`: base * 2^index, capped.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub attempt_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            user_agent: Some(format!("parcel-overlay/{}", env!("CARGO_PKG_VERSION"))),
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// `capacity` requests up front, then one more every `refill_every`.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(60) / requests,
        }
    }
}

/// Request budget for one source. The fetcher keeps one per source id.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Spends one token, sleeping until the next refill when the bucket is empty.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                (state.last_refill + self.refill_every).saturating_duration_since(now)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Credits whole refills only; the remainder carries over to the next call.
    fn refill(&self, state: &mut TokenBucketState, now: Instant) {
        if self.refill_every.is_zero() {
            state.tokens = self.capacity;
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
        if refills == 0 {
            return;
        }
        let missing = u128::from(self.capacity - state.tokens);
        if refills >= missing {
            state.tokens = self.capacity;
            state.last_refill = now;
        } else {
            // refills < capacity, so it fits in u32.
            state.tokens += refills as u32;
            state.last_refill += self.refill_every * refills as u32;
        }
    }
}

/// One GET request: base URL plus query pairs and extra headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequestSpec {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{url} still failing after {attempts} attempt(s): {last_failure}")]
    Exhausted {
        url: String,
        attempts: usize,
        last_failure: String,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetcher is shutting down")]
    Shutdown,
}

enum AttemptFailure {
    Retryable(String),
    Fatal(FetchError),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    attempt_timeout: Duration,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limit: Option<TokenBucketConfig>,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            attempt_timeout: config.attempt_timeout,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            rate_limit: config.token_bucket,
            buckets: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn token_bucket(&self, source_id: &str) -> Option<Arc<TokenBucket>> {
        let config = self.rate_limit?;
        let mut map = self.buckets.lock().await;
        Some(
            map.entry(source_id.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(config)))
                .clone(),
        )
    }

    pub async fn fetch_json(&self, source_id: &str, spec: &HttpRequestSpec) -> Result<JsonValue, FetchError> {
        let response = self.fetch_bytes(source_id, spec).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, spec: &HttpRequestSpec) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Shutdown)?;

        let bucket = self.token_bucket(source_id).await;

        let span = info_span!("http_fetch", source_id, url = %spec.url);
        self.fetch_with_retry(spec, bucket.as_deref()).instrument(span).await
    }

    async fn fetch_with_retry(
        &self,
        spec: &HttpRequestSpec,
        bucket: Option<&TokenBucket>,
    ) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            if let Some(bucket) = bucket {
                bucket.take().await;
            }

            match self.attempt(spec).await {
                Ok((status, final_url, body)) => {
                    debug!(attempt, %status, bytes = body.len(), "upstream request succeeded");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                        attempts: attempt,
                    });
                }
                Err(AttemptFailure::Fatal(err)) => return Err(err),
                Err(AttemptFailure::Retryable(reason)) => {
                    last_failure = reason;
                    if attempt < max_attempts {
                        let delay = self.backoff.delay_for_attempt(attempt - 1);
                        warn!(
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            reason = %last_failure,
                            "transient upstream failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!(attempts = max_attempts, reason = %last_failure, "upstream retries exhausted");
        Err(FetchError::Exhausted {
            url: spec.url.clone(),
            attempts: max_attempts,
            last_failure,
        })
    }

    async fn attempt(&self, spec: &HttpRequestSpec) -> Result<(StatusCode, String, Vec<u8>), AttemptFailure> {
        let mut request = self.client.get(&spec.url).query(&spec.query);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let exchange = async {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            Ok::<_, reqwest::Error>((status, final_url, body))
        };

        match tokio::time::timeout(self.attempt_timeout, exchange).await {
            Err(_) => Err(AttemptFailure::Retryable(format!(
                "timed out after {}ms",
                self.attempt_timeout.as_millis()
            ))),
            Ok(Err(err)) => match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => Err(AttemptFailure::Retryable(err.to_string())),
                RetryDisposition::NonRetryable => Err(AttemptFailure::Fatal(FetchError::Request(err))),
            },
            Ok(Ok((status, final_url, body))) => {
                if status.is_success() {
                    return Ok((status, final_url, body));
                }
                match classify_status(status) {
                    RetryDisposition::Retryable => Err(AttemptFailure::Retryable(format!("http status {status}"))),
                    RetryDisposition::NonRetryable => Err(AttemptFailure::Fatal(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    })),
                }
            }
        }
    }
}
