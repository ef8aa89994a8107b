//! Shared HTTP client for remote offer feeds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

/// Exponential retry schedule. `max_retries` counts retries, not attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(150),
            max_delay: Duration::from_millis(600),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on in-flight feed requests across all sources.
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            max_in_flight: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed answered {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    /// Transport hiccups, throttling and upstream 5xx are worth another try; the rest is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Closed => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedResponse {
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent.to_owned());
        }

        Ok(Self {
            client: builder.build().context("building feed http client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET a JSON feed, retrying per the backoff policy.
    pub async fn get_bytes(&self, source_id: &str, url: Url) -> Result<FeedResponse, FetchError> {
        let span = info_span!("feed_request", source_id, url = %url);
        async move {
            let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
            let mut retry = 0;
            loop {
                match self.get_once(&url).await {
                    Err(err) if err.is_retryable() && retry < self.backoff.max_retries => {
                        let delay = self.backoff.delay_before_retry(retry);
                        debug!(error = %err, retry, delay_ms = delay.as_millis() as u64, "retrying feed request");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    result => return result,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &Url) -> Result<FeedResponse, FetchError> {
        let resp = self
            .client
            .get(url.clone())
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await?;
        let status = resp.status();
        let url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status { status, url });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FeedResponse { url, body })
    }
}
