//! Source fetcher: one GET per source with timeout, status checks and bounded retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use choka_core::SourceKind;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// How often a source request is repeated after a transient failure.
///
/// The wait before retry `n` (0-based) is `first_wait * 2^n`, never more than `max_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub first_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            first_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn wait_before_retry(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|n| 2u32.checked_pow(n))
            .map_or(self.max_wait, |factor| self.first_wait.saturating_mul(factor))
            .min(self.max_wait)
    }

    /// Worst-case time spent waiting between attempts.
    pub fn total_wait(&self) -> Duration {
        (0..self.max_retries)
            .map(|retry| self.wait_before_retry(retry))
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            max_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Network { source, .. } if source.is_timeout())
    }

    /// Worth another attempt within the same cycle: throttling, upstream outages,
    /// dropped connections. Client errors such as 404 repeat identically.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status).is_ok_and(|s| {
                s.is_server_error()
                    || s == StatusCode::TOO_MANY_REQUESTS
                    || s == StatusCode::REQUEST_TIMEOUT
            }),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    retry: RetryPolicy,
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
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(
        &self,
        cycle_id: Uuid,
        source: SourceKind,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %cycle_id, %source, url);
        async {
            // The semaphore is never closed, so acquire only fails if it is dropped.
            let _permit = self.limit.acquire().await.ok();

            let mut retry = 0usize;
            loop {
                match self.get_once(url).await {
                    Ok(resp) => return Ok(resp),
                    Err(err) if err.is_transient() && retry < self.retry.max_retries => {
                        let wait = self.retry.wait_before_retry(retry);
                        debug!(error = %err, retry, wait_ms = wait.as_millis() as u64, "transient fetch failure; retrying");
                        tokio::time::sleep(wait).await;
                        retry += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let network = |source| FetchError::Network {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(network)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await.map_err(network)?.to_vec();
        Ok(FetchedResponse {
            final_url,
            body,
            fetched_at: Utc::now(),
        })
    }
}
