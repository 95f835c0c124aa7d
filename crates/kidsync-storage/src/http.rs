//! JSON-over-HTTP client shared by the feed and search adapters.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 is a quota signal for the search APIs, so only server errors retry.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    /// Single attempt. Every issued search request is billed, so those never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let doublings = u32::try_from(attempt_index).unwrap_or(u32::MAX).min(16);
        self.base_delay.saturating_mul(1 << doublings).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
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
        body: String,
    },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }

    /// Error body text for status errors, empty otherwise.
    pub fn body(&self) -> &str {
        match self {
            FetchError::HttpStatus { body, .. } => body,
            _ => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        let client = builder.build().context("building http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url` with query parameters and decode the body as JSON.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_get", url);
        async move {
            let mut attempt = 0;
            loop {
                let mut request = self.client.get(url).query(query);
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }
                match request.send().await {
                    Ok(resp) => match read_json(url, resp).await {
                        Err(FetchError::HttpStatus { status, .. })
                            if self.should_retry_status(status, attempt) =>
                        {
                            warn!(status, attempt, "retrying after server error");
                        }
                        other => return other,
                    },
                    Err(err)
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries =>
                    {
                        warn!(error = %err, attempt, "retrying after transport error");
                    }
                    Err(err) => return Err(FetchError::Request(err)),
                }
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    /// POST a urlencoded form and decode the JSON response. Never retried.
    pub async fn post_form_json(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_post", url);
        async move {
            let resp = self.client.post(url).form(form).send().await?;
            read_json(url, resp).await
        }
        .instrument(span)
        .await
    }

    fn should_retry_status(&self, status: u16, attempt: usize) -> bool {
        let retryable = StatusCode::from_u16(status)
            .map(|s| classify_status(s) == RetryDisposition::Retryable)
            .unwrap_or(false);
        retryable && attempt < self.backoff.max_retries
    }
}

async fn read_json(url: &str, resp: reqwest::Response) -> Result<JsonValue, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
            body,
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}
