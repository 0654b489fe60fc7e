//! JSON-over-HTTP fetches wrapped in the retry policy.

use std::time::Duration;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::retry::{RetryDisposition, RetryPolicy};

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("lotsync/{}", env!("CARGO_PKG_VERSION"))),
            retry: RetryPolicy::production(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            // A truncated body is as transient as a dropped connection.
            Self::Decode { .. } => RetryDisposition::Retryable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
            retry: config.retry,
        })
    }

    /// GET `url` and decode the body as JSON, retrying transient failures.
    pub async fn fetch_json(&self, run_id: Uuid, url: &Url) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", %run_id, path = url.path());
        self.retry
            .run_with(
                url.path(),
                FetchError::disposition,
                None,
                || self.fetch_once(url),
            )
            .instrument(span)
            .await
    }

    async fn fetch_once(&self, url: &Url) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: redact(url),
            });
        }
        let body = resp.bytes().await?;
        debug!(bytes = body.len(), "response received");
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: redact(url),
            source,
        })
    }
}

/// Drop the query string so credentials never reach logs or error text.
fn redact(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn status_errors_classify_through_their_code() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://api.example/changes".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        let err = FetchError::HttpStatus {
            status: 401,
            url: "https://api.example/changes".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn redaction_strips_query_parameters() {
        let url = Url::parse("https://api.example/offers?page=2&api_key=secret").expect("url");
        assert_eq!(redact(&url), "https://api.example/offers");
    }
}
