//! Wikimedia per-article pageviews source: request building, response
//! parsing, and the bounded retry wrapper around a single fetch.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use pvh_core::FetchStatus;
use pvh_storage::{classify_status, classify_transport, BackoffPolicy, RetryDisposition};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pvh-wikimedia";

/// Error bodies are truncated to this many bytes before being recorded.
const MAX_ERROR_BODY: usize = 512;

const TITLE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_base: String,
    pub project: String,
    pub access: String,
    pub agent: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://wikimedia.org/api/rest_v1/metrics/pageviews/per-article"
                .to_string(),
            project: "en.wikipedia.org".to_string(),
            access: "all-access".to_string(),
            agent: "user".to_string(),
            user_agent: "pvh-bot/0.1".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Monthly-granularity pageviews URL covering one full calendar year.
pub fn article_url(config: &ApiConfig, title: &str, year: u16) -> String {
    let encoded = utf8_percent_encode(title, TITLE_ENCODE_SET);
    format!(
        "{}/{}/{}/{}/{}/monthly/{year}0101/{year}1231",
        config.api_base, config.project, config.access, config.agent, encoded
    )
}

#[derive(Debug, Deserialize)]
pub struct PageviewsResponse {
    pub items: Vec<MonthlyCount>,
}

#[derive(Debug, Deserialize)]
pub struct MonthlyCount {
    pub views: u64,
}

pub fn sum_views(response: &PageviewsResponse) -> u64 {
    response.items.iter().map(|item| item.views).sum()
}

/// Failure of a single fetch attempt, before retry policy is applied.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("http status {code}: {body}")]
    Status { code: StatusCode, body: String },
    #[error("{kind}: {message}")]
    Transport {
        kind: &'static str,
        message: String,
        disposition: RetryDisposition,
    },
    #[error("decoding response body: {message}")]
    Decode { message: String },
}

impl AttemptError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return AttemptError::Decode {
                message: err.to_string(),
            };
        }
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connect"
        } else {
            "transport"
        };
        AttemptError::Transport {
            kind,
            message: err.to_string(),
            disposition: classify_transport(&err),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            AttemptError::Status { code, .. } => classify_status(*code),
            AttemptError::Transport { disposition, .. } => *disposition,
            AttemptError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn into_status(self) -> FetchStatus {
        match self {
            AttemptError::Status { code, body } => FetchStatus::Failed {
                code: code.as_u16(),
                detail: body,
            },
            AttemptError::Transport { kind, message, .. } => FetchStatus::Error {
                kind: kind.to_string(),
                detail: message,
            },
            AttemptError::Decode { message } => FetchStatus::Error {
                kind: "decode".to_string(),
                detail: message,
            },
        }
    }
}

/// One metrics request for one article-year. Implementations must not write
/// shared state; persistence happens downstream of the retry wrapper.
#[async_trait]
pub trait PageviewSource: Send + Sync {
    async fn fetch_year(&self, title: &str, year: u16) -> Result<u64, AttemptError>;
}

/// `PageviewSource` backed by the Wikimedia REST API.
pub struct RestSource {
    client: reqwest::Client,
    config: ApiConfig,
}

impl RestSource {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PageviewSource for RestSource {
    async fn fetch_year(&self, title: &str, year: u16) -> Result<u64, AttemptError> {
        let url = article_url(&self.config, title, year);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(AttemptError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Status {
                code: status,
                body: truncate_body(&body),
            });
        }

        let parsed: PageviewsResponse =
            response.json().await.map_err(AttemptError::from_reqwest)?;
        Ok(sum_views(&parsed))
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Terminal outcome of the fetch-with-retry pipeline for one article.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub pageviews: Option<u64>,
    pub status: FetchStatus,
    pub attempts: u32,
}

/// Run one fetch under the backoff policy. Transient transport failures and
/// 5xx responses are retried with jittered exponential backoff; everything
/// else is terminal on the spot. Never escapes an error: every failure mode
/// becomes a terminal `FetchStatus`.
pub async fn fetch_with_retry<S>(
    source: &S,
    policy: &BackoffPolicy,
    title: &str,
    year: u16,
) -> FetchOutcome
where
    S: PageviewSource + ?Sized,
{
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match source.fetch_year(title, year).await {
            Ok(views) => {
                return FetchOutcome {
                    pageviews: Some(views),
                    status: FetchStatus::Success,
                    attempts,
                }
            }
            Err(err) => {
                let retries_used = (attempts - 1) as usize;
                if err.disposition() == RetryDisposition::Retryable
                    && retries_used < policy.max_retries
                {
                    let delay = policy.jittered_delay_for_attempt(retries_used);
                    debug!(
                        title,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return FetchOutcome {
                    pageviews: None,
                    status: err.into_status(),
                    attempts,
                };
            }
        }
    }
}
