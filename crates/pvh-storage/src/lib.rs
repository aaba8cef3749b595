//! Durable result persistence + retry/backoff machinery for the harvester.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use pvh_core::{ArticleRecord, BatchId};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pvh-storage";

pub const AUDIT_HEADER: &str = "Title,Pageviews,Status\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx responses are worth retrying; every 4xx (bad title, bad encoding,
/// unknown article) is terminal on the first attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Transport-level failures retry; a body that arrived but does not decode
/// will not improve on a second request.
pub fn classify_transport(err: &reqwest::Error) -> RetryDisposition {
    if err.is_decode() {
        RetryDisposition::NonRetryable
    } else if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Retries beyond the first attempt; total attempts = max_retries + 1.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// The capped exponential delay scaled by a random 0.5–1.5 factor, so a
    /// burst of simultaneous failures does not retry in lockstep.
    pub fn jittered_delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.delay_for_attempt(attempt_index)
            .mul_f64(0.5 + fastrand::f64())
    }
}

/// Path-safe artifact file stem for an article title.
///
/// The sanitized title keeps the name readable; the sha256 suffix makes
/// distinct titles collision-free even when sanitization maps them to the
/// same characters. The same title always yields the same stem.
pub fn artifact_stem(title: &str) -> String {
    let mut safe: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    safe.truncate(96);
    let digest = Sha256::digest(title.as_bytes());
    format!("{safe}-{}", hex::encode(&digest[..4]))
}

/// Minimal CSV quoting: fields containing a separator, quote, or newline are
/// wrapped in double quotes with inner quotes doubled.
pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// Artifact write failed; aborts completion of the owning batch only.
    #[error("writing artifact for {title}: {source}")]
    Artifact {
        title: String,
        #[source]
        source: std::io::Error,
    },
    /// Audit append failed; fatal for the run, the durability contract is gone.
    #[error("appending audit row: {0}")]
    Audit(#[from] std::io::Error),
}

/// Durable sink for terminal article records: one JSON artifact per title
/// plus one row in the shared audit file.
///
/// Safe to share across concurrent fetch tasks; audit appends are serialized
/// through a mutex and each row is a single buffered write, so rows never
/// interleave.
pub struct ResultSink {
    artifacts_dir: PathBuf,
    audit: Mutex<fs::File>,
}

impl ResultSink {
    /// Opens the audit file in append mode (writing the header if the file is
    /// new or empty) and ensures the artifacts directory exists.
    pub async fn open(
        artifacts_dir: impl Into<PathBuf>,
        audit_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let artifacts_dir = artifacts_dir.into();
        fs::create_dir_all(&artifacts_dir)
            .await
            .with_context(|| format!("creating artifacts directory {}", artifacts_dir.display()))?;

        let audit_path = audit_path.as_ref();
        let mut audit = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .await
            .with_context(|| format!("opening audit file {}", audit_path.display()))?;
        let len = audit
            .metadata()
            .await
            .with_context(|| format!("inspecting audit file {}", audit_path.display()))?
            .len();
        if len == 0 {
            audit
                .write_all(AUDIT_HEADER.as_bytes())
                .await
                .with_context(|| format!("writing audit header to {}", audit_path.display()))?;
            audit
                .flush()
                .await
                .with_context(|| format!("flushing audit file {}", audit_path.display()))?;
        }

        Ok(Self {
            artifacts_dir,
            audit: Mutex::new(audit),
        })
    }

    /// Persist one terminal record: artifact first, then the audit row.
    pub async fn record(&self, record: &ArticleRecord) -> Result<(), SinkError> {
        self.write_artifact(record).await?;
        self.append_audit_row(record).await
    }

    async fn write_artifact(&self, record: &ArticleRecord) -> Result<(), SinkError> {
        let artifact_error = |source: std::io::Error| SinkError::Artifact {
            title: record.title().to_string(),
            source,
        };

        let body = serde_json::to_vec_pretty(record).map_err(|err| {
            artifact_error(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })?;
        let path = self
            .artifacts_dir
            .join(format!("{}.json", artifact_stem(record.title())));
        let temp_path = self.artifacts_dir.join(format!(".{}.tmp", Uuid::new_v4()));

        write_atomic(&path, &temp_path, &body)
            .await
            .map_err(artifact_error)
    }

    async fn append_audit_row(&self, record: &ArticleRecord) -> Result<(), SinkError> {
        let views = record
            .pageviews()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let line = format!(
            "{},{},{}\n",
            csv_field(record.title()),
            views,
            csv_field(&record.status().audit_label())
        );

        let mut audit = self.audit.lock().await;
        audit.write_all(line.as_bytes()).await?;
        audit.flush().await?;
        Ok(())
    }
}

/// Write bytes to `path` via a temp file + rename so readers never observe a
/// partial artifact. Rewrites of the same title replace the previous file.
async fn write_atomic(path: &Path, temp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    match fs::rename(temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(temp_path).await;
            Err(err)
        }
    }
}

struct CompletionLogInner {
    seen: HashSet<String>,
    file: fs::File,
}

/// Append-only log of fully processed batch ids, read at startup so reruns
/// skip completed work. An id is recorded at most once.
pub struct CompletionLog {
    inner: Mutex<CompletionLogInner>,
}

impl CompletionLog {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let seen: HashSet<String> = match fs::read_to_string(path).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading completion log {}", path.display()))
            }
        };

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening completion log {}", path.display()))?;

        Ok(Self {
            inner: Mutex::new(CompletionLogInner { seen, file }),
        })
    }

    pub async fn contains(&self, id: &BatchId) -> bool {
        self.inner.lock().await.seen.contains(id.as_str())
    }

    /// Append the id, refusing duplicates. Returns whether the id was new.
    pub async fn append(&self, id: &BatchId) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.seen.insert(id.as_str().to_string()) {
            return Ok(false);
        }
        let line = format!("{id}\n");
        inner
            .file
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending {id} to completion log"))?;
        inner
            .file
            .flush()
            .await
            .context("flushing completion log")?;
        Ok(true)
    }
}
