//! Collection run orchestration: batch enumeration, chunked scheduling,
//! bounded fan-out, and checkpointing. Also hosts the dump aggregation and
//! dump download operations that bracket the fetch engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use pvh_core::{ArticleRecord, Batch, BatchId, FetchStatus};
use pvh_storage::{csv_field, BackoffPolicy, CompletionLog, ResultSink, SinkError};
use pvh_wikimedia::{fetch_with_retry, ApiConfig, PageviewSource, RestSource};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pvh-pipeline";

pub const DUMPS_BASE_URL: &str = "https://dumps.wikimedia.org/other/pageviews";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub input_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub audit_path: PathBuf,
    pub completion_log_path: PathBuf,
    pub year: u16,
    /// Budget for simultaneous in-flight work, applied to both concurrent
    /// batches within a chunk and article fetches process-wide.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub api: ApiConfig,
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        let api = ApiConfig {
            user_agent: std::env::var("PVH_USER_AGENT")
                .unwrap_or_else(|_| "pvh-bot/0.1".to_string()),
            timeout: Duration::from_secs(env_parse("PVH_HTTP_TIMEOUT_SECS", 30)),
            ..ApiConfig::default()
        };
        Self {
            input_dir: std::env::var("PVH_INPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./batches")),
            artifacts_dir: std::env::var("PVH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./pageviews")),
            audit_path: std::env::var("PVH_AUDIT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./pageviews.csv")),
            completion_log_path: std::env::var("PVH_COMPLETION_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./completed_batches.log")),
            year: env_parse("PVH_YEAR", 2023),
            concurrency: env_parse("PVH_CONCURRENCY", 50),
            backoff: BackoffPolicy {
                max_retries: env_parse("PVH_MAX_RETRIES", 2),
                ..BackoffPolicy::default()
            },
            api,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    title: String,
}

pub fn batch_id_for(path: &Path) -> BatchId {
    BatchId::new(
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
    )
}

/// Load one batch input: a JSON array of article records carrying at least a
/// `title` field (extra fields are ignored).
pub async fn load_batch(path: &Path) -> Result<Batch> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading batch input {}", path.display()))?;
    let entries: Vec<CatalogEntry> = serde_json::from_str(&text)
        .with_context(|| format!("parsing batch input {}", path.display()))?;
    let id = batch_id_for(path);
    let records = entries
        .into_iter()
        .map(|entry| ArticleRecord::pending(entry.title, id.clone()))
        .collect();
    Ok(Batch { id, records })
}

/// All batch inputs in the directory, sorted; anything that is not a `.json`
/// file is skipped. Failure to list the directory is fatal for the run.
pub fn enumerate_batches(input_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(input_dir)
        .with_context(|| format!("listing batch inputs in {}", input_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum BatchOutcome {
    /// Already present in the completion log; no work performed.
    Skipped,
    /// Every record reached a terminal state and was sunk; the batch id is
    /// now in the completion log.
    Completed(BatchStats),
    /// Input could not be loaded or some artifact writes failed; the batch is
    /// not checkpointed and will be redone wholesale on a future run.
    Aborted(BatchStats),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches_seen: usize,
    pub batches_skipped: usize,
    pub batches_completed: usize,
    pub batches_aborted: usize,
    pub articles_attempted: usize,
    pub articles_succeeded: usize,
    pub articles_failed: usize,
    pub articles_errored: usize,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, batches_seen: usize) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            batches_seen,
            batches_skipped: 0,
            batches_completed: 0,
            batches_aborted: 0,
            articles_attempted: 0,
            articles_succeeded: 0,
            articles_failed: 0,
            articles_errored: 0,
        }
    }

    fn absorb(&mut self, outcome: BatchOutcome) {
        match outcome {
            BatchOutcome::Skipped => self.batches_skipped += 1,
            BatchOutcome::Completed(stats) => {
                self.batches_completed += 1;
                self.absorb_stats(stats);
            }
            BatchOutcome::Aborted(stats) => {
                self.batches_aborted += 1;
                self.absorb_stats(stats);
            }
        }
    }

    fn absorb_stats(&mut self, stats: BatchStats) {
        self.articles_attempted += stats.attempted;
        self.articles_succeeded += stats.succeeded;
        self.articles_failed += stats.failed;
        self.articles_errored += stats.errored;
    }
}

/// The collection engine: enumerates batch inputs, schedules them in chunks,
/// fans out article fetches under the shared concurrency budget, and
/// checkpoints completed batches.
#[derive(Clone)]
pub struct Collector {
    config: CollectorConfig,
    source: Arc<dyn PageviewSource>,
    sink: Arc<ResultSink>,
    log: Arc<CompletionLog>,
    article_permits: Arc<Semaphore>,
}

impl Collector {
    pub async fn new(config: CollectorConfig) -> Result<Self> {
        let source = Arc::new(RestSource::new(config.api.clone())?);
        Self::with_source(config, source).await
    }

    /// Build the collector around an arbitrary source; the seam the tests use
    /// to drive the engine without a network.
    pub async fn with_source(
        config: CollectorConfig,
        source: Arc<dyn PageviewSource>,
    ) -> Result<Self> {
        let sink = Arc::new(ResultSink::open(config.artifacts_dir.clone(), &config.audit_path).await?);
        let log = Arc::new(CompletionLog::open(&config.completion_log_path).await?);
        let article_permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Ok(Self {
            config,
            source,
            sink,
            log,
            article_permits,
        })
    }

    /// Drive the whole run: chunks strictly in sequence, batches within a
    /// chunk concurrently. Returns once every enumerated batch has been
    /// skipped, completed, or aborted.
    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let batch_files = enumerate_batches(&self.config.input_dir)?;
        info!(
            %run_id,
            batches = batch_files.len(),
            year = self.config.year,
            concurrency = self.config.concurrency,
            "starting collection run"
        );

        let mut summary = RunSummary::new(run_id, started_at, batch_files.len());
        let width = self.config.concurrency.max(1);

        for (chunk_index, chunk) in batch_files.chunks(width).enumerate() {
            let batch_permits = Arc::new(Semaphore::new(width));
            let mut tasks: JoinSet<Result<BatchOutcome>> = JoinSet::new();

            for path in chunk {
                let permit = Arc::clone(&batch_permits)
                    .acquire_owned()
                    .await
                    .context("batch admission semaphore closed")?;
                let worker = self.clone();
                let path = path.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    worker.process_batch(&path).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(outcome)) => summary.absorb(outcome),
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => {
                        return Err(join_err).context("batch task failed to complete")
                    }
                }
            }
            debug!(chunk = chunk_index, "chunk complete");
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            completed = summary.batches_completed,
            skipped = summary.batches_skipped,
            aborted = summary.batches_aborted,
            articles = summary.articles_attempted,
            succeeded = summary.articles_succeeded,
            "collection run finished"
        );
        Ok(summary)
    }

    /// Process one batch to its barrier. Per-article failures terminate as
    /// recorded statuses and never abort siblings; only a broken audit or
    /// completion-log append escapes as a run-fatal error.
    async fn process_batch(&self, path: &Path) -> Result<BatchOutcome> {
        let id = batch_id_for(path);
        if self.log.contains(&id).await {
            info!(batch = %id, "batch already complete, skipping");
            return Ok(BatchOutcome::Skipped);
        }

        let batch = match load_batch(path).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(batch = %id, error = %err, "failed to load batch input, leaving for a future run");
                return Ok(BatchOutcome::Aborted(BatchStats::default()));
            }
        };

        let mut tasks: JoinSet<Result<ArticleRecord, SinkError>> = JoinSet::new();
        for mut record in batch.records {
            // Acquire before spawn so saturation holds back task creation
            // instead of piling up waiting tasks.
            let permit = Arc::clone(&self.article_permits)
                .acquire_owned()
                .await
                .context("article admission semaphore closed")?;
            let source = Arc::clone(&self.source);
            let sink = Arc::clone(&self.sink);
            let policy = self.config.backoff;
            let year = self.config.year;
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = fetch_with_retry(source.as_ref(), &policy, record.title(), year).await;
                let applied = record.complete(outcome.pageviews, outcome.status);
                debug_assert!(applied, "fetch pipeline revisited a terminal record");
                sink.record(&record).await?;
                Ok(record)
            });
        }

        let mut stats = BatchStats::default();
        let mut sink_failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(record)) => {
                    stats.attempted += 1;
                    match record.status() {
                        FetchStatus::Success => stats.succeeded += 1,
                        FetchStatus::Failed { .. } => stats.failed += 1,
                        FetchStatus::Error { .. } => stats.errored += 1,
                        FetchStatus::Pending => {}
                    }
                }
                Ok(Err(SinkError::Audit(err))) => {
                    return Err(err).context("appending to the audit file");
                }
                Ok(Err(err @ SinkError::Artifact { .. })) => {
                    warn!(batch = %id, error = %err, "artifact write failed");
                    stats.attempted += 1;
                    sink_failures += 1;
                }
                Err(join_err) => {
                    warn!(batch = %id, error = %join_err, "article task failed to complete");
                    sink_failures += 1;
                }
            }
        }

        if sink_failures > 0 {
            warn!(
                batch = %id,
                failures = sink_failures,
                "batch left incomplete, will be redone on the next run"
            );
            return Ok(BatchOutcome::Aborted(stats));
        }

        self.log.append(&id).await?;
        info!(
            batch = %id,
            articles = stats.attempted,
            succeeded = stats.succeeded,
            "batch complete"
        );
        Ok(BatchOutcome::Completed(stats))
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AggregateSummary {
    pub files_scanned: usize,
    pub articles: usize,
    pub total_views: u64,
}

/// Scan a directory of raw hourly dump files and sum views per article.
///
/// Each dump line is `<project> <title> <count> ...`; lines whose project
/// does not start with `project_prefix` are skipped, as are counts that fail
/// to parse. Plain sequential I/O; no concurrency or retry concerns here.
pub fn aggregate_dumps(
    dump_dir: &Path,
    output_csv: &Path,
    project_prefix: &str,
) -> Result<AggregateSummary> {
    use std::io::{BufRead, BufReader, Write};

    let mut files: Vec<PathBuf> = std::fs::read_dir(dump_dir)
        .with_context(|| format!("listing dump files in {}", dump_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    for path in &files {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening dump file {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            let mut parts = line.split_whitespace();
            let (Some(project), Some(title), Some(raw_views)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if !project.starts_with(project_prefix) {
                continue;
            }
            match raw_views.parse::<u64>() {
                Ok(views) => *totals.entry(title.to_string()).or_default() += views,
                Err(_) => warn!(title, raw = raw_views, "skipping unparseable view count"),
            }
        }
    }

    let mut out = std::fs::File::create(output_csv)
        .with_context(|| format!("creating {}", output_csv.display()))?;
    writeln!(out, "Article,Pageviews").context("writing aggregate header")?;
    for (title, views) in &totals {
        writeln!(out, "{},{}", csv_field(title), views).context("writing aggregate row")?;
    }
    out.flush().context("flushing aggregate output")?;

    Ok(AggregateSummary {
        files_scanned: files.len(),
        articles: totals.len(),
        total_views: totals.values().sum(),
    })
}

/// URL of one hourly dump file under the Wikimedia dumps layout.
pub fn dump_url(base_url: &str, day: NaiveDate, hour: u32) -> String {
    format!(
        "{base_url}/{year}/{year}-{month:02}/pageviews-{year}{month:02}{dom:02}-{hour:02}0000.gz",
        year = day.year(),
        month = day.month(),
        dom = day.day(),
    )
}

/// Download every hourly dump in the inclusive date range into
/// `download_dir`. Missing hours and transport failures are logged and
/// skipped; only local write failures are fatal. Returns the number of files
/// saved.
pub async fn download_dumps(
    client: &reqwest::Client,
    base_url: &str,
    start: NaiveDate,
    end: NaiveDate,
    download_dir: &Path,
) -> Result<usize> {
    tokio::fs::create_dir_all(download_dir)
        .await
        .with_context(|| format!("creating download directory {}", download_dir.display()))?;

    let mut saved = 0usize;
    let mut day = start;
    while day <= end {
        for hour in 0..24 {
            let url = dump_url(base_url, day, hour);
            let file_name = url.rsplit('/').next().unwrap_or("dump.gz").to_string();
            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => match response.bytes().await {
                    Ok(bytes) => {
                        let target = download_dir.join(&file_name);
                        tokio::fs::write(&target, &bytes)
                            .await
                            .with_context(|| format!("writing {}", target.display()))?;
                        saved += 1;
                        info!(file = %file_name, bytes = bytes.len(), "saved dump");
                    }
                    Err(err) => warn!(url = %url, error = %err, "dump body read failed"),
                },
                Ok(response) => {
                    warn!(url = %url, status = %response.status(), "dump not available")
                }
                Err(err) => warn!(url = %url, error = %err, "dump download failed"),
            }
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pvh_storage::RetryDisposition;
    use pvh_wikimedia::AttemptError;
    use reqwest::StatusCode;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Clone, Copy)]
    enum Behavior {
        Views(u64),
        NotFound,
        TransientTwiceThen(u64),
    }

    struct MockSource {
        behaviors: HashMap<String, Behavior>,
        default: Behavior,
        calls: AtomicUsize,
        per_title_calls: Mutex<HashMap<String, u32>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockSource {
        fn new(default: Behavior) -> Self {
            Self {
                behaviors: HashMap::new(),
                default,
                calls: AtomicUsize::new(0),
                per_title_calls: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn with_behavior(mut self, title: &str, behavior: Behavior) -> Self {
            self.behaviors.insert(title.to_string(), behavior);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageviewSource for MockSource {
        async fn fetch_year(&self, title: &str, _year: u16) -> Result<u64, AttemptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let behavior = self
                .behaviors
                .get(title)
                .copied()
                .unwrap_or(self.default);
            match behavior {
                Behavior::Views(views) => Ok(views),
                Behavior::NotFound => Err(AttemptError::Status {
                    code: StatusCode::NOT_FOUND,
                    body: "missing".to_string(),
                }),
                Behavior::TransientTwiceThen(views) => {
                    let mut counts = self.per_title_calls.lock().expect("counts lock");
                    let count = counts.entry(title.to_string()).or_insert(0);
                    *count += 1;
                    if *count <= 2 {
                        Err(AttemptError::Transport {
                            kind: "timeout",
                            message: "simulated timeout".to_string(),
                            disposition: RetryDisposition::Retryable,
                        })
                    } else {
                        Ok(views)
                    }
                }
            }
        }
    }

    fn test_config(root: &Path, concurrency: usize) -> CollectorConfig {
        CollectorConfig {
            input_dir: root.join("batches"),
            artifacts_dir: root.join("artifacts"),
            audit_path: root.join("audit.csv"),
            completion_log_path: root.join("completed.log"),
            year: 2023,
            concurrency,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            api: ApiConfig::default(),
        }
    }

    fn write_batch(input_dir: &Path, name: &str, titles: &[&str]) {
        std::fs::create_dir_all(input_dir).expect("create input dir");
        let entries: Vec<_> = titles
            .iter()
            .map(|title| serde_json::json!({ "title": title }))
            .collect();
        std::fs::write(
            input_dir.join(name),
            serde_json::to_vec(&entries).expect("encode batch"),
        )
        .expect("write batch");
    }

    fn audit_lines(config: &CollectorConfig) -> Vec<String> {
        std::fs::read_to_string(&config.audit_path)
            .expect("read audit")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn full_run_audits_every_title_and_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), 4);
        write_batch(&config.input_dir, "batch_001.json", &["Rust", "Tokio", "Serde"]);
        write_batch(&config.input_dir, "batch_002.json", &["Hyper", "Axum", "Clap"]);

        let mock = Arc::new(MockSource::new(Behavior::Views(5)));
        let collector = Collector::with_source(config.clone(), mock.clone())
            .await
            .expect("collector");
        let summary = collector.run().await.expect("run");

        assert_eq!(summary.batches_seen, 2);
        assert_eq!(summary.batches_completed, 2);
        assert_eq!(summary.articles_attempted, 6);
        assert_eq!(summary.articles_succeeded, 6);
        assert_eq!(mock.calls(), 6);

        let lines = audit_lines(&config);
        assert_eq!(lines[0], "Title,Pageviews,Status");
        assert_eq!(lines.len(), 7);

        let artifacts = std::fs::read_dir(&config.artifacts_dir)
            .expect("read artifacts")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .count();
        assert_eq!(artifacts, 6);

        // Second run with the completion log carried over: no fetches at all.
        let fresh_mock = Arc::new(MockSource::new(Behavior::Views(5)));
        let rerun = Collector::with_source(config.clone(), fresh_mock.clone())
            .await
            .expect("collector");
        let summary = rerun.run().await.expect("rerun");

        assert_eq!(summary.batches_skipped, 2);
        assert_eq!(summary.articles_attempted, 0);
        assert_eq!(fresh_mock.calls(), 0);
        assert_eq!(audit_lines(&config).len(), 7);
    }

    #[tokio::test]
    async fn failing_article_does_not_block_siblings_or_completion() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), 4);
        write_batch(&config.input_dir, "batch_001.json", &["Good_A", "Bad", "Good_B"]);

        let mock = Arc::new(
            MockSource::new(Behavior::Views(9)).with_behavior("Bad", Behavior::NotFound),
        );
        let collector = Collector::with_source(config.clone(), mock)
            .await
            .expect("collector");
        let summary = collector.run().await.expect("run");

        assert_eq!(summary.batches_completed, 1);
        assert_eq!(summary.articles_succeeded, 2);
        assert_eq!(summary.articles_failed, 1);

        let lines = audit_lines(&config);
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().any(|line| line == "Bad,N/A,Failed"));

        let log = std::fs::read_to_string(&config.completion_log_path).expect("read log");
        assert_eq!(log, "batch_001.json\n");
    }

    #[tokio::test]
    async fn transient_articles_retry_to_success() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), 4);
        write_batch(&config.input_dir, "batch_001.json", &["Flaky"]);

        let mock = Arc::new(
            MockSource::new(Behavior::Views(1))
                .with_behavior("Flaky", Behavior::TransientTwiceThen(42)),
        );
        let collector = Collector::with_source(config.clone(), mock.clone())
            .await
            .expect("collector");
        let summary = collector.run().await.expect("run");

        assert_eq!(summary.articles_succeeded, 1);
        assert_eq!(mock.calls(), 3);
        assert!(audit_lines(&config)
            .iter()
            .any(|line| line == "Flaky,42,Success"));
    }

    #[tokio::test]
    async fn concurrency_budget_bounds_in_flight_fetches() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), 2);
        write_batch(
            &config.input_dir,
            "batch_001.json",
            &["A", "B", "C", "D", "E", "F", "G", "H"],
        );

        let mock = Arc::new(MockSource::new(Behavior::Views(1)));
        let collector = Collector::with_source(config, mock.clone())
            .await
            .expect("collector");
        collector.run().await.expect("run");

        assert_eq!(mock.calls(), 8);
        assert!(
            mock.max_in_flight() <= 2,
            "observed {} simultaneous fetches",
            mock.max_in_flight()
        );
    }

    #[tokio::test]
    async fn unreadable_batch_aborts_without_checkpointing() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), 2);
        std::fs::create_dir_all(&config.input_dir).expect("create input dir");
        std::fs::write(config.input_dir.join("batch_001.json"), b"not json").expect("write");

        let mock = Arc::new(MockSource::new(Behavior::Views(1)));
        let collector = Collector::with_source(config.clone(), mock.clone())
            .await
            .expect("collector");
        let summary = collector.run().await.expect("run");

        assert_eq!(summary.batches_aborted, 1);
        assert_eq!(mock.calls(), 0);
        let log = std::fs::read_to_string(&config.completion_log_path).expect("read log");
        assert!(log.is_empty());
    }

    #[test]
    fn enumerate_skips_non_batch_entries() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("batch_002.json"), b"[]").expect("write");
        std::fs::write(dir.path().join("batch_001.json"), b"[]").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"skip me").expect("write");
        std::fs::create_dir(dir.path().join("nested.json")).expect("mkdir");

        let files = enumerate_batches(dir.path()).expect("enumerate");
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["batch_001.json", "batch_002.json"]);
    }

    #[test]
    fn aggregate_sums_per_title_across_files() {
        let dir = tempdir().expect("tempdir");
        let dumps = dir.path().join("dumps");
        std::fs::create_dir_all(&dumps).expect("create dumps dir");
        std::fs::write(
            dumps.join("pageviews-20231001-000000"),
            "en.wikipedia Rust_(programming_language) 10 0\nde.wikipedia Rust 99 0\nen.wikipedia Broken abc 0\n",
        )
        .expect("write dump");
        std::fs::write(
            dumps.join("pageviews-20231001-010000"),
            "en.wikipedia Rust_(programming_language) 25 0\nen.m.wikipedia Tokio 5 0\n",
        )
        .expect("write dump");

        let out = dir.path().join("totals.csv");
        let summary = aggregate_dumps(&dumps, &out, "en").expect("aggregate");

        assert_eq!(summary.files_scanned, 2);
        assert_eq!(summary.articles, 2);
        assert_eq!(summary.total_views, 40);

        let csv = std::fs::read_to_string(&out).expect("read csv");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Article,Pageviews");
        assert!(lines.contains(&"Rust_(programming_language),35"));
        assert!(lines.contains(&"Tokio,5"));
    }

    #[test]
    fn dump_urls_follow_the_dumps_layout() {
        let day = NaiveDate::from_ymd_opt(2023, 10, 5).expect("date");
        assert_eq!(
            dump_url(DUMPS_BASE_URL, day, 7),
            "https://dumps.wikimedia.org/other/pageviews/2023/2023-10/pageviews-20231005-070000.gz"
        );
    }
}
