//! Crawl orchestration: the normalizer that turns mapped raw records
//! into canonical job drafts, the per-source run engine, the adaptive
//! schedule policy, and the cron driver.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rolecall_adapters::{
    adapter_for, field_map_for, validate_source_payload, AdapterError, SourceAdapter, SourcePayload,
};
use rolecall_core::{
    CrawlRun, ExtractionFailure, JobDraft, JobStatus, RawRecord, RunCounts, RunStatus,
    SecretResolver, Source,
};
use rolecall_storage::{ArtifactStore, HttpFetcher, Store, StoreError, UpsertOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rolecall-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source {0} already has a run in flight")]
    AlreadyRunning(Uuid),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("artifact storage failed: {0}")]
    Artifact(#[from] anyhow::Error),
    #[error("registry error: {0}")]
    Registry(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub artifacts_dir: PathBuf,
    pub registry_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub worker_concurrency: usize,
    pub max_interval_days: u32,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            artifacts_dir: std::env::var("ROLECALL_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            registry_path: std::env::var("ROLECALL_REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("ROLECALL_USER_AGENT")
                .unwrap_or_else(|_| "rolecall-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("ROLECALL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("ROLECALL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("ROLECALL_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            worker_concurrency: std::env::var("ROLECALL_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            max_interval_days: std::env::var("ROLECALL_MAX_INTERVAL_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            max_interval_days: self.max_interval_days,
            ..SchedulePolicy::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Registry seeding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourcePayload>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeedSummary {
    pub seeded: usize,
    pub skipped: usize,
    pub invalid: usize,
}

/// Loads the YAML registry and inserts every valid source not already
/// present (matched by URL). Invalid entries are logged and skipped so
/// one bad entry does not block the rest of the file.
pub async fn seed_registry(store: &dyn Store, path: &Path) -> Result<SeedSummary, SyncError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SyncError::Registry(format!("reading {}: {e}", path.display())))?;
    let registry: SourceRegistry = serde_yaml::from_str(&text)
        .map_err(|e| SyncError::Registry(format!("parsing {}: {e}", path.display())))?;

    let mut summary = SeedSummary::default();
    for payload in &registry.sources {
        match validate_source_payload(payload) {
            Ok(source) => {
                if store.find_source_by_url(&source.url).await?.is_some() {
                    summary.skipped += 1;
                    continue;
                }
                info!(org = %source.org_name, url = %source.url, kind = source.kind.as_str(), "seeding source");
                store.insert_source(source).await?;
                summary.seeded += 1;
            }
            Err(err) => {
                warn!(url = %payload.careers_url, %err, "skipping invalid registry entry");
                summary.invalid += 1;
            }
        }
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeIssue {
    #[error("record has no usable title")]
    MissingTitle,
    #[error("source url is not absolute, cannot derive apply url")]
    UnusableSourceUrl,
}

/// Canonical form of an apply URL: resolved against `base` when
/// relative, fragment stripped, query pairs sorted. Scheme and host are
/// lowercased by the parser. Two records canonicalizing to the same
/// string are the same job.
pub fn canonical_apply_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let raw = raw.trim();
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => base?.join(raw).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Some(url.to_string())
}

/// Best-effort timestamp coercion across the formats sources actually
/// emit. Unparseable values become `None`, never a failed record.
pub fn coerce_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

fn text_field(fields: &BTreeMap<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        fields
            .get(*key)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    })
}

fn datetime_field(
    fields: &BTreeMap<String, JsonValue>,
    key: &str,
    notes: &mut Vec<String>,
) -> Option<DateTime<Utc>> {
    let raw = text_field(fields, &[key])?;
    match coerce_datetime(&raw) {
        Some(dt) => Some(dt),
        None => {
            notes.push(format!("unparseable {key} {raw:?} dropped"));
            None
        }
    }
}

/// When a record carries no usable apply URL, a stable synthetic one is
/// derived from the source URL plus a payload content hash so the record
/// still has a dedup identity. Identical payloads map to the same URL
/// across runs.
fn synthetic_apply_url(source_url: &Url, payload: &JsonValue) -> String {
    let digest = hex::encode(Sha256::digest(payload.to_string().as_bytes()));
    let mut url = source_url.clone();
    url.set_fragment(None);
    url.query_pairs_mut().append_pair("rc_item", &digest[..12]);
    url.to_string()
}

/// Turns one mapped record into a canonical draft. Only a missing title
/// rejects the record; every other gap degrades to `None` plus a quality
/// note.
pub fn normalize(
    source: &Source,
    record: &RawRecord,
    fields: &BTreeMap<String, JsonValue>,
) -> Result<JobDraft, NormalizeIssue> {
    let mut notes = Vec::new();

    let title = text_field(fields, &["title"]).ok_or(NormalizeIssue::MissingTitle)?;
    let base = Url::parse(&source.url).map_err(|_| NormalizeIssue::UnusableSourceUrl)?;

    let apply_url = match text_field(fields, &["apply_url", "url", "link"]) {
        Some(raw) => match canonical_apply_url(&raw, Some(&base)) {
            Some(url) => url,
            None => {
                notes.push(format!("apply url {raw:?} unparseable, synthesized identity"));
                synthetic_apply_url(&base, &record.payload)
            }
        },
        None => {
            notes.push("no apply url in record, synthesized identity".to_string());
            synthetic_apply_url(&base, &record.payload)
        }
    };

    let status = match text_field(fields, &["status"]) {
        None => JobStatus::Active,
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "active" | "open" => JobStatus::Active,
            "expired" => JobStatus::Expired,
            "closed" | "filled" => JobStatus::Closed,
            other => {
                notes.push(format!("unknown status {other:?}, treated as active"));
                JobStatus::Active
            }
        },
    };

    Ok(JobDraft {
        source_id: source.id,
        title,
        org_name: text_field(fields, &["org_name"]).unwrap_or_else(|| source.org_name.clone()),
        apply_url,
        description: text_field(fields, &["description", "description_snippet", "body"]),
        location_city: text_field(fields, &["location_city", "city"]),
        location_region: text_field(fields, &["location_region", "region", "state"]),
        location_country: text_field(fields, &["location_country", "country"]),
        posted_at: datetime_field(fields, "posted_at", &mut notes),
        expires_at: datetime_field(fields, "expires_at", &mut notes),
        status,
        quality_notes: notes,
    })
}

/// Maps and normalizes a run's records, collapsing in-run duplicates
/// (same canonical apply URL, first record wins) and converting rejects
/// into persisted extraction failures.
pub fn stage_drafts(
    source: &Source,
    field_map: &BTreeMap<String, String>,
    records: &[RawRecord],
) -> (Vec<JobDraft>, Vec<ExtractionFailure>, u32) {
    let mut drafts = Vec::new();
    let mut failures = Vec::new();
    let mut seen = HashSet::new();
    let mut duplicates = 0u32;

    for record in records {
        let fields = rolecall_adapters::apply_field_map(field_map, record);
        match normalize(source, record, &fields) {
            Ok(draft) => {
                if seen.insert(draft.apply_url.clone()) {
                    drafts.push(draft);
                } else {
                    duplicates += 1;
                }
            }
            Err(issue) => failures.push(ExtractionFailure {
                source_id: source.id,
                url: record.origin_url.clone(),
                selector_or_path: "normalize".to_string(),
                snippet: truncate(&record.payload.to_string(), 500),
                reason: issue.to_string(),
                occurred_at: record.fetched_at,
            }),
        }
    }
    (drafts, failures, duplicates)
}

fn truncate(input: &str, max: usize) -> String {
    if input.len() <= max {
        input.to_string()
    } else {
        let mut end = max;
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        input[..end].to_string()
    }
}

// ---------------------------------------------------------------------------
// Schedule policy
// ---------------------------------------------------------------------------

/// Adaptive crawl cadence. Quiet sources stretch toward the interval
/// cap; failing sources back off exponentially and get flagged for
/// operator attention past the threshold.
#[derive(Debug, Clone, Copy)]
pub struct SchedulePolicy {
    pub max_interval_days: u32,
    pub stretch_cap: f64,
    pub attention_threshold: u32,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            max_interval_days: 30,
            stretch_cap: 4.0,
            attention_threshold: 5,
        }
    }
}

impl SchedulePolicy {
    pub fn next_after_success(&self, interval_days: u32, consecutive_no_change: u32) -> Duration {
        let base = f64::from(interval_days.max(1));
        let factor = (1.0 + 0.5 * f64::from(consecutive_no_change)).min(self.stretch_cap);
        let days = (base * factor).min(f64::from(self.max_interval_days));
        Duration::seconds((days * 86_400.0) as i64)
    }

    pub fn next_after_failure(&self, interval_days: u32, consecutive_failures: u32) -> Duration {
        let base = f64::from(interval_days.max(1));
        let factor = 2f64.powi(consecutive_failures.min(16) as i32);
        let days = (base * factor).min(f64::from(self.max_interval_days));
        Duration::seconds((days * 86_400.0) as i64)
    }

    pub fn needs_attention(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.attention_threshold
    }
}

// ---------------------------------------------------------------------------
// Scheduler / run engine
// ---------------------------------------------------------------------------

pub type AdapterFactory =
    Arc<dyn Fn(rolecall_core::SourceKind, Arc<SecretResolver>) -> Box<dyn SourceAdapter> + Send + Sync>;

/// Aggregate outcome of one `run_due` sweep.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_running: usize,
    pub counts: RunCounts,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    http: Arc<HttpFetcher>,
    artifacts: ArtifactStore,
    secrets: Arc<SecretResolver>,
    policy: SchedulePolicy,
    adapter_factory: AdapterFactory,
    // Guard against two concurrent runs of the same source.
    running: Mutex<HashSet<Uuid>>,
    workers: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

struct RunningGuard<'a> {
    scheduler: &'a Scheduler,
    id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.scheduler
            .running
            .lock()
            .expect("running set lock not poisoned")
            .remove(&self.id);
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        http: Arc<HttpFetcher>,
        artifacts: ArtifactStore,
        secrets: Arc<SecretResolver>,
        policy: SchedulePolicy,
        worker_concurrency: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            http,
            artifacts,
            secrets,
            policy,
            adapter_factory: Arc::new(adapter_for),
            running: Mutex::new(HashSet::new()),
            workers: Arc::new(Semaphore::new(worker_concurrency.max(1))),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_adapter_factory(mut self, factory: AdapterFactory) -> Self {
        self.adapter_factory = factory;
        self
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn is_running(&self, source_id: Uuid) -> bool {
        self.running
            .lock()
            .expect("running set lock not poisoned")
            .contains(&source_id)
    }

    /// Stops new work. Runs in flight finish their current batch; the
    /// store's batch atomicity keeps partial runs consistent.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub async fn run_source(&self, source_id: Uuid) -> Result<CrawlRun, SyncError> {
        self.run_source_inner(source_id, Uuid::new_v4(), false).await
    }

    /// Variant used by callers that hand out the run id before the run
    /// starts (the async trigger endpoint).
    pub async fn run_source_with_id(
        &self,
        source_id: Uuid,
        run_id: Uuid,
    ) -> Result<CrawlRun, SyncError> {
        self.run_source_inner(source_id, run_id, false).await
    }

    /// Re-crawl after a lifecycle restore: soft-deleted rows matching
    /// fresh records come back instead of being skipped.
    pub async fn recrawl_source(&self, source_id: Uuid) -> Result<CrawlRun, SyncError> {
        self.run_source_inner(source_id, Uuid::new_v4(), true).await
    }

    async fn run_source_inner(
        &self,
        source_id: Uuid,
        run_id: Uuid,
        restore_deleted: bool,
    ) -> Result<CrawlRun, SyncError> {
        if self.shutting_down() {
            return Err(SyncError::ShuttingDown);
        }
        {
            let mut running = self.running.lock().expect("running set lock not poisoned");
            if !running.insert(source_id) {
                return Err(SyncError::AlreadyRunning(source_id));
            }
        }
        let _guard = RunningGuard {
            scheduler: self,
            id: source_id,
        };
        let _permit = self
            .workers
            .acquire()
            .await
            .expect("worker semaphore not closed");

        let mut source = self.store.source(source_id).await?;
        let started_at = Utc::now();
        let since = match source.last_run_status {
            Some(RunStatus::Success) => source.last_run_at,
            _ => None,
        };

        let adapter = (self.adapter_factory)(source.kind, Arc::clone(&self.secrets));
        let outcome = self.crawl(adapter.as_ref(), &source, since, restore_deleted).await;
        let finished_at = Utc::now();

        let (status, message, counts, skipped) = match outcome {
            Ok((counts, note, skipped)) => (RunStatus::Success, note, counts, skipped),
            Err(err) => {
                // Error text can embed resolved header or query values.
                let masked = self.secrets.mask_str(&format!("{err:#}"));
                warn!(source_id = %source.id, error = %masked, "crawl run failed");
                (RunStatus::Failed, Some(masked), RunCounts::default(), false)
            }
        };

        source.last_run_at = Some(finished_at);
        source.last_run_status = Some(status);
        source.last_run_message = message.clone();
        match status {
            RunStatus::Success => {
                source.consecutive_failures = 0;
                // A window-skipped run saw nothing, so it says nothing
                // about how quiet the source is.
                if !skipped {
                    if counts.changed() == 0 {
                        source.consecutive_no_change += 1;
                    } else {
                        source.consecutive_no_change = 0;
                    }
                }
                source.next_run_at = finished_at
                    + self
                        .policy
                        .next_after_success(source.crawl_interval_days, source.consecutive_no_change);
            }
            RunStatus::Failed => {
                source.consecutive_failures += 1;
                source.next_run_at = finished_at
                    + self
                        .policy
                        .next_after_failure(source.crawl_interval_days, source.consecutive_failures);
                if self.policy.needs_attention(source.consecutive_failures) {
                    warn!(
                        source_id = %source.id,
                        org = %source.org_name,
                        failures = source.consecutive_failures,
                        "source needs operator attention"
                    );
                }
            }
        }
        source.updated_at = finished_at;
        self.store.update_source(source).await?;

        let run = CrawlRun {
            id: run_id,
            source_id,
            started_at,
            finished_at,
            status,
            message,
            counts,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        };
        self.store.append_run(run.clone()).await?;
        info!(
            source_id = %source_id,
            run_id = %run_id,
            status = ?run.status,
            fetched = counts.fetched,
            created = counts.created,
            updated = counts.updated,
            duplicate_rate = counts.duplicate_rate(),
            "crawl run recorded"
        );
        Ok(run)
    }

    async fn crawl(
        &self,
        adapter: &dyn SourceAdapter,
        source: &Source,
        since: Option<DateTime<Utc>>,
        restore_deleted: bool,
    ) -> anyhow::Result<(RunCounts, Option<String>, bool)> {
        let run = match adapter.fetch(self.http.as_ref(), source, since).await {
            Ok(run) => run,
            Err(err) => {
                // Failed parses still archive what was fetched, so the
                // bytes can be replayed once the extraction is fixed.
                if let AdapterError::Parse { raw, .. } = &err {
                    let fetched_at = Utc::now();
                    for payload in raw {
                        if let Err(store_err) = self
                            .artifacts
                            .store_bytes(source.id, fetched_at, payload.extension, &payload.body)
                            .await
                        {
                            warn!(source_id = %source.id, error = %store_err, "storing artifact for failed run");
                        }
                    }
                }
                return Err(anyhow::Error::new(err).context("adapter fetch"));
            }
        };

        let fetched_at = Utc::now();
        for payload in &run.raw_payloads {
            self.artifacts
                .store_bytes(source.id, fetched_at, payload.extension, &payload.body)
                .await
                .context("storing raw artifact")?;
        }

        let field_map = field_map_for(source).context("resolving field map")?;
        let (drafts, mut failures, duplicates) = stage_drafts(source, &field_map, &run.records);
        failures.extend(run.failures);

        let outcomes = self
            .store
            .upsert_batch(&drafts, restore_deleted)
            .await
            .context("upserting drafts")?;

        let mut counts = RunCounts {
            fetched: run.records.len() as u32,
            failed: failures.len() as u32,
            duplicates,
            ..RunCounts::default()
        };
        for outcome in outcomes {
            match outcome {
                UpsertOutcome::Inserted => counts.created += 1,
                UpsertOutcome::Updated | UpsertOutcome::Restored => counts.updated += 1,
                UpsertOutcome::Unchanged | UpsertOutcome::SkippedDeleted => counts.unchanged += 1,
            }
        }

        if !failures.is_empty() {
            self.store
                .append_extraction_failures(&failures)
                .await
                .context("recording extraction failures")?;
        }

        Ok((counts, run.note, run.skipped))
    }

    /// Runs every source whose `next_run_at` has passed, bounded by the
    /// worker semaphore.
    pub async fn run_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<RunSummary, SyncError> {
        let started_at = Utc::now();
        let due = self.store.due_sources(now).await?;
        let sources_due = due.len();

        let mut set = JoinSet::new();
        for source in due {
            if self.shutting_down() {
                break;
            }
            let scheduler = Arc::clone(self);
            set.spawn(async move { scheduler.run_source(source.id).await });
        }

        let mut summary = RunSummary {
            started_at,
            finished_at: started_at,
            sources_due,
            succeeded: 0,
            failed: 0,
            skipped_running: 0,
            counts: RunCounts::default(),
        };
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(run)) => {
                    match run.status {
                        RunStatus::Success => summary.succeeded += 1,
                        RunStatus::Failed => summary.failed += 1,
                    }
                    summary.counts.fetched += run.counts.fetched;
                    summary.counts.created += run.counts.created;
                    summary.counts.updated += run.counts.updated;
                    summary.counts.unchanged += run.counts.unchanged;
                    summary.counts.failed += run.counts.failed;
                    summary.counts.duplicates += run.counts.duplicates;
                }
                Ok(Err(SyncError::AlreadyRunning(_))) => summary.skipped_running += 1,
                Ok(Err(err)) => {
                    warn!(error = %err, "due run errored");
                    summary.failed += 1;
                }
                Err(err) => {
                    warn!(error = %err, "due run task panicked");
                    summary.failed += 1;
                }
            }
        }
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Wires `run_due` to a cron expression when scheduling is enabled.
    pub async fn build_cron(self: &Arc<Self>, cron: &str) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = Arc::clone(self);
        let job = CronJob::new_async(cron, move |_uuid, _lock| {
            let scheduler = Arc::clone(&scheduler);
            Box::pin(async move {
                if let Err(err) = scheduler.run_due(Utc::now()).await {
                    warn!(error = %err, "scheduled sweep failed");
                }
            })
        })
        .with_context(|| format!("creating cron job for {cron}"))?;
        sched.add(job).await.context("adding cron job")?;
        Ok(sched)
    }
}

/// Sleep helper the CLI uses between manual sweeps in follow mode.
pub async fn pause(duration: StdDuration) {
    tokio::time::sleep(duration).await;
}
