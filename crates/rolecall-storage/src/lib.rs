//! Record store seam, immutable raw-artifact storage, and HTTP fetch
//! utilities (timeouts, retry classification, bounded concurrency).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rolecall_core::{
    CrawlRun, DeletionAudit, ExtractionFailure, Job, JobDraft, SoftDelete, Source,
};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rolecall-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source {0} not found")]
    SourceNotFound(Uuid),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("source with url {0} already exists")]
    DuplicateSource(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Result of reconciling one normalized candidate against storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// Row exists but is soft-deleted and restoration was not requested;
    /// the marker is left untouched.
    SkippedDeleted,
    Restored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub total: u64,
    pub active: u64,
    pub deleted: u64,
}

/// Storage contract shared by ingestion and lifecycle. Implementations
/// must serialize the lookup-then-write sequence for a given
/// `(source_id, apply_url)` identity.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_source(&self, source: Source) -> Result<(), StoreError>;
    async fn source(&self, id: Uuid) -> Result<Source, StoreError>;
    async fn find_source_by_url(&self, url: &str) -> Result<Option<Source>, StoreError>;
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;
    async fn due_sources(&self, now: DateTime<Utc>) -> Result<Vec<Source>, StoreError>;
    async fn update_source(&self, source: Source) -> Result<(), StoreError>;

    /// Applies a batch of normalized candidates atomically: either every
    /// draft in the batch is reconciled or none is.
    async fn upsert_batch(
        &self,
        drafts: &[JobDraft],
        restore_deleted: bool,
    ) -> Result<Vec<UpsertOutcome>, StoreError>;
    async fn find_job(&self, source_id: Uuid, apply_url: &str)
        -> Result<Option<Job>, StoreError>;
    /// Active (non-deleted) jobs only. Every consumer-facing read path
    /// goes through here so the soft-delete filter cannot be forgotten.
    async fn list_active_jobs(
        &self,
        source_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;
    async fn job_counts(&self, source_id: Uuid) -> Result<JobCounts, StoreError>;
    async fn job_ids_for_source(
        &self,
        source_id: Uuid,
        include_deleted: bool,
    ) -> Result<Vec<Uuid>, StoreError>;
    async fn jobs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>, StoreError>;
    async fn soft_delete_jobs(
        &self,
        ids: &[Uuid],
        marker: &SoftDelete,
    ) -> Result<usize, StoreError>;
    async fn remove_jobs(&self, ids: &[Uuid]) -> Result<usize, StoreError>;
    async fn restore_jobs(&self, source_id: Uuid) -> Result<usize, StoreError>;
    /// Rows in dependent tables (saved lists, application history) that
    /// reference a job owned by this source.
    async fn dependent_count(&self, source_id: Uuid) -> Result<u64, StoreError>;
    async fn add_job_reference(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn append_run(&self, run: CrawlRun) -> Result<(), StoreError>;
    async fn run(&self, id: Uuid) -> Result<Option<CrawlRun>, StoreError>;
    async fn runs_for_source(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CrawlRun>, StoreError>;
    async fn append_audit(&self, audit: DeletionAudit) -> Result<(), StoreError>;
    async fn audits_for_source(&self, source_id: Uuid) -> Result<Vec<DeletionAudit>, StoreError>;

    async fn append_extraction_failures(
        &self,
        failures: &[ExtractionFailure],
    ) -> Result<(), StoreError>;
    async fn extraction_failures_for_source(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExtractionFailure>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    sources: HashMap<Uuid, Source>,
    jobs: HashMap<Uuid, Job>,
    // dedup identity index: (source_id, canonical apply URL) -> job id
    identity: HashMap<(Uuid, String), Uuid>,
    job_refs: HashMap<Uuid, u64>,
    runs: Vec<CrawlRun>,
    audits: Vec<DeletionAudit>,
    failures: Vec<ExtractionFailure>,
}

/// In-memory store. The single `RwLock` write section around
/// `upsert_batch` is what serializes concurrent lookup-then-write on the
/// same identity pair.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn apply_draft(existing: &mut Job, draft: &JobDraft, now: DateTime<Utc>) -> bool {
        let changed = existing.title != draft.title
            || existing.org_name != draft.org_name
            || existing.description != draft.description
            || existing.location_city != draft.location_city
            || existing.location_region != draft.location_region
            || existing.location_country != draft.location_country
            || existing.posted_at != draft.posted_at
            || existing.expires_at != draft.expires_at
            || existing.status != draft.status;
        if changed {
            existing.title = draft.title.clone();
            existing.org_name = draft.org_name.clone();
            existing.description = draft.description.clone();
            existing.location_city = draft.location_city.clone();
            existing.location_region = draft.location_region.clone();
            existing.location_country = draft.location_country.clone();
            existing.posted_at = draft.posted_at;
            existing.expires_at = draft.expires_at;
            existing.status = draft.status;
            existing.quality_notes = draft.quality_notes.clone();
            existing.updated_at = now;
        }
        changed
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_source(&self, source: Source) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.sources.values().any(|s| s.url == source.url) {
            return Err(StoreError::DuplicateSource(source.url));
        }
        inner.sources.insert(source.id, source);
        Ok(())
    }

    async fn source(&self, id: Uuid) -> Result<Source, StoreError> {
        self.inner
            .read()
            .unwrap()
            .sources
            .get(&id)
            .cloned()
            .ok_or(StoreError::SourceNotFound(id))
    }

    async fn find_source_by_url(&self, url: &str) -> Result<Option<Source>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .sources
            .values()
            .find(|s| s.url == url)
            .cloned())
    }

    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let mut sources: Vec<_> = self.inner.read().unwrap().sources.values().cloned().collect();
        sources.sort_by_key(|s| s.created_at);
        Ok(sources)
    }

    async fn due_sources(&self, now: DateTime<Utc>) -> Result<Vec<Source>, StoreError> {
        let mut due: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .sources
            .values()
            .filter(|s| s.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn update_source(&self, source: Source) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.sources.contains_key(&source.id) {
            return Err(StoreError::SourceNotFound(source.id));
        }
        inner.sources.insert(source.id, source);
        Ok(())
    }

    async fn upsert_batch(
        &self,
        drafts: &[JobDraft],
        restore_deleted: bool,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let mut outcomes = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let key = (draft.source_id, draft.apply_url.clone());
            let outcome = match inner.identity.get(&key).copied() {
                Some(job_id) => {
                    let job = inner
                        .jobs
                        .get_mut(&job_id)
                        .ok_or(StoreError::JobNotFound(job_id))?;
                    if job.is_deleted() {
                        if restore_deleted {
                            job.soft_delete = None;
                            Self::apply_draft(job, draft, now);
                            job.updated_at = now;
                            UpsertOutcome::Restored
                        } else {
                            UpsertOutcome::SkippedDeleted
                        }
                    } else if Self::apply_draft(job, draft, now) {
                        UpsertOutcome::Updated
                    } else {
                        UpsertOutcome::Unchanged
                    }
                }
                None => {
                    let job = Job {
                        id: Uuid::new_v4(),
                        source_id: draft.source_id,
                        title: draft.title.clone(),
                        org_name: draft.org_name.clone(),
                        apply_url: draft.apply_url.clone(),
                        description: draft.description.clone(),
                        location_city: draft.location_city.clone(),
                        location_region: draft.location_region.clone(),
                        location_country: draft.location_country.clone(),
                        posted_at: draft.posted_at,
                        expires_at: draft.expires_at,
                        status: draft.status,
                        soft_delete: None,
                        quality_notes: draft.quality_notes.clone(),
                        created_at: now,
                        updated_at: now,
                    };
                    inner.identity.insert(key, job.id);
                    inner.jobs.insert(job.id, job);
                    UpsertOutcome::Inserted
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn find_job(
        &self,
        source_id: Uuid,
        apply_url: &str,
    ) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .identity
            .get(&(source_id, apply_url.to_string()))
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn list_active_jobs(
        &self,
        source_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| !j.is_deleted())
            .filter(|j| source_id.map_or(true, |id| j.source_id == id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn job_counts(&self, source_id: Uuid) -> Result<JobCounts, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut counts = JobCounts::default();
        for job in inner.jobs.values().filter(|j| j.source_id == source_id) {
            counts.total += 1;
            if job.is_deleted() {
                counts.deleted += 1;
            } else {
                counts.active += 1;
            }
        }
        Ok(counts)
    }

    async fn job_ids_for_source(
        &self,
        source_id: Uuid,
        include_deleted: bool,
    ) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.source_id == source_id)
            .filter(|j| include_deleted || !j.is_deleted())
            .map(|j| (j.created_at, j.id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn jobs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .cloned()
            .collect())
    }

    async fn soft_delete_jobs(
        &self,
        ids: &[Uuid],
        marker: &SoftDelete,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut affected = 0;
        for id in ids {
            if let Some(job) = inner.jobs.get_mut(id) {
                if job.soft_delete.is_none() {
                    job.soft_delete = Some(marker.clone());
                    job.updated_at = marker.deleted_at;
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn remove_jobs(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut affected = 0;
        for id in ids {
            if let Some(job) = inner.jobs.remove(id) {
                inner.identity.remove(&(job.source_id, job.apply_url));
                inner.job_refs.remove(id);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn restore_jobs(&self, source_id: Uuid) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let mut affected = 0;
        for job in inner
            .jobs
            .values_mut()
            .filter(|j| j.source_id == source_id && j.is_deleted())
        {
            job.soft_delete = None;
            job.updated_at = now;
            affected += 1;
        }
        Ok(affected)
    }

    async fn dependent_count(&self, source_id: Uuid) -> Result<u64, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.source_id == source_id)
            .filter_map(|j| inner.job_refs.get(&j.id))
            .sum())
    }

    async fn add_job_reference(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.jobs.contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }
        *inner.job_refs.entry(job_id).or_insert(0) += 1;
        Ok(())
    }

    async fn append_run(&self, run: CrawlRun) -> Result<(), StoreError> {
        self.inner.write().unwrap().runs.push(run);
        Ok(())
    }

    async fn run(&self, id: Uuid) -> Result<Option<CrawlRun>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .runs
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn runs_for_source(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CrawlRun>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut runs: Vec<_> = inner
            .runs
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn append_audit(&self, audit: DeletionAudit) -> Result<(), StoreError> {
        self.inner.write().unwrap().audits.push(audit);
        Ok(())
    }

    async fn audits_for_source(&self, source_id: Uuid) -> Result<Vec<DeletionAudit>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .audits
            .iter()
            .filter(|a| a.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn append_extraction_failures(
        &self,
        failures: &[ExtractionFailure],
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .unwrap()
            .failures
            .extend_from_slice(failures);
        Ok(())
    }

    async fn extraction_failures_for_source(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExtractionFailure>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<_> = inner
            .failures
            .iter()
            .filter(|f| f.source_id == source_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        out.truncate(limit);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Raw artifact store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed immutable storage for fetched payloads, kept so
/// per-item extraction failures can be replayed against the exact bytes
/// a crawl saw.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn relative_path(
        source_id: Uuid,
        fetched_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source_id.to_string())
            .join(stamp)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Stores bytes under a hash-addressed path via atomic temp-file
    /// rename; identical content re-stored in the same second is a no-op.
    pub async fn store_bytes(
        &self,
        source_id: Uuid,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(source_id, fetched_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .context("artifact path always has a parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch utilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are transient; every other non-success status is a
/// permanent failure and must not be retried.
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
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
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
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A fully built request the fetcher can replay across retry attempts.
/// Auth material lands here only after secret resolution.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub basic_auth: Option<(String, Option<String>)>,
    pub form: Option<Vec<(String, String)>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            basic_auth: None,
            form: None,
        }
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
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Permanent failures (4xx other than 429, schema-level rejects)
    /// should not be retried by callers either.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => {
                classify_reqwest_error(err) == RetryDisposition::Retryable
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
        }
    }
}

/// Shared HTTP client with bounded global and per-source concurrency and
/// transparent retry of transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_key: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        source_key: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(source_key, HttpRequest::get(url)).await
    }

    pub async fn execute(
        &self,
        source_key: &str,
        request: HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_key).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source_key, url = %request.url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some((user, pass)) = &request.basic_auth {
                builder = builder.basic_auth(user, pass.as_deref());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
            if let Some(form) = &request.form {
                builder = builder.form(form);
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}
