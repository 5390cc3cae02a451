//! Source lifecycle operations: impact analysis, dry-run previews,
//! batched soft and hard deletion with pre-deletion export, the
//! append-only audit trail, and restore.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use rolecall_core::{AuditAction, DeletionAudit, DeletionKind, Job, SoftDelete};
use rolecall_storage::{JobCounts, Store, StoreError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rolecall-lifecycle";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("hard deletion requires a non-empty reason")]
    MissingReason,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("export failed: {0}")]
    Export(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub batch_size: usize,
    pub export_dir: PathBuf,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            export_dir: PathBuf::from("./exports"),
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Self {
        Self {
            batch_size: std::env::var("ROLECALL_DELETE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(1000),
            export_dir: std::env::var("ROLECALL_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./exports")),
        }
    }
}

/// What a deletion would touch, computed without side effects.
#[derive(Debug, Clone, Serialize)]
pub struct ImpactReport {
    pub source_id: Uuid,
    pub org_name: String,
    pub total_jobs: u64,
    pub active_jobs: u64,
    pub deleted_jobs: u64,
    pub dependent_rows: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub runs_recorded: usize,
    pub audits_recorded: usize,
}

#[derive(Debug, Clone)]
pub struct DeletionRequest {
    pub source_id: Uuid,
    pub kind: DeletionKind,
    pub actor: String,
    pub reason: Option<String>,
    pub dry_run: bool,
    pub export_first: bool,
    pub recrawl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Partial,
}

/// Machine-readable outcome of one deletion request. On partial failure
/// the summary states exactly how far execution got.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionSummary {
    pub source_id: Uuid,
    pub kind: DeletionKind,
    pub dry_run: bool,
    pub matched: usize,
    pub affected: usize,
    pub batches_planned: usize,
    pub batches_committed: usize,
    pub status: CompletionStatus,
    pub error: Option<String>,
    pub export_path: Option<PathBuf>,
    pub audit_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    pub source_id: Uuid,
    pub restored: usize,
    pub audit_id: Uuid,
}

pub struct Lifecycle {
    store: Arc<dyn Store>,
    config: LifecycleConfig,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn Store>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    /// Read-only preview of a source's footprint.
    pub async fn impact(&self, source_id: Uuid) -> Result<ImpactReport, LifecycleError> {
        let source = self.store.source(source_id).await?;
        let JobCounts {
            total,
            active,
            deleted,
        } = self.store.job_counts(source_id).await?;
        let dependent_rows = self.store.dependent_count(source_id).await?;
        let runs = self.store.runs_for_source(source_id, usize::MAX).await?;
        let audits = self.store.audits_for_source(source_id).await?;
        Ok(ImpactReport {
            source_id,
            org_name: source.org_name,
            total_jobs: total,
            active_jobs: active,
            deleted_jobs: deleted,
            dependent_rows,
            last_run_at: source.last_run_at,
            runs_recorded: runs.len(),
            audits_recorded: audits.len(),
        })
    }

    /// Executes a deletion request. A dry run touches nothing and writes
    /// no audit entry. A real run writes exactly one audit entry, even
    /// when zero rows matched, and exports affected rows to parquet
    /// before the first destructive batch when requested.
    pub async fn execute(&self, request: &DeletionRequest) -> Result<DeletionSummary, LifecycleError> {
        if request.kind == DeletionKind::Hard
            && request.reason.as_deref().map_or(true, |r| r.trim().is_empty())
        {
            return Err(LifecycleError::MissingReason);
        }
        self.store.source(request.source_id).await?;

        // Soft deletion targets live rows only; hard deletion purges
        // soft-deleted rows too.
        let include_deleted = request.kind == DeletionKind::Hard;
        let ids = self
            .store
            .job_ids_for_source(request.source_id, include_deleted)
            .await?;
        let matched = ids.len();
        let batches_planned = matched.div_ceil(self.config.batch_size);

        let mut summary = DeletionSummary {
            source_id: request.source_id,
            kind: request.kind,
            dry_run: request.dry_run,
            matched,
            affected: 0,
            batches_planned,
            batches_committed: 0,
            status: CompletionStatus::Completed,
            error: None,
            export_path: None,
            audit_id: None,
        };

        if request.dry_run {
            info!(
                source_id = %request.source_id,
                kind = ?request.kind,
                matched,
                "dry run, no rows touched"
            );
            return Ok(summary);
        }

        if request.export_first && matched > 0 {
            let jobs = self.store.jobs_by_ids(&ids).await?;
            let path = self.export_jobs(request.source_id, &jobs).await?;
            summary.export_path = Some(path);
        }

        let marker = SoftDelete {
            deleted_at: Utc::now(),
            deleted_by: request.actor.clone(),
            reason: request.reason.clone(),
        };
        for chunk in ids.chunks(self.config.batch_size) {
            let applied = match request.kind {
                DeletionKind::Soft => self.store.soft_delete_jobs(chunk, &marker).await,
                DeletionKind::Hard => self.store.remove_jobs(chunk).await,
            };
            match applied {
                Ok(count) => {
                    summary.affected += count;
                    summary.batches_committed += 1;
                }
                Err(err) => {
                    warn!(
                        source_id = %request.source_id,
                        batch = summary.batches_committed,
                        error = %err,
                        "deletion batch failed, stopping"
                    );
                    summary.status = CompletionStatus::Partial;
                    summary.error = Some(err.to_string());
                    break;
                }
            }
        }

        let audit = DeletionAudit {
            id: Uuid::new_v4(),
            actor: request.actor.clone(),
            occurred_at: Utc::now(),
            source_id: request.source_id,
            action: match request.kind {
                DeletionKind::Soft => AuditAction::SoftDelete,
                DeletionKind::Hard => AuditAction::HardDelete,
            },
            job_count: summary.affected as u64,
            reason: request.reason.clone(),
            exported: summary.export_path.is_some(),
            recrawl_triggered: request.recrawl,
        };
        summary.audit_id = Some(audit.id);
        self.store.append_audit(audit).await?;

        info!(
            source_id = %request.source_id,
            kind = ?request.kind,
            affected = summary.affected,
            batches = summary.batches_committed,
            status = ?summary.status,
            "deletion executed"
        );
        Ok(summary)
    }

    /// Clears soft-delete markers for a source and records the restore
    /// in the audit trail.
    pub async fn restore(
        &self,
        source_id: Uuid,
        actor: &str,
        reason: Option<String>,
    ) -> Result<RestoreSummary, LifecycleError> {
        self.store.source(source_id).await?;
        let restored = self.store.restore_jobs(source_id).await?;
        let audit = DeletionAudit {
            id: Uuid::new_v4(),
            actor: actor.to_string(),
            occurred_at: Utc::now(),
            source_id,
            action: AuditAction::Restore,
            job_count: restored as u64,
            reason,
            exported: false,
            recrawl_triggered: false,
        };
        let audit_id = audit.id;
        self.store.append_audit(audit).await?;
        Ok(RestoreSummary {
            source_id,
            restored,
            audit_id,
        })
    }

    pub async fn audits(&self, source_id: Uuid) -> Result<Vec<DeletionAudit>, LifecycleError> {
        Ok(self.store.audits_for_source(source_id).await?)
    }

    async fn export_jobs(&self, source_id: Uuid, jobs: &[Job]) -> Result<PathBuf, LifecycleError> {
        tokio::fs::create_dir_all(&self.config.export_dir)
            .await
            .with_context(|| format!("creating {}", self.config.export_dir.display()))
            .map_err(LifecycleError::Export)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self
            .config
            .export_dir
            .join(format!("{source_id}_{stamp}.parquet"));
        write_jobs_parquet(&path, jobs)?;

        let manifest = export_manifest(&path, jobs.len())?;
        let manifest_path = path.with_extension("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest)
            .context("serializing export manifest")
            .map_err(LifecycleError::Export)?;
        tokio::fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))
            .map_err(LifecycleError::Export)?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

fn export_manifest(path: &Path, rows: usize) -> anyhow::Result<ExportManifest> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ExportManifest {
        path: path.display().to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
        rows,
    })
}

fn write_jobs_parquet(path: &Path, jobs: &[Job]) -> anyhow::Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("org_name", DataType::Utf8, false),
        ArrowField::new("apply_url", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("deleted", DataType::Boolean, false),
        ArrowField::new("posted_at", DataType::Utf8, true),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let ids: Vec<String> = jobs.iter().map(|j| j.id.to_string()).collect();
    let source_ids: Vec<String> = jobs.iter().map(|j| j.source_id.to_string()).collect();
    let statuses: Vec<String> = jobs
        .iter()
        .map(|j| format!("{:?}", j.status).to_lowercase())
        .collect();
    let posted: Vec<Option<String>> = jobs
        .iter()
        .map(|j| j.posted_at.map(|d| d.to_rfc3339()))
        .collect();
    let created: Vec<String> = jobs.iter().map(|j| j.created_at.to_rfc3339()).collect();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                ids.iter().map(String::as_str).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                source_ids.iter().map(String::as_str).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                jobs.iter().map(|j| j.title.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                jobs.iter().map(|j| j.org_name.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                jobs.iter().map(|j| j.apply_url.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                jobs.iter().map(|j| j.description.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                statuses.iter().map(String::as_str).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                jobs.iter().map(|j| j.is_deleted()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                posted.iter().map(Option::as_deref).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                created.iter().map(String::as_str).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building jobs record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing parquet batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}
