//! Cross-crate flow: crawl, soft delete, re-crawl, restore, re-crawl.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rolecall_adapters::{AdapterError, AdapterRun, SourceAdapter};
use rolecall_core::{DeletionKind, RawRecord, SecretResolver, Source, SourceKind};
use rolecall_lifecycle::{DeletionRequest, Lifecycle, LifecycleConfig};
use rolecall_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, MemoryStore, Store};
use rolecall_sync::{SchedulePolicy, Scheduler};
use serde_json::json;

struct FixedListing;

#[async_trait]
impl SourceAdapter for FixedListing {
    fn describe_kind(&self) -> SourceKind {
        SourceKind::Page
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        source: &Source,
        _since: Option<DateTime<Utc>>,
    ) -> Result<AdapterRun, AdapterError> {
        let now = Utc::now();
        let records = [
            json!({"title": "Nurse", "apply_url": "https://acme.test/jobs/nurse"}),
            json!({"title": "Technician", "apply_url": "https://acme.test/jobs/tech"}),
        ]
        .into_iter()
        .map(|payload| RawRecord {
            source_id: source.id,
            origin_url: source.url.clone(),
            payload,
            fetched_at: now,
        })
        .collect();
        Ok(AdapterRun {
            records,
            ..AdapterRun::default()
        })
    }
}

#[tokio::test]
async fn soft_delete_survives_recrawl_until_restored() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::shared();
    let source = Source::new("Acme", "https://acme.test/careers", SourceKind::Page);
    let source_id = source.id;
    store.insert_source(source).await.unwrap();

    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let scheduler = Arc::new(
        Scheduler::new(
            store.clone(),
            http,
            ArtifactStore::new(dir.path()),
            Arc::new(SecretResolver::default()),
            SchedulePolicy::default(),
            2,
        )
        .with_adapter_factory(Arc::new(|_, _| Box::new(FixedListing))),
    );
    let lifecycle = Lifecycle::new(
        store.clone(),
        LifecycleConfig {
            batch_size: 1000,
            export_dir: dir.path().to_path_buf(),
        },
    );

    let run = scheduler.run_source(source_id).await.unwrap();
    assert_eq!(run.counts.created, 2);
    assert_eq!(store.job_counts(source_id).await.unwrap().active, 2);

    let summary = lifecycle
        .execute(&DeletionRequest {
            source_id,
            kind: DeletionKind::Soft,
            actor: "ops".to_string(),
            reason: Some("markup broken".to_string()),
            dry_run: false,
            export_first: false,
            recrawl: false,
        })
        .await
        .unwrap();
    assert_eq!(summary.affected, 2);
    assert_eq!(store.job_counts(source_id).await.unwrap().active, 0);

    // a plain re-crawl must not bring the rows back
    let run = scheduler.run_source(source_id).await.unwrap();
    assert_eq!(run.counts.created, 0);
    assert_eq!(run.counts.unchanged, 2);
    assert_eq!(store.job_counts(source_id).await.unwrap().active, 0);

    // restore plus re-crawl does
    let restored = lifecycle.restore(source_id, "ops", None).await.unwrap();
    assert_eq!(restored.restored, 2);
    let run = scheduler.recrawl_source(source_id).await.unwrap();
    assert_eq!(run.counts.created, 0);
    let counts = store.job_counts(source_id).await.unwrap();
    assert_eq!((counts.active, counts.deleted), (2, 0));

    // one delete audit, one restore audit
    let audits = store.audits_for_source(source_id).await.unwrap();
    assert_eq!(audits.len(), 2);
}
