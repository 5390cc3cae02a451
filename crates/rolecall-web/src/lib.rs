//! JSON API over the store, scheduler, and lifecycle: source
//! registration and listing, impact preview, crawl triggers, deletion,
//! restore, and the job feed.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rolecall_adapters::{validate_source_payload, SourcePayload, ValidationError};
use rolecall_core::DeletionKind;
use rolecall_lifecycle::{DeletionRequest, Lifecycle, LifecycleError};
use rolecall_storage::{Store, StoreError};
use rolecall_sync::Scheduler;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rolecall-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub scheduler: Arc<Scheduler>,
    pub lifecycle: Arc<Lifecycle>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<Scheduler>, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            store,
            scheduler,
            lifecycle,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sources", post(create_source_handler).get(list_sources_handler))
        .route("/sources/{id}", get(source_handler))
        .route("/sources/{id}/impact", get(impact_handler))
        .route("/sources/{id}/run", post(trigger_run_handler))
        .route("/sources/{id}/delete", post(delete_handler))
        .route("/sources/{id}/restore", post(restore_handler))
        .route("/sources/{id}/audits", get(audits_handler))
        .route("/run", post(run_due_handler))
        .route("/runs/{id}", get(run_handler))
        .route("/jobs", get(jobs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::SourceNotFound(_) | StoreError::JobNotFound(_) => {
            error_body(StatusCode::NOT_FOUND, err.to_string())
        }
        StoreError::DuplicateSource(_) => error_body(StatusCode::CONFLICT, err.to_string()),
        StoreError::Backend(_) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn validation_error(err: ValidationError) -> Response {
    error_body(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
}

fn lifecycle_error(err: LifecycleError) -> Response {
    match err {
        LifecycleError::MissingReason => {
            error_body(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        LifecycleError::Store(inner) => store_error(inner),
        LifecycleError::Export(_) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn create_source_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SourcePayload>,
) -> Response {
    let source = match validate_source_payload(&payload) {
        Ok(source) => source,
        Err(err) => return validation_error(err),
    };
    match state.store.insert_source(source.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(source)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn list_sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_sources().await {
        Ok(sources) => Json(sources).into_response(),
        Err(err) => store_error(err),
    }
}

async fn source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.source(id).await {
        Ok(source) => Json(source).into_response(),
        Err(err) => store_error(err),
    }
}

async fn impact_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.lifecycle.impact(id).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

/// Hands the run id out before the crawl starts; the run becomes
/// queryable under `/runs/{id}` once it finishes.
async fn trigger_run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    if let Err(err) = state.store.source(id).await {
        return store_error(err);
    }
    if state.scheduler.is_running(id) {
        return error_body(
            StatusCode::CONFLICT,
            format!("source {id} already has a run in progress"),
        );
    }
    let run_id = Uuid::new_v4();
    let scheduler = Arc::clone(&state.scheduler);
    tokio::spawn(async move {
        if let Err(err) = scheduler.run_source_with_id(id, run_id).await {
            warn!(source_id = %id, run_id = %run_id, error = %err, "triggered run failed to start");
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))).into_response()
}

async fn run_due_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.run_due(chrono::Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn run_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.store.run(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, format!("run {id} not recorded yet")),
        Err(err) => store_error(err),
    }
}

fn default_actor() -> String {
    "api".to_string()
}

#[derive(Debug, Deserialize)]
struct DeleteBody {
    kind: DeletionKind,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    export: bool,
    #[serde(default)]
    recrawl: bool,
    #[serde(default = "default_actor")]
    actor: String,
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<DeleteBody>,
) -> Response {
    let request = DeletionRequest {
        source_id: id,
        kind: body.kind,
        actor: body.actor,
        reason: body.reason,
        dry_run: body.dry_run,
        export_first: body.export,
        recrawl: body.recrawl,
    };
    match state.lifecycle.execute(&request).await {
        Ok(summary) => {
            if body.recrawl && !body.dry_run {
                let scheduler = Arc::clone(&state.scheduler);
                tokio::spawn(async move {
                    if let Err(err) = scheduler.run_source(id).await {
                        warn!(source_id = %id, error = %err, "post-deletion recrawl failed to start");
                    }
                });
            }
            Json(summary).into_response()
        }
        Err(err) => lifecycle_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct RestoreBody {
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    recrawl: bool,
}

async fn restore_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<RestoreBody>,
) -> Response {
    match state.lifecycle.restore(id, &body.actor, body.reason).await {
        Ok(summary) => {
            if body.recrawl {
                let scheduler = Arc::clone(&state.scheduler);
                tokio::spawn(async move {
                    if let Err(err) = scheduler.recrawl_source(id).await {
                        warn!(source_id = %id, error = %err, "post-restore recrawl failed to start");
                    }
                });
            }
            Json(summary).into_response()
        }
        Err(err) => lifecycle_error(err),
    }
}

async fn audits_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.lifecycle.audits(id).await {
        Ok(audits) => Json(audits).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    source_id: Option<Uuid>,
    limit: Option<usize>,
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(100).min(1000);
    match state.store.list_active_jobs(query.source_id, limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => store_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use rolecall_adapters::{AdapterError, AdapterRun, SourceAdapter};
    use rolecall_core::{
        JobDraft, JobStatus, RawRecord, SecretResolver, SoftDelete, Source, SourceKind,
    };
    use rolecall_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, MemoryStore};
    use rolecall_sync::SchedulePolicy;
    use serde_json::Value as JsonValue;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct StubAdapter;

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn describe_kind(&self) -> SourceKind {
            SourceKind::Page
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            source: &Source,
            _since: Option<DateTime<Utc>>,
        ) -> Result<AdapterRun, AdapterError> {
            Ok(AdapterRun {
                records: vec![RawRecord {
                    source_id: source.id,
                    origin_url: source.url.clone(),
                    payload: json!({"title": "Stub Role", "apply_url": "https://stub.test/j/1"}),
                    fetched_at: Utc::now(),
                }],
                ..AdapterRun::default()
            })
        }
    }

    fn harness() -> (AppState, Arc<MemoryStore>, TempDir) {
        harness_with(Arc::new(|_, _| Box::new(StubAdapter)))
    }

    fn harness_with(factory: rolecall_sync::AdapterFactory) -> (AppState, Arc<MemoryStore>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::shared();
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
            .with_adapter_factory(factory),
        );
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            rolecall_lifecycle::LifecycleConfig {
                batch_size: 1000,
                export_dir: dir.path().to_path_buf(),
            },
        ));
        let state = AppState::new(store.clone(), scheduler, lifecycle);
        (state, store, dir)
    }

    fn draft(source_id: Uuid, n: usize) -> JobDraft {
        JobDraft {
            source_id,
            title: format!("Role {n}"),
            org_name: "Acme".to_string(),
            apply_url: format!("https://acme.test/apply/{n}"),
            description: None,
            location_city: None,
            location_region: None,
            location_country: None,
            posted_at: None,
            expires_at: None,
            status: JobStatus::Active,
            quality_notes: Vec::new(),
        }
    }

    async fn request_json(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<JsonValue>,
    ) -> (StatusCode, JsonValue) {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn source_registration_validates_and_conflicts() {
        let (state, _store, _dir) = harness();
        let app = app(state);

        let payload = json!({
            "source_type": "page",
            "org_name": "Acme",
            "careers_url": "https://acme.test/careers",
            "parser_hint": ".job-card",
        });
        let (status, body) = request_json(app.clone(), "POST", "/sources", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["kind"], json!("page"));

        let (status, _) = request_json(app.clone(), "POST", "/sources", Some(payload)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let invalid = json!({
            "source_type": "api",
            "careers_url": "https://api.test",
        });
        let (status, body) = request_json(app.clone(), "POST", "/sources", Some(invalid)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("schema"));

        let (status, body) = request_json(app, "GET", "/sources", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn job_feed_hides_soft_deleted_rows() {
        let (state, store, _dir) = harness();
        let source = Source::new("Acme", "https://acme.test/careers", SourceKind::Page);
        let source_id = source.id;
        store.insert_source(source).await.unwrap();
        store
            .upsert_batch(&[draft(source_id, 1), draft(source_id, 2)], false)
            .await
            .unwrap();
        let ids = store.job_ids_for_source(source_id, false).await.unwrap();
        store
            .soft_delete_jobs(
                &ids[..1],
                &SoftDelete {
                    deleted_at: Utc::now(),
                    deleted_by: "ops".to_string(),
                    reason: None,
                },
            )
            .await
            .unwrap();

        let app = app(state);
        let (status, body) =
            request_json(app, "GET", &format!("/jobs?source_id={source_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn impact_is_read_only_and_404s_for_unknown_sources() {
        let (state, store, _dir) = harness();
        let source = Source::new("Acme", "https://acme.test/careers", SourceKind::Page);
        let source_id = source.id;
        store.insert_source(source).await.unwrap();
        store.upsert_batch(&[draft(source_id, 1)], false).await.unwrap();

        let app = app(state);
        let (status, body) =
            request_json(app.clone(), "GET", &format!("/sources/{source_id}/impact"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_jobs"], json!(1));
        assert_eq!(body["active_jobs"], json!(1));

        let (status, _) =
            request_json(app, "GET", &format!("/sources/{}/impact", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deletion_endpoint_enforces_reason_and_supports_dry_run() {
        let (state, store, _dir) = harness();
        let source = Source::new("Acme", "https://acme.test/careers", SourceKind::Page);
        let source_id = source.id;
        store.insert_source(source).await.unwrap();
        store
            .upsert_batch(&[draft(source_id, 1), draft(source_id, 2)], false)
            .await
            .unwrap();

        let app = app(state);
        let (status, body) = request_json(
            app.clone(),
            "POST",
            &format!("/sources/{source_id}/delete"),
            Some(json!({"kind": "hard"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("reason"));

        let (status, body) = request_json(
            app.clone(),
            "POST",
            &format!("/sources/{source_id}/delete"),
            Some(json!({"kind": "hard", "reason": "retired", "dry_run": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matched"], json!(2));
        assert_eq!(body["affected"], json!(0));
        assert_eq!(store.job_counts(source_id).await.unwrap().total, 2);

        let (status, body) = request_json(
            app.clone(),
            "POST",
            &format!("/sources/{source_id}/delete"),
            Some(json!({"kind": "soft", "reason": "retired"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["affected"], json!(2));
        assert_eq!(body["status"], json!("completed"));

        let (status, body) = request_json(
            app,
            "GET",
            &format!("/sources/{source_id}/audits"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restore_endpoint_brings_jobs_back() {
        let (state, store, _dir) = harness();
        let source = Source::new("Acme", "https://acme.test/careers", SourceKind::Page);
        let source_id = source.id;
        store.insert_source(source).await.unwrap();
        store.upsert_batch(&[draft(source_id, 1)], false).await.unwrap();

        let app = app(state);
        let (status, _) = request_json(
            app.clone(),
            "POST",
            &format!("/sources/{source_id}/delete"),
            Some(json!({"kind": "soft", "reason": "oops"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request_json(
            app,
            "POST",
            &format!("/sources/{source_id}/restore"),
            Some(json!({"reason": "deleted in error"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["restored"], json!(1));
        assert_eq!(store.job_counts(source_id).await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn triggered_run_hands_out_an_id_before_finishing() {
        let (state, store, _dir) = harness();
        let source = Source::new("Stub", "https://stub.test/careers", SourceKind::Page);
        let source_id = source.id;
        store.insert_source(source).await.unwrap();

        let app = app(state);
        let (status, body) = request_json(
            app.clone(),
            "POST",
            &format!("/sources/{source_id}/run"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id: Uuid = serde_json::from_value(body["run_id"].clone()).unwrap();

        // wait for the spawned run to land in the store
        let mut recorded = None;
        for _ in 0..50 {
            if let Some(run) = store.run(run_id).await.unwrap() {
                recorded = Some(run);
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        let recorded = recorded.expect("run recorded");
        assert_eq!(recorded.counts.created, 1);

        let (status, body) = request_json(app, "GET", &format!("/runs/{run_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], json!(run_id));

        let unknown = Uuid::new_v4();
        let (status, _) = request_json(
            super::app(harness().0),
            "GET",
            &format!("/runs/{unknown}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    struct SlowAdapter;

    #[async_trait]
    impl SourceAdapter for SlowAdapter {
        fn describe_kind(&self) -> SourceKind {
            SourceKind::Page
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _source: &Source,
            _since: Option<DateTime<Utc>>,
        ) -> Result<AdapterRun, AdapterError> {
            tokio::time::sleep(StdDuration::from_millis(500)).await;
            Ok(AdapterRun::default())
        }
    }

    #[tokio::test]
    async fn trigger_conflicts_while_a_run_is_in_flight() {
        let (state, store, _dir) = harness_with(Arc::new(|_, _| Box::new(SlowAdapter)));
        let source = Source::new("Slow", "https://slow.test/careers", SourceKind::Page);
        let source_id = source.id;
        store.insert_source(source).await.unwrap();

        let scheduler = Arc::clone(&state.scheduler);
        let first = tokio::spawn(async move { scheduler.run_source(source_id).await });
        for _ in 0..50 {
            if state.scheduler.is_running(source_id) {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(state.scheduler.is_running(source_id));

        let (status, body) = request_json(
            app(state),
            "POST",
            &format!("/sources/{source_id}/run"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("in progress"));
        assert!(first.await.unwrap().is_ok());
    }
}
