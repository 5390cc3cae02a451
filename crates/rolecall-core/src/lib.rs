//! Core domain model for RoleCall: sources, jobs, run history, deletion
//! audit records, and the secret resolver shared by every other crate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rolecall-core";

/// Which ingestion adapter a source is crawled with. Exactly one kind is
/// active per source and it decides the valid shape of `extraction_hint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Page,
    Feed,
    Api,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Page => "page",
            SourceKind::Feed => "feed",
            SourceKind::Api => "api",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "page" => Some(SourceKind::Page),
            "feed" => Some(SourceKind::Feed),
            "api" => Some(SourceKind::Api),
            _ => None,
        }
    }
}

/// One external origin of job postings.
///
/// `extraction_hint` holds a CSS selector (page), a wall-clock window
/// string such as "22:00-05:00" (feed), or the declarative API schema
/// object (api). The hint is stored as JSON so the adapter layer owns its
/// interpretation; validation happens before a source is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub org_name: String,
    pub org_type: Option<String>,
    pub url: String,
    pub kind: SourceKind,
    pub extraction_hint: Option<JsonValue>,
    pub crawl_interval_days: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_message: Option<String>,
    pub consecutive_failures: u32,
    pub consecutive_no_change: u32,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn new(org_name: impl Into<String>, url: impl Into<String>, kind: SourceKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_name: org_name.into(),
            org_type: None,
            url: url.into(),
            kind,
            extraction_hint: None,
            crawl_interval_days: 1,
            next_run_at: now,
            last_run_at: None,
            last_run_status: None,
            last_run_message: None,
            consecutive_failures: 0,
            consecutive_no_change: 0,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Selector hint for page sources, when configured.
    pub fn selector_hint(&self) -> Option<&str> {
        match self.kind {
            SourceKind::Page => self.extraction_hint.as_ref().and_then(|v| v.as_str()),
            _ => None,
        }
    }

    /// Time-window hint for feed sources. Always textual; the adapter
    /// layer evaluates it against wall-clock time.
    pub fn time_window_hint(&self) -> Option<&str> {
        match self.kind {
            SourceKind::Feed => self.extraction_hint.as_ref().and_then(|v| v.as_str()),
            _ => None,
        }
    }

    /// Raw API schema object for api sources.
    pub fn api_schema_hint(&self) -> Option<&JsonValue> {
        match self.kind {
            SourceKind::Api => self.extraction_hint.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Expired,
    Closed,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Active
    }
}

/// Soft-delete marker. A job carrying one is logically absent from every
/// consumer-facing query but remains physically stored and recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDelete {
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    pub reason: Option<String>,
}

/// One canonical job posting. `(source_id, apply_url)` is the dedup
/// identity: two records sharing that pair are the same logical job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_id: Uuid,
    pub title: String,
    pub org_name: String,
    pub apply_url: String,
    pub description: Option<String>,
    pub location_city: Option<String>,
    pub location_region: Option<String>,
    pub location_country: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub soft_delete: Option<SoftDelete>,
    pub quality_notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_deleted(&self) -> bool {
        self.soft_delete.is_some()
    }
}

/// Normalized candidate produced by the normalizer and reconciled by the
/// upsert engine. `apply_url` is already canonical here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDraft {
    pub source_id: Uuid,
    pub title: String,
    pub org_name: String,
    pub apply_url: String,
    pub description: Option<String>,
    pub location_city: Option<String>,
    pub location_region: Option<String>,
    pub location_country: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub quality_notes: Vec<String>,
}

/// Per-run item counters recorded on every crawl-run log row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u32,
    pub created: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub failed: u32,
    pub duplicates: u32,
}

impl RunCounts {
    /// Share of fetched items that collapsed onto an already-seen
    /// canonical apply URL within the same run.
    pub fn duplicate_rate(&self) -> f64 {
        if self.fetched == 0 {
            0.0
        } else {
            f64::from(self.duplicates) / f64::from(self.fetched)
        }
    }

    pub fn changed(&self) -> u32 {
        self.created + self.updated
    }
}

/// Append-only record of one scheduler invocation of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRun {
    pub id: Uuid,
    pub source_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub message: Option<String>,
    pub counts: RunCounts,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionKind {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SoftDelete,
    HardDelete,
    Restore,
}

/// Append-only audit row written once per lifecycle operation, never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionAudit {
    pub id: Uuid,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    pub source_id: Uuid,
    pub action: AuditAction,
    pub job_count: u64,
    pub reason: Option<String>,
    pub exported: bool,
    pub recrawl_triggered: bool,
}

/// One raw item emitted by an adapter before mapping and normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: Uuid,
    pub origin_url: String,
    pub payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

/// Structured per-item extraction failure, persisted with enough context
/// to replay the item without re-running the whole crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionFailure {
    pub source_id: Uuid,
    pub url: String,
    pub selector_or_path: String,
    pub snippet: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Secret resolver
// ---------------------------------------------------------------------------

const PLACEHOLDER_OPEN: &str = "{{SECRET:";
const PLACEHOLDER_CLOSE: &str = "}}";

/// Marker substituted for resolved secret values before anything is
/// logged or echoed back to an operator.
pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("missing secret {0}")]
    Missing(String),
    #[error("missing secrets: {}", .0.join(", "))]
    MissingBatch(Vec<String>),
    #[error("unterminated secret placeholder in {0:?}")]
    Unterminated(String),
}

/// Resolves `{{SECRET:NAME}}` placeholders to runtime-scoped values and
/// produces masked copies of structures for logging.
#[derive(Debug, Clone, Default)]
pub struct SecretResolver {
    values: HashMap<String, String>,
}

impl SecretResolver {
    pub fn from_env() -> Self {
        Self {
            values: std::env::vars().collect(),
        }
    }

    pub fn with_values(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Names referenced by placeholders in `input`, in order of appearance.
    pub fn placeholder_names(input: &str) -> Result<Vec<String>, SecretError> {
        let mut names = Vec::new();
        let mut rest = input;
        while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
            let after = &rest[start + PLACEHOLDER_OPEN.len()..];
            let Some(end) = after.find(PLACEHOLDER_CLOSE) else {
                return Err(SecretError::Unterminated(input.to_string()));
            };
            names.push(after[..end].to_string());
            rest = &after[end + PLACEHOLDER_CLOSE.len()..];
        }
        Ok(names)
    }

    /// Substitutes every placeholder in `input`, failing on the first
    /// missing name.
    pub fn resolve(&self, input: &str) -> Result<String, SecretError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
            out.push_str(&rest[..start]);
            let after = &rest[start + PLACEHOLDER_OPEN.len()..];
            let Some(end) = after.find(PLACEHOLDER_CLOSE) else {
                return Err(SecretError::Unterminated(input.to_string()));
            };
            let name = &after[..end];
            match self.values.get(name) {
                Some(value) => out.push_str(value),
                None => return Err(SecretError::Missing(name.to_string())),
            }
            rest = &after[end + PLACEHOLDER_CLOSE.len()..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Resolves a batch of strings, reporting every missing name at once
    /// instead of failing on the first.
    pub fn resolve_batch<'a, I>(&self, inputs: I) -> Result<Vec<String>, SecretError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for input in inputs {
            match self.resolve(input) {
                Ok(value) => resolved.push(value),
                Err(SecretError::Missing(_)) => {
                    // Keep scanning the same input for the rest of its names.
                    for name in Self::placeholder_names(input)?
                        .into_iter()
                        .filter(|n| !self.values.contains_key(n))
                    {
                        if !missing.contains(&name) {
                            missing.push(name);
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(SecretError::MissingBatch(missing))
        }
    }

    /// Returns a copy of `value` with every occurrence of a resolved
    /// secret value replaced by [`REDACTED`].
    pub fn mask_json(&self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => JsonValue::String(self.mask_str(s)),
            JsonValue::Array(items) => {
                JsonValue::Array(items.iter().map(|v| self.mask_json(v)).collect())
            }
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn mask_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for secret in self.values.values() {
            if !secret.is_empty() && out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> SecretResolver {
        SecretResolver::with_values(HashMap::from([
            ("API_TOKEN".to_string(), "tok-12345".to_string()),
            ("CLIENT_SECRET".to_string(), "shh".to_string()),
        ]))
    }

    #[test]
    fn resolves_multiple_placeholders_in_one_string() {
        let out = resolver()
            .resolve("Bearer {{SECRET:API_TOKEN}}/{{SECRET:CLIENT_SECRET}}")
            .unwrap();
        assert_eq!(out, "Bearer tok-12345/shh");
    }

    #[test]
    fn missing_secret_names_the_placeholder() {
        let err = resolver().resolve("{{SECRET:NOPE}}").unwrap_err();
        assert_eq!(err, SecretError::Missing("NOPE".to_string()));
    }

    #[test]
    fn batch_resolve_reports_every_missing_name() {
        let err = resolver()
            .resolve_batch(["{{SECRET:A}}", "{{SECRET:API_TOKEN}}", "{{SECRET:B}} {{SECRET:A}}"])
            .unwrap_err();
        assert_eq!(
            err,
            SecretError::MissingBatch(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn unterminated_placeholder_is_rejected() {
        let err = resolver().resolve("{{SECRET:OOPS").unwrap_err();
        assert!(matches!(err, SecretError::Unterminated(_)));
    }

    #[test]
    fn masking_redacts_resolved_values_recursively() {
        let masked = resolver().mask_json(&json!({
            "auth": {"header": "Bearer tok-12345"},
            "pages": ["shh", 3],
        }));
        assert_eq!(
            masked,
            json!({
                "auth": {"header": format!("Bearer {REDACTED}")},
                "pages": [REDACTED, 3],
            })
        );
    }

    #[test]
    fn hint_accessors_are_kind_gated() {
        let mut source = Source::new("Acme", "https://acme.test/careers", SourceKind::Page);
        source.extraction_hint = Some(json!(".job-card"));
        assert_eq!(source.selector_hint(), Some(".job-card"));
        assert_eq!(source.time_window_hint(), None);
        assert!(source.api_schema_hint().is_none());
    }

    #[test]
    fn duplicate_rate_handles_empty_runs() {
        let counts = RunCounts::default();
        assert_eq!(counts.duplicate_rate(), 0.0);
        let counts = RunCounts {
            fetched: 10,
            duplicates: 2,
            ..RunCounts::default()
        };
        assert!((counts.duplicate_rate() - 0.2).abs() < f64::EPSILON);
    }
}
