//! Ingestion adapters: one capability trait (`fetch`, `describe_kind`)
//! with page, feed, and API variants, plus the shared dot-path field
//! mapper and operator payload validation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use rolecall_core::{
    ExtractionFailure, RawRecord, SecretError, SecretResolver, Source, SourceKind,
};
use rolecall_storage::{FetchError, HttpFetcher, HttpRequest};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const CRATE_NAME: &str = "rolecall-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Bad schema or missing secret: rejected before any network call.
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Carries the fetched bytes so the run can archive them even
    /// though parsing failed.
    #[error("response parse error: {message}")]
    Parse {
        message: String,
        raw: Vec<RawPayload>,
    },
}

impl AdapterError {
    pub fn parse(message: impl Into<String>) -> Self {
        AdapterError::Parse {
            message: message.into(),
            raw: Vec::new(),
        }
    }

    pub fn with_payloads(self, payloads: Vec<RawPayload>) -> Self {
        match self {
            AdapterError::Parse { message, mut raw } => {
                raw.extend(payloads);
                AdapterError::Parse { message, raw }
            }
            other => other,
        }
    }
}

impl From<SecretError> for AdapterError {
    fn from(err: SecretError) -> Self {
        AdapterError::Config(err.to_string())
    }
}

/// Raw payload captured during a run, stored as an immutable artifact
/// before any parsing so failed items can be replayed.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub extension: &'static str,
    pub body: Vec<u8>,
}

/// Outcome of one adapter invocation. A failed run is restarted from the
/// beginning; there is no mid-stream resume.
#[derive(Debug, Clone, Default)]
pub struct AdapterRun {
    pub records: Vec<RawRecord>,
    pub failures: Vec<ExtractionFailure>,
    pub raw_payloads: Vec<RawPayload>,
    pub note: Option<String>,
    /// Set when the adapter deliberately fetched nothing (e.g. a feed
    /// outside its active window), so the run is not treated as a quiet
    /// crawl for scheduling purposes.
    pub skipped: bool,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn describe_kind(&self) -> SourceKind;

    /// Runs one crawl of `source`. `since` is the incremental marker from
    /// the last successful run; adapters that cannot use it ignore it.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        source: &Source,
        since: Option<DateTime<Utc>>,
    ) -> Result<AdapterRun, AdapterError>;
}

/// Selects the adapter variant by the source's declared kind.
pub fn adapter_for(kind: SourceKind, secrets: Arc<SecretResolver>) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::Page => Box::new(PageAdapter),
        SourceKind::Feed => Box::new(FeedAdapter),
        SourceKind::Api => Box::new(ApiAdapter { secrets }),
    }
}

fn truncate_snippet(input: &str, max: usize) -> String {
    if input.len() <= max {
        input.to_string()
    } else {
        let mut end = max;
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &input[..end])
    }
}

// ---------------------------------------------------------------------------
// Page adapter
// ---------------------------------------------------------------------------

pub struct PageAdapter;

#[async_trait]
impl SourceAdapter for PageAdapter {
    fn describe_kind(&self) -> SourceKind {
        SourceKind::Page
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        source: &Source,
        _since: Option<DateTime<Utc>>,
    ) -> Result<AdapterRun, AdapterError> {
        let response = http
            .fetch_bytes(&source.id.to_string(), &source.url)
            .await?;
        let html = String::from_utf8_lossy(&response.body).into_owned();
        let payload = RawPayload {
            extension: "html",
            body: response.body,
        };
        let mut run = match parse_page_records(source, &html) {
            Ok(run) => run,
            Err(err) => return Err(err.with_payloads(vec![payload])),
        };
        run.raw_payloads.push(payload);
        Ok(run)
    }
}

/// Applies the operator-supplied selector, or the heuristic repeating
/// block detector when none is configured, and emits one record per
/// posting block.
pub fn parse_page_records(source: &Source, html: &str) -> Result<AdapterRun, AdapterError> {
    let document = Html::parse_document(html);
    let selector_text = match source.selector_hint() {
        Some(hint) => hint.to_string(),
        None => detect_repeating_blocks(&document).ok_or_else(|| {
            AdapterError::parse("no repeating posting blocks detected")
        })?,
    };
    let selector = Selector::parse(&selector_text)
        .map_err(|e| AdapterError::Config(format!("invalid selector {selector_text:?}: {e}")))?;
    let base = Url::parse(&source.url)
        .map_err(|e| AdapterError::Config(format!("invalid source url {}: {e}", source.url)))?;

    let now = Utc::now();
    let mut run = AdapterRun::default();
    for block in document.select(&selector) {
        match extract_block(&block, &base) {
            Some((title, apply_url, description)) => run.records.push(RawRecord {
                source_id: source.id,
                origin_url: source.url.clone(),
                payload: json!({
                    "title": title,
                    "apply_url": apply_url,
                    "description": description,
                }),
                fetched_at: now,
            }),
            None => run.failures.push(ExtractionFailure {
                source_id: source.id,
                url: source.url.clone(),
                selector_or_path: selector_text.clone(),
                snippet: truncate_snippet(&block.html(), 500),
                reason: "posting block has no title or apply link".to_string(),
                occurred_at: now,
            }),
        }
    }
    debug!(
        source_id = %source.id,
        selector = %selector_text,
        records = run.records.len(),
        failures = run.failures.len(),
        "page extraction finished"
    );
    Ok(run)
}

fn extract_block(block: &ElementRef<'_>, base: &Url) -> Option<(String, String, Option<String>)> {
    let link_sel = Selector::parse("a[href]").ok()?;
    let heading_sel = Selector::parse("h1, h2, h3, h4").ok()?;

    let link = block.select(&link_sel).next()?;
    let href = link.value().attr("href")?;
    let apply_url = base.join(href).ok()?.to_string();

    let title = block
        .select(&heading_sel)
        .next()
        .map(|h| h.text().collect::<String>())
        .or_else(|| Some(link.text().collect::<String>()))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())?;

    let description = {
        let text = block.text().collect::<String>();
        let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if trimmed.is_empty() || trimmed == title {
            None
        } else {
            Some(truncate_snippet(&trimmed, 2000))
        }
    };
    Some((title, apply_url, description))
}

/// Built-in detector: finds the most repeated (tag, class-set) signature
/// among elements that contain an apply link, requiring at least three
/// repetitions before trusting it.
pub fn detect_repeating_blocks(document: &Html) -> Option<String> {
    let any_sel = Selector::parse("li, article, div, section, tr").ok()?;
    let link_sel = Selector::parse("a[href]").ok()?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for element in document.select(&any_sel) {
        if element.select(&link_sel).next().is_none() {
            continue;
        }
        let tag = element.value().name();
        let mut classes: Vec<&str> = element
            .value()
            .classes()
            .filter(|c| c.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'))
            .collect();
        classes.sort_unstable();
        if classes.is_empty() && !matches!(tag, "li" | "article" | "tr") {
            continue;
        }
        let selector = if classes.is_empty() {
            tag.to_string()
        } else {
            format!("{tag}.{}", classes.join("."))
        };
        *counts.entry(selector).or_default() += 1;
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count >= 3)
        .max_by_key(|(_, count)| *count)
        .map(|(selector, _)| selector)
}

// ---------------------------------------------------------------------------
// Feed adapter
// ---------------------------------------------------------------------------

/// Active wall-clock window for feed sources, parsed from a textual
/// range such as "22:00-05:00". Always compared temporally; a window
/// value is never a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(input: &str) -> Result<Self, AdapterError> {
        let cleaned = input.trim().replace('–', "-");
        let (start_text, end_text) = cleaned
            .split_once('-')
            .ok_or_else(|| AdapterError::Config(format!("invalid time window {input:?}")))?;
        let parse_clock = |text: &str| {
            NaiveTime::parse_from_str(text.trim(), "%H:%M")
                .map_err(|e| AdapterError::Config(format!("invalid time window {input:?}: {e}")))
        };
        Ok(Self {
            start: parse_clock(start_text)?,
            end: parse_clock(end_text)?,
        })
    }

    /// Half-open containment; windows that cross midnight wrap.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

pub struct FeedAdapter;

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn describe_kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        source: &Source,
        _since: Option<DateTime<Utc>>,
    ) -> Result<AdapterRun, AdapterError> {
        if let Some(window_text) = source.time_window_hint() {
            let window = TimeWindow::parse(window_text)?;
            let now = Utc::now().time();
            if !window.contains(now) {
                info!(source_id = %source.id, window = window_text, "outside active window, skipping fetch");
                return Ok(AdapterRun {
                    note: Some(format!("outside active window {window_text}")),
                    skipped: true,
                    ..AdapterRun::default()
                });
            }
        }

        let response = http
            .fetch_bytes(&source.id.to_string(), &source.url)
            .await?;
        let payload = RawPayload {
            extension: "xml",
            body: response.body,
        };
        let mut run = match parse_feed_records(source, &payload.body) {
            Ok(run) => run,
            Err(err) => return Err(err.with_payloads(vec![payload])),
        };
        run.raw_payloads.push(payload);
        Ok(run)
    }
}

/// Parses a syndication document (RSS or Atom) into one record per entry.
pub fn parse_feed_records(source: &Source, body: &[u8]) -> Result<AdapterRun, AdapterError> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| AdapterError::parse(format!("unparseable feed: {e}")))?;

    let now = Utc::now();
    let mut run = AdapterRun::default();
    for entry in feed.entries {
        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty());
        let link = entry.links.first().map(|l| l.href.clone());
        match (title, link) {
            (Some(title), Some(link)) => {
                let description = entry
                    .summary
                    .as_ref()
                    .map(|s| s.content.trim().to_string())
                    .filter(|s| !s.is_empty());
                let posted_at = entry.published.or(entry.updated);
                run.records.push(RawRecord {
                    source_id: source.id,
                    origin_url: source.url.clone(),
                    payload: json!({
                        "title": title,
                        "apply_url": link,
                        "description": description,
                        "posted_at": posted_at.map(|d| d.to_rfc3339()),
                        "guid": entry.id,
                    }),
                    fetched_at: now,
                });
            }
            (title, link) => run.failures.push(ExtractionFailure {
                source_id: source.id,
                url: source.url.clone(),
                selector_or_path: "entry".to_string(),
                snippet: truncate_snippet(&format!("id={} title={title:?} link={link:?}", entry.id), 500),
                reason: "feed entry missing title or link".to_string(),
                occurred_at: now,
            }),
        }
    }
    Ok(run)
}

// ---------------------------------------------------------------------------
// Field mapper
// ---------------------------------------------------------------------------

/// Selects a value by dot-addressed path with optional array indexing:
/// `$`, `title`, `reward.min`, `tags[0].name`. Missing segments resolve
/// to `None`, never an error.
pub fn select_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let path = path.trim();
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path == "$" || path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        let (name, indexes) = split_indexes(segment)?;
        if !name.is_empty() {
            current = current.get(name)?;
        }
        for idx in indexes {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(pos) => {
            let name = &segment[..pos];
            let mut indexes = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let end = stripped.find(']')?;
                indexes.push(stripped[..end].parse().ok()?);
                rest = &stripped[end + 1..];
            }
            if rest.is_empty() {
                Some((name, indexes))
            } else {
                None
            }
        }
    }
}

/// Applies a field map (destination field -> source path) to one raw
/// record, producing the flat mapped field set. Missing optional paths
/// are simply absent.
pub fn apply_field_map(
    map: &BTreeMap<String, String>,
    record: &RawRecord,
) -> BTreeMap<String, JsonValue> {
    let mut out = BTreeMap::new();
    for (dest, path) in map {
        if let Some(value) = select_path(&record.payload, path) {
            if !value.is_null() {
                out.insert(dest.clone(), value.clone());
            }
        }
    }
    out
}

/// Identity map used by the page and feed adapters, whose records already
/// carry canonical field names.
pub fn default_field_map() -> BTreeMap<String, String> {
    [
        "title",
        "apply_url",
        "description",
        "posted_at",
        "expires_at",
        "org_name",
        "location_city",
        "location_region",
        "location_country",
    ]
    .into_iter()
    .map(|name| (name.to_string(), name.to_string()))
    .collect()
}

/// The field map a source's records should be run through: the API
/// schema's declared map, or the identity map for page and feed kinds.
pub fn field_map_for(source: &Source) -> Result<BTreeMap<String, String>, AdapterError> {
    match source.kind {
        SourceKind::Api => {
            let hint = source
                .api_schema_hint()
                .ok_or_else(|| AdapterError::Config("api source without schema".to_string()))?;
            match parse_api_schema(hint)? {
                ApiSchema::V1(schema) if !schema.map.is_empty() => Ok(schema.map),
                _ => Ok(default_field_map()),
            }
        }
        _ => Ok(default_field_map()),
    }
}

// ---------------------------------------------------------------------------
// API adapter: versioned declarative schema
// ---------------------------------------------------------------------------

/// Tagged schema variants. Unrecognized versions fall back to the legacy
/// fixed-shape interpretation instead of failing, so sources configured
/// before the schema existed keep working.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiSchema {
    V1(SchemaV1),
    Legacy(LegacyShape),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaV1 {
    pub v: u32,
    pub base_url: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub auth: AuthSpec,
    #[serde(default)]
    pub pagination: Option<PaginationSpec>,
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default)]
    pub map: BTreeMap<String, String>,
    #[serde(default)]
    pub since_param: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_data_path() -> String {
    "$".to_string()
}

/// Pre-schema sources: fetch one URL, treat the body as a JSON array of
/// objects with fixed `title`/`url`/`description` keys.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LegacyShape {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthSpec {
    #[default]
    None,
    Header {
        name: String,
        value: String,
    },
    Query {
        name: String,
        value: String,
    },
    BasicCredentials {
        username: String,
        password: String,
    },
    BearerToken {
        token: String,
    },
    Oauth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "kebab-case")]
pub enum PaginationSpec {
    Offset {
        #[serde(default = "default_offset_param")]
        param: String,
        #[serde(default = "default_size_param")]
        size_param: String,
        #[serde(default = "default_page_size")]
        page_size: u32,
        #[serde(default = "default_max_pages")]
        max_page_count: u32,
    },
    PageNumber {
        #[serde(default = "default_page_param")]
        param: String,
        #[serde(default = "default_first_page")]
        start: u32,
        #[serde(default = "default_size_param")]
        size_param: String,
        #[serde(default = "default_page_size")]
        page_size: u32,
        #[serde(default = "default_max_pages")]
        max_page_count: u32,
    },
    Cursor {
        #[serde(default = "default_cursor_param")]
        param: String,
        cursor_path: String,
        #[serde(default = "default_max_pages")]
        max_page_count: u32,
    },
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_size_param() -> String {
    "limit".to_string()
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    50
}

fn default_first_page() -> u32 {
    1
}

impl PaginationSpec {
    pub fn max_page_count(&self) -> u32 {
        match self {
            PaginationSpec::Offset { max_page_count, .. }
            | PaginationSpec::PageNumber { max_page_count, .. }
            | PaginationSpec::Cursor { max_page_count, .. } => *max_page_count,
        }
    }
}

/// Per-request pagination position.
#[derive(Debug, Clone, PartialEq)]
pub enum PageState {
    Single,
    Offset(u64),
    PageNumber(u32),
    Cursor(Option<String>),
}

impl PageState {
    pub fn initial(pagination: Option<&PaginationSpec>) -> Self {
        match pagination {
            None => PageState::Single,
            Some(PaginationSpec::Offset { .. }) => PageState::Offset(0),
            Some(PaginationSpec::PageNumber { start, .. }) => PageState::PageNumber(*start),
            Some(PaginationSpec::Cursor { .. }) => PageState::Cursor(None),
        }
    }

    /// Next position after a page returning `item_count` items, or `None`
    /// when the stop condition is met (empty page, missing cursor, or a
    /// short page for sized styles).
    pub fn advance(
        &self,
        pagination: &PaginationSpec,
        body: &JsonValue,
        item_count: usize,
    ) -> Option<PageState> {
        if item_count == 0 {
            return None;
        }
        match (self, pagination) {
            (PageState::Offset(offset), PaginationSpec::Offset { page_size, .. }) => {
                if (item_count as u64) < u64::from(*page_size) {
                    None
                } else {
                    Some(PageState::Offset(offset + u64::from(*page_size)))
                }
            }
            (PageState::PageNumber(page), PaginationSpec::PageNumber { page_size, .. }) => {
                if (item_count as u64) < u64::from(*page_size) {
                    None
                } else {
                    Some(PageState::PageNumber(page + 1))
                }
            }
            (PageState::Cursor(_), PaginationSpec::Cursor { cursor_path, .. }) => {
                let next = select_path(body, cursor_path)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string);
                next.map(|c| PageState::Cursor(Some(c)))
            }
            _ => None,
        }
    }
}

/// Parses the stored schema hint. `v: 1` selects [`SchemaV1`]; anything
/// else (missing or unknown version) is the legacy shape.
pub fn parse_api_schema(hint: &JsonValue) -> Result<ApiSchema, AdapterError> {
    match hint.get("v").and_then(JsonValue::as_u64) {
        Some(1) => {
            let schema: SchemaV1 = serde_json::from_value(hint.clone())
                .map_err(|e| AdapterError::Config(format!("invalid v1 schema: {e}")))?;
            Ok(ApiSchema::V1(schema))
        }
        _ => {
            let legacy: LegacyShape = serde_json::from_value(hint.clone()).unwrap_or_default();
            Ok(ApiSchema::Legacy(legacy))
        }
    }
}

/// Selects the item array from a response body via the schema's
/// `data_path` expression.
pub fn parse_items(schema: &SchemaV1, body: &JsonValue) -> Result<Vec<JsonValue>, AdapterError> {
    let selected = select_path(body, &schema.data_path).ok_or_else(|| {
        AdapterError::parse(format!("data_path {:?} not found in response", schema.data_path))
    })?;
    selected
        .as_array()
        .cloned()
        .ok_or_else(|| AdapterError::parse(format!("data_path {:?} is not an array", schema.data_path)))
}

pub struct ApiAdapter {
    pub secrets: Arc<SecretResolver>,
}

impl ApiAdapter {
    /// Builds the request for one page, resolving secret placeholders in
    /// auth and pagination parameters. A missing secret is a
    /// configuration error raised before any network call.
    pub fn build_request(
        &self,
        schema: &SchemaV1,
        state: &PageState,
        since: Option<DateTime<Utc>>,
        bearer_override: Option<&str>,
    ) -> Result<HttpRequest, AdapterError> {
        let base = Url::parse(&schema.base_url)
            .map_err(|e| AdapterError::Config(format!("invalid base_url {}: {e}", schema.base_url)))?;
        let url = base
            .join(&schema.path)
            .map_err(|e| AdapterError::Config(format!("invalid path {}: {e}", schema.path)))?;

        let method = match schema.method.as_deref() {
            None => reqwest::Method::GET,
            Some(m) => m
                .parse()
                .map_err(|_| AdapterError::Config(format!("invalid method {m:?}")))?,
        };

        let mut request = HttpRequest {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            basic_auth: None,
            form: None,
        };

        match &schema.auth {
            AuthSpec::None => {}
            AuthSpec::Header { name, value } => {
                request
                    .headers
                    .push((name.clone(), self.secrets.resolve(value)?));
            }
            AuthSpec::Query { name, value } => {
                request
                    .query
                    .push((name.clone(), self.secrets.resolve(value)?));
            }
            AuthSpec::BasicCredentials { username, password } => {
                request.basic_auth = Some((
                    self.secrets.resolve(username)?,
                    Some(self.secrets.resolve(password)?),
                ));
            }
            AuthSpec::BearerToken { token } => {
                request.headers.push((
                    "Authorization".to_string(),
                    format!("Bearer {}", self.secrets.resolve(token)?),
                ));
            }
            AuthSpec::Oauth2ClientCredentials { .. } => {
                let token = bearer_override.ok_or_else(|| {
                    AdapterError::Config("oauth2 token not acquired before request".to_string())
                })?;
                request
                    .headers
                    .push(("Authorization".to_string(), format!("Bearer {token}")));
            }
        }

        match (state, schema.pagination.as_ref()) {
            (PageState::Single, _) | (_, None) => {}
            (
                PageState::Offset(offset),
                Some(PaginationSpec::Offset {
                    param,
                    size_param,
                    page_size,
                    ..
                }),
            ) => {
                request.query.push((param.clone(), offset.to_string()));
                request
                    .query
                    .push((size_param.clone(), page_size.to_string()));
            }
            (
                PageState::PageNumber(page),
                Some(PaginationSpec::PageNumber {
                    param,
                    size_param,
                    page_size,
                    ..
                }),
            ) => {
                request.query.push((param.clone(), page.to_string()));
                request
                    .query
                    .push((size_param.clone(), page_size.to_string()));
            }
            (PageState::Cursor(cursor), Some(PaginationSpec::Cursor { param, .. })) => {
                if let Some(cursor) = cursor {
                    request.query.push((param.clone(), cursor.clone()));
                }
            }
            (state, Some(pagination)) => {
                return Err(AdapterError::Config(format!(
                    "pagination state {state:?} does not match descriptor {pagination:?}"
                )));
            }
        }

        if let Some(since) = since {
            let param = schema.since_param.clone().unwrap_or_else(|| "since".to_string());
            request.query.push((param, since.to_rfc3339()));
        }

        Ok(request)
    }

    async fn acquire_oauth2_token(
        &self,
        http: &HttpFetcher,
        source_key: &str,
        schema: &SchemaV1,
    ) -> Result<Option<String>, AdapterError> {
        let AuthSpec::Oauth2ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scope,
        } = &schema.auth
        else {
            return Ok(None);
        };

        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.secrets.resolve(client_id)?),
            (
                "client_secret".to_string(),
                self.secrets.resolve(client_secret)?,
            ),
        ];
        if let Some(scope) = scope {
            form.push(("scope".to_string(), scope.clone()));
        }

        let request = HttpRequest {
            method: reqwest::Method::POST,
            url: self.secrets.resolve(token_url)?,
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            basic_auth: None,
            form: Some(form),
        };
        let response = http.execute(source_key, request).await?;
        let parsed: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|e| AdapterError::parse(format!("unparseable token response: {e}")))?;
        let token = parsed
            .get("access_token")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| AdapterError::parse("token response missing access_token"))?;
        Ok(Some(token.to_string()))
    }

    async fn fetch_v1(
        &self,
        http: &HttpFetcher,
        source: &Source,
        schema: &SchemaV1,
        since: Option<DateTime<Utc>>,
    ) -> Result<AdapterRun, AdapterError> {
        let source_key = source.id.to_string();
        let token = self.acquire_oauth2_token(http, &source_key, schema).await?;

        let mut run = AdapterRun::default();
        let mut state = PageState::initial(schema.pagination.as_ref());
        let max_pages = schema
            .pagination
            .as_ref()
            .map(|p| p.max_page_count())
            .unwrap_or(1);

        for _page in 0..max_pages.max(1) {
            let request = self.build_request(schema, &state, since, token.as_deref())?;
            let url = request.url.clone();
            let response = http.execute(&source_key, request).await?;
            run.raw_payloads.push(RawPayload {
                extension: "json",
                body: response.body.clone(),
            });
            let body: JsonValue = match serde_json::from_slice(&response.body) {
                Ok(body) => body,
                Err(e) => {
                    return Err(AdapterError::parse(format!("unparseable response body: {e}"))
                        .with_payloads(run.raw_payloads))
                }
            };
            let items = match parse_items(schema, &body) {
                Ok(items) => items,
                Err(err) => return Err(err.with_payloads(run.raw_payloads)),
            };
            let item_count = items.len();
            let now = Utc::now();
            for item in items {
                run.records.push(RawRecord {
                    source_id: source.id,
                    origin_url: url.clone(),
                    payload: item,
                    fetched_at: now,
                });
            }

            state = match schema.pagination.as_ref() {
                None => break,
                Some(pagination) => match state.advance(pagination, &body, item_count) {
                    Some(next) => next,
                    None => break,
                },
            };
        }

        Ok(run)
    }

    async fn fetch_legacy(
        &self,
        http: &HttpFetcher,
        source: &Source,
        legacy: &LegacyShape,
    ) -> Result<AdapterRun, AdapterError> {
        let url = legacy.url.clone().unwrap_or_else(|| source.url.clone());
        let response = http.fetch_bytes(&source.id.to_string(), &url).await?;
        let payload = RawPayload {
            extension: "json",
            body: response.body,
        };
        let body: JsonValue = match serde_json::from_slice(&payload.body) {
            Ok(body) => body,
            Err(e) => {
                return Err(AdapterError::parse(format!("unparseable legacy body: {e}"))
                    .with_payloads(vec![payload]))
            }
        };
        let items = match body.as_array() {
            Some(items) => items.clone(),
            None => {
                return Err(AdapterError::parse("legacy body is not a JSON array")
                    .with_payloads(vec![payload]))
            }
        };

        let now = Utc::now();
        let mut run = AdapterRun {
            raw_payloads: vec![payload],
            ..AdapterRun::default()
        };
        for item in items {
            run.records.push(RawRecord {
                source_id: source.id,
                origin_url: url.clone(),
                payload: json!({
                    "title": item.get("title").cloned().unwrap_or(JsonValue::Null),
                    "apply_url": item.get("url").cloned().unwrap_or(JsonValue::Null),
                    "description": item.get("description").cloned().unwrap_or(JsonValue::Null),
                }),
                fetched_at: now,
            });
        }
        Ok(run)
    }
}

#[async_trait]
impl SourceAdapter for ApiAdapter {
    fn describe_kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        source: &Source,
        since: Option<DateTime<Utc>>,
    ) -> Result<AdapterRun, AdapterError> {
        let hint = source
            .api_schema_hint()
            .ok_or_else(|| AdapterError::Config("api source without schema".to_string()))?;
        match parse_api_schema(hint)? {
            ApiSchema::V1(schema) => self.fetch_v1(http, source, &schema, since).await,
            ApiSchema::Legacy(legacy) => self.fetch_legacy(http, source, &legacy).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Operator payload validation
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown source_type {0:?}")]
    UnknownSourceType(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Operator-facing source configuration payload; validated per
/// source_type before a source is accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcePayload {
    pub source_type: String,
    pub careers_url: String,
    #[serde(default)]
    pub org_name: Option<String>,
    #[serde(default)]
    pub org_type: Option<String>,
    #[serde(default)]
    pub parser_hint: Option<String>,
    #[serde(default)]
    pub schema: Option<JsonValue>,
    #[serde(default)]
    pub time_window: Option<String>,
    #[serde(default)]
    pub crawl_interval_days: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Validates a payload and builds the new `Source`. Configuration errors
/// are reported before anything is stored or fetched.
pub fn validate_source_payload(payload: &SourcePayload) -> Result<Source, ValidationError> {
    let kind = SourceKind::parse(&payload.source_type)
        .ok_or_else(|| ValidationError::UnknownSourceType(payload.source_type.clone()))?;

    if payload.careers_url.trim().is_empty() {
        return Err(ValidationError::MissingField("careers_url"));
    }
    let parsed_url = Url::parse(&payload.careers_url).map_err(|e| ValidationError::InvalidField {
        field: "careers_url",
        reason: e.to_string(),
    })?;

    let extraction_hint = match kind {
        SourceKind::Page => payload.parser_hint.as_ref().map(|hint| json!(hint)),
        SourceKind::Feed => match &payload.time_window {
            Some(window) => {
                TimeWindow::parse(window).map_err(|e| ValidationError::InvalidField {
                    field: "time_window",
                    reason: e.to_string(),
                })?;
                Some(json!(window))
            }
            None => None,
        },
        SourceKind::Api => {
            let schema = payload
                .schema
                .as_ref()
                .ok_or(ValidationError::MissingField("schema"))?;
            match schema.get("v").and_then(JsonValue::as_u64) {
                Some(1) => {}
                Some(_) | None => return Err(ValidationError::MissingField("v")),
            }
            match schema.get("base_url").and_then(JsonValue::as_str) {
                Some(base) if !base.trim().is_empty() => {}
                _ => return Err(ValidationError::MissingField("base_url")),
            }
            if let Err(err) = parse_api_schema(schema) {
                return Err(ValidationError::InvalidField {
                    field: "schema",
                    reason: err.to_string(),
                });
            }
            Some(schema.clone())
        }
    };

    let org_name = payload
        .org_name
        .clone()
        .or_else(|| parsed_url.host_str().map(ToString::to_string))
        .ok_or(ValidationError::MissingField("org_name"))?;

    let mut source = Source::new(org_name, payload.careers_url.clone(), kind);
    source.org_type = payload.org_type.clone();
    source.extraction_hint = extraction_hint;
    source.crawl_interval_days = payload.crawl_interval_days.unwrap_or(1).max(1);
    source.notes = payload.notes.clone();
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn page_source(selector: Option<&str>) -> Source {
        let mut source = Source::new("Acme", "https://acme.test/careers", SourceKind::Page);
        source.extraction_hint = selector.map(|s| json!(s));
        source
    }

    fn api_source(schema: JsonValue) -> Source {
        let mut source = Source::new("Acme", "https://acme.test", SourceKind::Api);
        source.extraction_hint = Some(schema);
        source
    }

    fn secrets(pairs: &[(&str, &str)]) -> Arc<SecretResolver> {
        Arc::new(SecretResolver::with_values(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        ))
    }

    const LISTING_HTML: &str = r#"
        <html><body>
          <div class="job-card"><h3>Backend Engineer</h3>
            <a href="/jobs/1">Apply</a><p>Build services.</p></div>
          <div class="job-card"><h3>Data Analyst</h3>
            <a href="/jobs/2">Apply</a><p>Analyze data.</p></div>
          <div class="job-card"><h3>Designer</h3>
            <a href="/jobs/3">Apply</a><p>Design things.</p></div>
          <div class="job-card"><span>Unlinked teaser</span></div>
        </body></html>
    "#;

    #[test]
    fn page_extraction_with_explicit_selector() {
        let source = page_source(Some("div.job-card"));
        let run = parse_page_records(&source, LISTING_HTML).unwrap();
        assert_eq!(run.records.len(), 3);
        assert_eq!(run.failures.len(), 1);
        assert_eq!(
            run.records[0].payload["apply_url"],
            json!("https://acme.test/jobs/1")
        );
        assert_eq!(run.records[0].payload["title"], json!("Backend Engineer"));
        assert_eq!(run.failures[0].selector_or_path, "div.job-card");
        assert!(run.failures[0].snippet.contains("Unlinked teaser"));
    }

    #[test]
    fn page_extraction_heuristic_detects_repeating_blocks() {
        let source = page_source(None);
        let run = parse_page_records(&source, LISTING_HTML).unwrap();
        // The teaser block matches the repeated signature but has no link.
        assert_eq!(run.records.len(), 3);
        assert_eq!(run.failures.len(), 1);
    }

    #[test]
    fn time_window_is_textual_and_wraps_midnight() {
        let window = TimeWindow::parse("22:00-05:00").unwrap();
        assert!(window.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(4, 59, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));

        let daytime = TimeWindow::parse("09:00-17:00").unwrap();
        assert!(daytime.contains(NaiveTime::from_hms_opt(9, 0, 0).unwrap()));
        assert!(!daytime.contains(NaiveTime::from_hms_opt(17, 0, 0).unwrap()));

        assert!(TimeWindow::parse("2200").is_err());
        assert!(TimeWindow::parse("22:00–05:00").is_ok());
    }

    #[test]
    fn parse_errors_carry_the_fetched_bytes() {
        let err = AdapterError::parse("unparseable feed").with_payloads(vec![RawPayload {
            extension: "xml",
            body: b"<rss".to_vec(),
        }]);
        match err {
            AdapterError::Parse { raw, .. } => {
                assert_eq!(raw.len(), 1);
                assert_eq!(raw[0].extension, "xml");
                assert_eq!(raw[0].body, b"<rss");
            }
            other => panic!("unexpected error {other:?}"),
        }

        // other variants pass through untouched
        let err = AdapterError::Config("bad selector".to_string()).with_payloads(Vec::new());
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn feed_entries_become_records() {
        let rss = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
              <title>Acme Jobs</title>
              <item><title>Field Tech</title>
                <link>https://acme.test/jobs/7</link>
                <description>Fix things.</description>
                <pubDate>Mon, 03 Aug 2026 09:00:00 GMT</pubDate></item>
              <item><title>No Link Role</title></item>
            </channel></rss>"#;
        let source = Source::new("Acme", "https://acme.test/feed.xml", SourceKind::Feed);
        let run = parse_feed_records(&source, rss.as_bytes()).unwrap();
        assert_eq!(run.records.len(), 1);
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.records[0].payload["title"], json!("Field Tech"));
        assert_eq!(
            run.records[0].payload["apply_url"],
            json!("https://acme.test/jobs/7")
        );
        assert!(run.records[0].payload["posted_at"].is_string());
    }

    #[test]
    fn select_path_supports_nested_and_array_segments() {
        let value = json!({
            "data": {"items": [{"name": "first", "tags": ["a", "b"]}]},
            "top": 1,
        });
        assert_eq!(select_path(&value, "$"), Some(&value));
        assert_eq!(select_path(&value, "top"), Some(&json!(1)));
        assert_eq!(
            select_path(&value, "data.items[0].name"),
            Some(&json!("first"))
        );
        assert_eq!(
            select_path(&value, "$.data.items[0].tags[1]"),
            Some(&json!("b"))
        );
        assert_eq!(select_path(&value, "data.missing.deep"), None);
    }

    #[test]
    fn field_map_skips_missing_paths_silently() {
        let record = RawRecord {
            source_id: uuid::Uuid::new_v4(),
            origin_url: "https://x".to_string(),
            payload: json!({"title": "T", "body": "B"}),
            fetched_at: Utc::now(),
        };
        let map = BTreeMap::from([
            ("title".to_string(), "title".to_string()),
            ("description_snippet".to_string(), "body".to_string()),
            ("pay".to_string(), "reward.amount".to_string()),
        ]);
        let mapped = apply_field_map(&map, &record);
        assert_eq!(mapped.get("title"), Some(&json!("T")));
        assert_eq!(mapped.get("description_snippet"), Some(&json!("B")));
        assert!(!mapped.contains_key("pay"));
    }

    #[test]
    fn schema_v1_parses_and_unknown_versions_fall_back_to_legacy() {
        let v1 = json!({
            "v": 1,
            "base_url": "https://x",
            "path": "/posts",
            "auth": {"type": "none"},
            "data_path": "$",
            "map": {"title": "title", "description_snippet": "body"},
        });
        match parse_api_schema(&v1).unwrap() {
            ApiSchema::V1(schema) => {
                assert_eq!(schema.base_url, "https://x");
                assert_eq!(schema.map.len(), 2);
                assert_eq!(schema.auth, AuthSpec::None);
            }
            other => panic!("expected v1, got {other:?}"),
        }

        let unknown = json!({"v": 9, "url": "https://old.example/jobs.json"});
        match parse_api_schema(&unknown).unwrap() {
            ApiSchema::Legacy(legacy) => {
                assert_eq!(legacy.url.as_deref(), Some("https://old.example/jobs.json"));
            }
            other => panic!("expected legacy, got {other:?}"),
        }

        assert!(matches!(
            parse_api_schema(&json!({"note": "pre-schema source"})).unwrap(),
            ApiSchema::Legacy(_)
        ));
    }

    #[test]
    fn auth_descriptors_use_kebab_case_tags() {
        let auth: AuthSpec = serde_json::from_value(json!({
            "type": "basic-credentials",
            "username": "u",
            "password": "{{SECRET:PASS}}",
        }))
        .unwrap();
        assert!(matches!(auth, AuthSpec::BasicCredentials { .. }));

        let auth: AuthSpec = serde_json::from_value(json!({
            "type": "oauth2-client-credentials",
            "token_url": "https://auth.test/token",
            "client_id": "id",
            "client_secret": "{{SECRET:CS}}",
        }))
        .unwrap();
        assert!(matches!(auth, AuthSpec::Oauth2ClientCredentials { .. }));
    }

    #[test]
    fn build_request_resolves_secret_placeholders() {
        let adapter = ApiAdapter {
            secrets: secrets(&[("API_TOKEN", "tok-1")]),
        };
        let schema: SchemaV1 = serde_json::from_value(json!({
            "v": 1,
            "base_url": "https://api.test",
            "path": "/jobs",
            "auth": {"type": "header", "name": "X-Api-Key", "value": "{{SECRET:API_TOKEN}}"},
        }))
        .unwrap();
        let request = adapter
            .build_request(&schema, &PageState::Single, None, None)
            .unwrap();
        assert_eq!(request.url, "https://api.test/jobs");
        assert_eq!(
            request.headers,
            vec![("X-Api-Key".to_string(), "tok-1".to_string())]
        );
    }

    #[test]
    fn build_request_missing_secret_is_a_config_error() {
        let adapter = ApiAdapter {
            secrets: secrets(&[]),
        };
        let schema: SchemaV1 = serde_json::from_value(json!({
            "v": 1,
            "base_url": "https://api.test",
            "auth": {"type": "bearer-token", "token": "{{SECRET:NOPE}}"},
        }))
        .unwrap();
        let err = adapter
            .build_request(&schema, &PageState::Single, None, None)
            .unwrap_err();
        assert!(matches!(err, AdapterError::Config(msg) if msg.contains("NOPE")));
    }

    #[test]
    fn since_marker_is_injected_as_query_param() {
        let adapter = ApiAdapter {
            secrets: secrets(&[]),
        };
        let schema: SchemaV1 = serde_json::from_value(json!({
            "v": 1,
            "base_url": "https://api.test",
            "since_param": "updated_after",
        }))
        .unwrap();
        let since = DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let request = adapter
            .build_request(&schema, &PageState::Single, Some(since), None)
            .unwrap();
        assert_eq!(request.query.len(), 1);
        assert_eq!(request.query[0].0, "updated_after");
        assert!(request.query[0].1.starts_with("2026-08-01"));
    }

    #[test]
    fn pagination_stops_on_empty_or_short_pages() {
        let offset: PaginationSpec = serde_json::from_value(json!({
            "style": "offset", "page_size": 10,
        }))
        .unwrap();
        let state = PageState::initial(Some(&offset));
        assert_eq!(state, PageState::Offset(0));
        assert_eq!(
            state.advance(&offset, &json!({}), 10),
            Some(PageState::Offset(10))
        );
        assert_eq!(state.advance(&offset, &json!({}), 3), None);
        assert_eq!(state.advance(&offset, &json!({}), 0), None);

        let cursor: PaginationSpec = serde_json::from_value(json!({
            "style": "cursor", "cursor_path": "meta.next",
        }))
        .unwrap();
        let state = PageState::initial(Some(&cursor));
        assert_eq!(
            state.advance(&cursor, &json!({"meta": {"next": "abc"}}), 5),
            Some(PageState::Cursor(Some("abc".to_string())))
        );
        assert_eq!(state.advance(&cursor, &json!({"meta": {}}), 5), None);
    }

    #[test]
    fn parse_items_follows_data_path() {
        let schema: SchemaV1 = serde_json::from_value(json!({
            "v": 1, "base_url": "https://x", "data_path": "data.items",
        }))
        .unwrap();
        let body = json!({"data": {"items": [{"a": 1}, {"a": 2}]}});
        assert_eq!(parse_items(&schema, &body).unwrap().len(), 2);

        let root: SchemaV1 =
            serde_json::from_value(json!({"v": 1, "base_url": "https://x"})).unwrap();
        assert_eq!(
            parse_items(&root, &json!([{"a": 1}])).unwrap().len(),
            1
        );
        assert!(parse_items(&schema, &json!({"data": {}})).is_err());
    }

    #[test]
    fn payload_validation_is_kind_specific() {
        let api_missing_schema = SourcePayload {
            source_type: "api".to_string(),
            careers_url: "https://acme.test".to_string(),
            org_name: None,
            org_type: None,
            parser_hint: None,
            schema: None,
            time_window: None,
            crawl_interval_days: None,
            notes: None,
        };
        assert_eq!(
            validate_source_payload(&api_missing_schema).unwrap_err(),
            ValidationError::MissingField("schema")
        );

        let api_missing_base = SourcePayload {
            schema: Some(json!({"v": 1})),
            ..api_missing_schema.clone()
        };
        assert_eq!(
            validate_source_payload(&api_missing_base).unwrap_err(),
            ValidationError::MissingField("base_url")
        );

        let api_wrong_version = SourcePayload {
            schema: Some(json!({"v": 2, "base_url": "https://x"})),
            ..api_missing_schema.clone()
        };
        assert_eq!(
            validate_source_payload(&api_wrong_version).unwrap_err(),
            ValidationError::MissingField("v")
        );

        let feed_bad_window = SourcePayload {
            source_type: "feed".to_string(),
            time_window: Some("late-night".to_string()),
            ..api_missing_schema.clone()
        };
        assert!(matches!(
            validate_source_payload(&feed_bad_window).unwrap_err(),
            ValidationError::InvalidField { field: "time_window", .. }
        ));

        let unknown = SourcePayload {
            source_type: "carrier-pigeon".to_string(),
            ..api_missing_schema.clone()
        };
        assert!(matches!(
            validate_source_payload(&unknown).unwrap_err(),
            ValidationError::UnknownSourceType(_)
        ));

        let good_feed = SourcePayload {
            source_type: "feed".to_string(),
            time_window: Some("22:00-05:00".to_string()),
            ..api_missing_schema
        };
        let source = validate_source_payload(&good_feed).unwrap();
        assert_eq!(source.kind, SourceKind::Feed);
        assert_eq!(source.time_window_hint(), Some("22:00-05:00"));
        assert_eq!(source.org_name, "acme.test");
    }

    #[test]
    fn field_map_for_api_source_uses_schema_map() {
        let source = api_source(json!({
            "v": 1,
            "base_url": "https://x",
            "map": {"title": "title", "description_snippet": "body"},
        }));
        let map = field_map_for(&source).unwrap();
        assert_eq!(map.get("description_snippet"), Some(&"body".to_string()));

        let page = page_source(None);
        let map = field_map_for(&page).unwrap();
        assert_eq!(map.get("title"), Some(&"title".to_string()));
    }
}
