//! External content store clients. One request per page, no retries here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tooldir_core::RawRecord;
use tooldir_storage::{classify_status, FetchError, HttpFetcher, RetryDisposition, Retryable};
use tracing::{debug, info, warn};

use crate::normalize::value_text;

pub const CONTENT_STORE_PARTITION: &str = "content-store";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentStoreError {
    #[error("content store unavailable: {0}")]
    Unavailable(String),
    #[error("content store request failed: {0}")]
    Transport(String),
    #[error("content store rejected credentials (HTTP {status})")]
    Auth { status: u16 },
    #[error("content store rejected the request (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("content store page is not parseable: {0}")]
    Schema(String),
    #[error("fixture {path}: {message}")]
    Fixture { path: String, message: String },
}

impl Retryable for ContentStoreError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Unavailable(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFilter {
    pub value: String,
}

impl StatusFilter {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    pub fn matches(&self, record: &RawRecord) -> bool {
        record
            .fields
            .get("status")
            .and_then(value_text)
            .is_some_and(|s| s.eq_ignore_ascii_case(self.value.trim()))
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_all(&self) -> Result<Vec<RawRecord>, ContentStoreError>;

    async fn fetch_by_status(&self, filter: &StatusFilter) -> Result<Vec<RawRecord>, ContentStoreError>;
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    items: Vec<JsonValue>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PageBody {
    Wrapped { data: PageEnvelope },
    Bare(PageEnvelope),
}

/// One decoded page. Items without an id or a `fields` object are counted in `skipped`.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub skipped: usize,
    pub has_more: bool,
    pub page_token: Option<String>,
}

pub fn parse_page(body: &[u8]) -> Result<Page, ContentStoreError> {
    let envelope = match serde_json::from_slice::<PageBody>(body)
        .map_err(|e| ContentStoreError::Schema(e.to_string()))?
    {
        PageBody::Wrapped { data } => data,
        PageBody::Bare(page) => page,
    };

    let mut records = Vec::with_capacity(envelope.items.len());
    let mut skipped = 0;
    for (idx, item) in envelope.items.iter().enumerate() {
        match record_from_item(item) {
            Some(record) => records.push(record),
            None => {
                skipped += 1;
                warn!(index = idx, "skipping content item without record id or fields");
            }
        }
    }
    Ok(Page {
        records,
        skipped,
        has_more: envelope.has_more,
        page_token: envelope.page_token.filter(|t| !t.trim().is_empty()),
    })
}

fn record_from_item(item: &JsonValue) -> Option<RawRecord> {
    let obj = item.as_object()?;
    let record_id = ["record_id", "id"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(value_text))?;
    let fields = obj.get("fields")?.as_object()?.clone();
    Some(RawRecord { record_id, fields })
}

#[derive(Debug, Clone)]
pub struct ContentStoreConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub page_size: u32,
    pub max_pages: u32,
    pub status_param: String,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            page_size: 100,
            max_pages: 200,
            status_param: "status".to_string(),
        }
    }
}

/// Timeouts and refused connections are worth another attempt; redirect loops and
/// malformed requests are not.
fn transport_error(err: FetchError) -> ContentStoreError {
    match err.disposition() {
        RetryDisposition::Retryable => ContentStoreError::Unavailable(err.chain_text()),
        RetryDisposition::NonRetryable => ContentStoreError::Transport(err.chain_text()),
    }
}

/// Paginated JSON API client on top of the shared rate-limited fetcher.
#[derive(Debug, Clone)]
pub struct HttpContentStore {
    config: ContentStoreConfig,
    fetcher: Arc<HttpFetcher>,
}

impl HttpContentStore {
    pub fn new(config: ContentStoreConfig, fetcher: Arc<HttpFetcher>) -> Self {
        Self { config, fetcher }
    }

    pub fn page_url(
        &self,
        page_token: Option<&str>,
        filter: Option<&StatusFilter>,
    ) -> Result<Url, ContentStoreError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| ContentStoreError::Rejected {
                status: 0,
                detail: format!("invalid content store url `{}`: {e}", self.config.base_url),
            })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("page_size", &self.config.page_size.max(1).to_string());
            if let Some(token) = page_token {
                query.append_pair("page_token", token);
            }
            if let Some(filter) = filter {
                query.append_pair(&self.config.status_param, filter.value.trim());
            }
        }
        Ok(url)
    }

    async fn fetch_page(&self, url: &Url) -> Result<Page, ContentStoreError> {
        let resp = self
            .fetcher
            .request(
                CONTENT_STORE_PARTITION,
                Method::GET,
                url.as_str(),
                self.config.token.as_deref(),
            )
            .await
            .map_err(transport_error)?;

        let status = resp.status;
        if status.is_success() {
            if resp.truncated {
                return Err(ContentStoreError::Schema("page body exceeded the size cap".to_string()));
            }
            return parse_page(&resp.body);
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(ContentStoreError::Auth {
                status: status.as_u16(),
            });
        }
        Err(match classify_status(status) {
            RetryDisposition::Retryable => ContentStoreError::Unavailable(format!("HTTP {}", status.as_u16())),
            RetryDisposition::NonRetryable => ContentStoreError::Rejected {
                status: status.as_u16(),
                detail: String::from_utf8_lossy(&resp.body).chars().take(200).collect(),
            },
        })
    }

    async fn fetch_pages(&self, filter: Option<&StatusFilter>) -> Result<Vec<RawRecord>, ContentStoreError> {
        let mut records = Vec::new();
        let mut skipped = 0;
        let mut token: Option<String> = None;
        let max_pages = self.config.max_pages.max(1);

        for page_no in 1..=max_pages {
            let url = self.page_url(token.as_deref(), filter)?;
            let page = self.fetch_page(&url).await?;
            debug!(page_no, records = page.records.len(), has_more = page.has_more, "content page");
            records.extend(page.records);
            skipped += page.skipped;

            match page.page_token {
                Some(next) if page.has_more && token.as_deref() != Some(next.as_str()) => {
                    token = Some(next);
                }
                Some(_) if page.has_more => {
                    warn!(page_no, "content store repeated its page token; stopping pagination");
                    break;
                }
                _ => break,
            }
            if page_no == max_pages {
                warn!(max_pages, "content store page cap reached; listing may be incomplete");
            }
        }

        info!(
            source = self.source_id(),
            records = records.len(),
            skipped,
            filtered = filter.is_some(),
            "content store fetch complete"
        );
        Ok(records)
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    fn source_id(&self) -> &str {
        &self.config.base_url
    }

    async fn fetch_all(&self) -> Result<Vec<RawRecord>, ContentStoreError> {
        self.fetch_pages(None).await
    }

    async fn fetch_by_status(&self, filter: &StatusFilter) -> Result<Vec<RawRecord>, ContentStoreError> {
        self.fetch_pages(Some(filter)).await
    }
}

/// Reads a single page envelope from disk. Used for local runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureContentStore {
    path: PathBuf,
    source_id: String,
}

impl FixtureContentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let source_id = format!("fixture:{}", path.display());
        Self { path, source_id }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<RawRecord>, ContentStoreError> {
        let fixture_err = |message: String| ContentStoreError::Fixture {
            path: self.path.display().to_string(),
            message,
        };
        let body = tokio::fs::read(&self.path)
            .await
            .map_err(|e| fixture_err(e.to_string()))?;
        let page = parse_page(&body).map_err(|e| fixture_err(e.to_string()))?;
        debug!(path = %self.path.display(), records = page.records.len(), skipped = page.skipped, "fixture loaded");
        Ok(page.records)
    }
}

#[async_trait]
impl ContentStore for FixtureContentStore {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_all(&self) -> Result<Vec<RawRecord>, ContentStoreError> {
        self.load().await
    }

    async fn fetch_by_status(&self, filter: &StatusFilter) -> Result<Vec<RawRecord>, ContentStoreError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::time::Duration;
    use tooldir_storage::{HttpClientConfig, TokenBucketConfig};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/records")
    }

    fn store(base_url: String, token: Option<&str>) -> HttpContentStore {
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        HttpContentStore::new(
            ContentStoreConfig {
                base_url,
                token: token.map(str::to_string),
                page_size: 2,
                ..Default::default()
            },
            fetcher,
        )
    }

    async fn paged(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer secret") {
            return (AxumStatus::UNAUTHORIZED, Json(json!({"error": "auth"})));
        }
        let status = q.get("status").cloned();
        let body = match q.get("page_token").map(String::as_str) {
            None => json!({
                "data": {
                    "items": [
                        {"record_id": "rec1", "fields": {"name": "Acme", "status": status}},
                        {"fields": {"name": "no id"}},
                        {"record_id": "rec2", "fields": {"name": "Beta"}}
                    ],
                    "has_more": true,
                    "page_token": "p2"
                }
            }),
            Some("p2") => json!({
                "items": [{"id": "rec3", "fields": {"name": "Gamma"}}],
                "has_more": false
            }),
            Some(_) => return (AxumStatus::BAD_REQUEST, Json(json!({"error": "bad token"}))),
        };
        (AxumStatus::OK, Json(body))
    }

    #[tokio::test]
    async fn follows_pagination_and_skips_malformed_items() {
        let url = serve(Router::new().route("/records", get(paged))).await;
        let records = store(url, Some("secret")).fetch_all().await.unwrap();
        let ids = records.iter().map(|r| r.record_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["rec1", "rec2", "rec3"]);
    }

    #[tokio::test]
    async fn status_filter_is_sent_as_query_parameter() {
        let url = serve(Router::new().route("/records", get(paged))).await;
        let records = store(url, Some("secret"))
            .fetch_by_status(&StatusFilter::new("active"))
            .await
            .unwrap();
        assert_eq!(records[0].fields["status"], json!("active"));
    }

    #[tokio::test]
    async fn missing_credentials_are_not_retryable() {
        let url = serve(Router::new().route("/records", get(paged))).await;
        let err = store(url, None).fetch_all().await.unwrap_err();
        assert_eq!(err, ContentStoreError::Auth { status: 401 });
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn throttling_and_server_errors_are_unavailable() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/records",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        AxumStatus::TOO_MANY_REQUESTS
                    } else {
                        AxumStatus::BAD_GATEWAY
                    }
                }),
            )
            .with_state(hits.clone());
        let url = serve(router).await;
        let store = store(url, None);
        for _ in 0..2 {
            let err = store.fetch_all().await.unwrap_err();
            assert!(matches!(err, ContentStoreError::Unavailable(_)), "{err:?}");
            assert_eq!(err.disposition(), RetryDisposition::Retryable);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_host_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = store(format!("http://{addr}/records"), None)
            .fetch_all()
            .await
            .unwrap_err();
        assert!(matches!(err, ContentStoreError::Unavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn redirect_loops_fail_without_retry() {
        let router = Router::new().route(
            "/records",
            get(|| async { axum::response::Redirect::temporary("/records") }),
        );
        let url = serve(router).await;
        let err = store(url, None).fetch_all().await.unwrap_err();
        assert!(matches!(err, ContentStoreError::Transport(_)), "{err:?}");
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn client_errors_are_rejected_with_body_excerpt() {
        let router = Router::new().route(
            "/records",
            get(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, "page_size too large") }),
        );
        let url = serve(router).await;
        let err = store(url, None).fetch_all().await.unwrap_err();
        assert_eq!(
            err,
            ContentStoreError::Rejected {
                status: 422,
                detail: "page_size too large".into(),
            }
        );
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn rate_limited_fetcher_paces_pages() {
        let started = std::time::Instant::now();
        let fetcher = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                token_bucket: Some(TokenBucketConfig {
                    capacity: 1,
                    refill_every: Duration::from_millis(150),
                }),
                ..HttpClientConfig::default()
            })
            .unwrap(),
        );
        let url = serve(Router::new().route("/records", get(paged))).await;
        let store = HttpContentStore::new(
            ContentStoreConfig {
                base_url: url,
                token: Some("secret".into()),
                page_size: 2,
                ..Default::default()
            },
            fetcher,
        );

        assert_eq!(store.fetch_all().await.unwrap().len(), 3);
        assert_eq!(store.fetch_all().await.unwrap().len(), 3);
        // Four pages through a one-token bucket: three refills.
        assert!(started.elapsed() >= Duration::from_millis(450), "{:?}", started.elapsed());
    }

    #[test]
    fn unparseable_page_is_a_schema_error() {
        assert!(matches!(parse_page(b"<html>"), Err(ContentStoreError::Schema(_))));
        assert!(matches!(parse_page(b"{\"rows\": []}"), Err(ContentStoreError::Schema(_))));
        let page = parse_page(br#"{"items": [42, {"record_id": "r", "fields": []}]}"#).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.skipped, 2);
    }

    #[tokio::test]
    async fn fixture_store_reads_envelope_and_filters_by_status() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/content/records.json");
        let fixture = FixtureContentStore::new(path);
        let all = fixture.fetch_all().await.unwrap();
        assert_eq!(all.len(), 6);
        let active = fixture.fetch_by_status(&StatusFilter::new("Active")).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].record_id, "rec_chatgpt");
    }

    #[tokio::test]
    async fn missing_fixture_is_reported_with_path() {
        let err = FixtureContentStore::new("/nonexistent/records.json")
            .fetch_all()
            .await
            .unwrap_err();
        assert!(matches!(err, ContentStoreError::Fixture { path, .. } if path.contains("nonexistent")));
    }
}
