//! Axum read API and operator endpoints for the tool directory.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tooldir_core::{CacheKey, Tool, ToolStatus};
use tooldir_storage::StoreError;
use tooldir_sync::{CacheRead, SyncRuntime};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "tooldir-web";

#[derive(Clone)]
pub struct AppState {
    pub runtime: SyncRuntime,
}

impl AppState {
    pub fn new(runtime: SyncRuntime) -> Self {
        Self { runtime }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ToolsQuery {
    category: Option<String>,
    search: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ToolsPage {
    pub tools: Vec<Tool>,
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
    pub page: usize,
    pub total_pages: usize,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ToolDetail {
    pub tool: Tool,
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Deserialize, Default)]
struct RefreshQuery {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    dry_run: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/tools", get(tools_handler))
        .route("/api/tools/{id}", get(tool_detail_handler))
        .route("/api/categories", get(categories_handler))
        .route("/admin/refresh", post(admin_refresh_handler))
        .route("/admin/probe", post(admin_probe_handler))
        .route("/admin/cleanup", post(admin_cleanup_handler))
        .route("/admin/tools/{id}/status", post(admin_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(runtime: SyncRuntime) -> anyhow::Result<()> {
    let port = runtime.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "tooldir web listening");
    axum::serve(listener, app(AppState::new(runtime))).await?;
    Ok(())
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

/// Only a cold key with a failed first load ends up here.
fn data_unavailable(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "no cached data to serve");
    json_error(StatusCode::SERVICE_UNAVAILABLE, "data unavailable")
}

async fn read_key(state: &AppState, key: &CacheKey) -> Result<CacheRead, Response> {
    state.runtime.read(key).await.map_err(data_unavailable)
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "cache": state.runtime.cache.stats(),
    }))
    .into_response()
}

async fn tools_handler(State(state): State<Arc<AppState>>, Query(query): Query<ToolsQuery>) -> Response {
    let category = query.category.as_deref().map(str::trim).filter(|c| !c.is_empty());
    let search = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let key = match (category, search) {
        (Some(c), _) => CacheKey::category(state.runtime.canonical_category(c)),
        (None, Some(s)) => CacheKey::search(s),
        (None, None) => CacheKey::All,
    };

    let read = match read_key(&state, &key).await {
        Ok(read) => read,
        Err(resp) => return resp,
    };

    let filtered = read
        .tools
        .iter()
        .filter(|t| match (category, search) {
            (Some(_), Some(s)) => t.matches_search(s),
            _ => true,
        })
        .cloned()
        .collect::<Vec<_>>();
    let (tools, page, total_pages) = paginate(filtered.clone(), query.page, query.per_page);

    Json(ToolsPage {
        tools,
        fetched_at: read.fetched_at,
        stale: read.is_stale(),
        page,
        total_pages,
        total: filtered.len(),
    })
    .into_response()
}

async fn tool_detail_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    let read = match read_key(&state, &CacheKey::All).await {
        Ok(read) => read,
        Err(resp) => return resp,
    };
    match read.tools.iter().find(|t| t.id == id) {
        Some(tool) => Json(ToolDetail {
            tool: tool.clone(),
            fetched_at: read.fetched_at,
            stale: read.is_stale(),
        })
        .into_response(),
        None => json_error(StatusCode::NOT_FOUND, "tool not found"),
    }
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> Response {
    let read = match read_key(&state, &CacheKey::All).await {
        Ok(read) => read,
        Err(resp) => return resp,
    };
    Json(serde_json::json!({
        "categories": category_counts(&read.tools),
        "fetched_at": read.fetched_at,
        "stale": read.is_stale(),
    }))
    .into_response()
}

async fn admin_refresh_handler(State(state): State<Arc<AppState>>, Query(query): Query<RefreshQuery>) -> Response {
    match query.key.as_deref() {
        Some(raw) => {
            let key = match raw.parse::<CacheKey>() {
                Ok(CacheKey::Category(c)) => CacheKey::category(state.runtime.canonical_category(&c)),
                Ok(key) => key,
                Err(err) => return json_error(StatusCode::BAD_REQUEST, err.to_string()),
            };
            match state.runtime.refresh(&key).await {
                Ok(read) => Json(serde_json::json!({
                    "key": key.to_string(),
                    "tools": read.tools.len(),
                    "fetched_at": read.fetched_at,
                    "stale": read.is_stale(),
                }))
                .into_response(),
                Err(err) => data_unavailable(err),
            }
        }
        None => match state.runtime.sync_once().await {
            Ok(report) => Json(report).into_response(),
            Err(err) => server_error(err),
        },
    }
}

async fn admin_probe_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.probe_once().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn admin_cleanup_handler(State(state): State<Arc<AppState>>, Query(query): Query<CleanupQuery>) -> Response {
    let dry_run = query.dry_run.unwrap_or(true);
    match state.runtime.cleanup(dry_run).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

async fn admin_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<StatusBody>,
) -> Response {
    let status = match body.status.parse::<ToolStatus>() {
        Ok(status) => status,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match state.runtime.lifecycle.set_status(&id, status).await {
        Ok(tool) => Json(tool).into_response(),
        Err(StoreError::NotFound(_)) => json_error(StatusCode::NOT_FOUND, "tool not found"),
        Err(err) => server_error(err.into()),
    }
}

fn category_counts(tools: &[Tool]) -> Vec<CategoryCount> {
    let mut counts = BTreeMap::<String, usize>::new();
    for tool in tools {
        *counts.entry(tool.category.clone()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(category, count)| CategoryCount { category, count })
        .collect()
}

fn paginate(all: Vec<Tool>, page: Option<usize>, per_page: Option<usize>) -> (Vec<Tool>, usize, usize) {
    let per_page = per_page.unwrap_or(20).clamp(1, 200);
    let total_pages = all.len().max(1).div_ceil(per_page);
    let page = page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let rows = all.into_iter().skip(start).take(per_page).collect::<Vec<_>>();
    (rows, page, total_pages)
}
