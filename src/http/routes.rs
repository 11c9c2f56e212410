use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;
use serde_json::json;

use crate::http::state::DashboardState;
use crate::message::Location;
use crate::scheduler::Scheduler;

#[derive(Clone)]
struct AppState {
    dashboard: Arc<DashboardState>,
    scheduler: Arc<Scheduler>,
}

pub fn build_router(dashboard: Arc<DashboardState>, scheduler: Arc<Scheduler>) -> Router {
    let state = AppState { dashboard, scheduler };
    Router::new()
        .route("/cluster_updates", get(cluster_updates))
        .route("/cluster_status", get(cluster_status))
        .route("/server_info", post(server_info))
        .route("/node_info", post(node_info))
        .route("/terminate_coros", post(terminate_coros))
        .route("/set_poll_sec", post(set_poll_sec))
        .fallback(static_file)
        .with_state(state)
}

async fn cluster_updates(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.dashboard.updates().await)
}

async fn cluster_status(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.dashboard.status().await)
}

#[derive(Deserialize)]
struct ServerInfoForm {
    location: String,
    /// Accepted for wire compatibility with the original dashboard's
    /// coros-list truncation; the mirror only ever keeps the most recent
    /// completed task per server, so there is nothing left to truncate.
    #[serde(default)]
    #[allow(dead_code)]
    limit: Option<usize>,
}

async fn server_info(State(state): State<AppState>, Form(form): Form<ServerInfoForm>) -> impl IntoResponse {
    let info = match form.location.parse::<Location>() {
        Ok(location) => state.dashboard.server_info(location).await,
        Err(_) => None,
    };
    axum::Json(info.map(|v| serde_json::to_value(v).unwrap_or(json!({}))).unwrap_or(json!({})))
}

#[derive(Deserialize)]
struct NodeInfoForm {
    host: String,
}

async fn node_info(State(state): State<AppState>, Form(form): Form<NodeInfoForm>) -> impl IntoResponse {
    let info = state.dashboard.node_info(&form.host).await;
    axum::Json(info.map(|v| serde_json::to_value(v).unwrap_or(json!({}))).unwrap_or(json!({})))
}

/// Repeated `coro=<task-id>` form fields don't fit a struct-shaped `Form`
/// extractor, so the raw body is decoded as a flat list of pairs instead.
async fn terminate_coros(State(state): State<AppState>, body: axum::body::Bytes) -> impl IntoResponse {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&body).unwrap_or_default();
    let task_ids: Vec<uuid::Uuid> = pairs
        .into_iter()
        .filter(|(key, _)| key == "coro")
        .filter_map(|(_, value)| value.parse().ok())
        .collect();
    let terminated = state.scheduler.terminate_coros(&task_ids).await;
    axum::Json(terminated)
}

#[derive(Deserialize)]
struct SetPollForm {
    timeout: i64,
}

async fn set_poll_sec(State(state): State<AppState>, Form(form): Form<SetPollForm>) -> impl IntoResponse {
    state.dashboard.set_poll_sec(form.timeout).await;
    StatusCode::OK
}

async fn static_file(State(state): State<AppState>, uri: Uri) -> Response {
    let mut rel = uri.path().trim_start_matches('/').to_string();
    if rel.is_empty() || rel == "index.html" {
        rel = "cluster.html".to_string();
    }
    if rel.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = state.dashboard.document_root.join(&rel);

    let Ok(data) = tokio::fs::read(&path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let content_type = match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    };

    if content_type == "text/html" {
        let poll_sec = state.dashboard.poll_sec().await;
        let rendered = String::from_utf8_lossy(&data).replace("%(TIMEOUT)s", &poll_sec.to_string());
        return ([(header::CONTENT_TYPE, content_type)], rendered).into_response();
    }

    let mut headers = axum::http::HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    if content_type == "text/css" || content_type == "text/javascript" {
        headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("private, max-age=86400"));
    }
    (headers, data).into_response()
}
