use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use overleash_lib::metrics::{ClientData, MetricsData};
use overleash_lib::{Constraint, EvalContext, OverleashError};
use serde_json::json;
use tracing::{info, warn};

use super::metrics::metrics;
use super::state::AppState;

// ── Helpers ──────────────────────────────────────────────────

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn feature_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Feature not found")
}

/// Compares an `If-None-Match` value with the current fingerprint. The weak
/// prefix and quotes are ignored.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let candidate = if_none_match.trim();
    let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
    let candidate = candidate.trim_matches('"');
    !candidate.is_empty() && candidate == etag
}

/// Builds an evaluation context from frontend query parameters. Unknown
/// keys and `properties[name]` become properties.
pub fn context_from_query(params: Vec<(String, String)>) -> EvalContext {
    let mut context = EvalContext::default();
    for (key, value) in params {
        match key.as_str() {
            "userId" => context.user_id = Some(value),
            "sessionId" => context.session_id = Some(value),
            "environment" => context.environment = Some(value),
            "appName" => context.app_name = Some(value),
            "currentTime" => context.current_time = Some(value),
            "remoteAddress" => context.remote_address = Some(value),
            _ => {
                let name = key
                    .strip_prefix("properties[")
                    .and_then(|k| k.strip_suffix(']'))
                    .unwrap_or(&key)
                    .to_string();
                context.properties.insert(name, value);
            }
        }
    }
    context
}

// ── Health ───────────────────────────────────────────────────

pub async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ── Client API ───────────────────────────────────────────────

/// GET /api/client/features
pub async fn handle_client_features(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let cached = state.overleash.cached_features().await;
    let etag = format!("W/\"{}\"", cached.etag);

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| etag_matches(v, &cached.etag))
        .unwrap_or(false);

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            cached.json,
        )
            .into_response()
    };

    if let Ok(value) = HeaderValue::from_str(&etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

/// GET /api/client/features/{key}
pub async fn handle_client_feature(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.overleash.feature(&key).await {
        Some(feature) => Json(feature).into_response(),
        None => feature_not_found(),
    }
}

/// POST /api/client/metrics
pub async fn handle_client_metrics(State(state): State<Arc<AppState>>, Json(data): Json<MetricsData>) -> StatusCode {
    state.metrics_sink.record_metrics(data);
    StatusCode::OK
}

/// POST /api/client/register
pub async fn handle_client_register(State(state): State<Arc<AppState>>, Json(data): Json<ClientData>) -> StatusCode {
    state.metrics_sink.record_client(data);
    StatusCode::OK
}

// ── Frontend API ─────────────────────────────────────────────

/// GET /api/frontend
pub async fn handle_frontend(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Json<serde_json::Value> {
    let context = context_from_query(params);
    let toggles = state.overleash.resolve_all(&context, false).await;
    Json(json!({ "toggles": toggles }))
}

/// GET /api/frontend/all
pub async fn handle_frontend_all(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Json<serde_json::Value> {
    let context = context_from_query(params);
    let toggles = state.overleash.resolve_all(&context, true).await;
    Json(json!({ "toggles": toggles }))
}

/// Frontend SDK metrics and registrations are accepted and dropped.
pub async fn handle_frontend_noop() -> StatusCode {
    StatusCode::OK
}

// ── Overrides ────────────────────────────────────────────────

async fn override_response(state: &AppState, key: &str) -> Response {
    Json(json!({
        "featureFlag": key,
        "override": state.overleash.get_override(key).await,
    }))
    .into_response()
}

/// POST /override/{key}/{enabled}
pub async fn handle_add_override(
    State(state): State<Arc<AppState>>,
    Path((key, enabled)): Path<(String, String)>,
) -> Response {
    if state.overleash.feature(&key).await.is_none() {
        return feature_not_found();
    }
    let enabled = enabled == "true";
    state.overleash.add_override(&key, enabled).await;
    metrics().override_changes.with_label_values(&["add"]).inc();
    info!(feature = %key, enabled, "override added");
    override_response(&state, &key).await
}

/// POST /override/constrain/{key}/{enabled}
pub async fn handle_add_override_constraint(
    State(state): State<Arc<AppState>>,
    Path((key, enabled)): Path<(String, String)>,
    Json(constraint): Json<Constraint>,
) -> Response {
    if state.overleash.feature(&key).await.is_none() {
        return feature_not_found();
    }
    let enabled = enabled == "true";
    state
        .overleash
        .add_override_constraint(&key, enabled, constraint)
        .await;
    metrics().override_changes.with_label_values(&["constrain"]).inc();
    info!(feature = %key, enabled, "override constraint added");
    override_response(&state, &key).await
}

/// DELETE /override/{key}
pub async fn handle_delete_override(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    if state.overleash.feature(&key).await.is_none() {
        return feature_not_found();
    }
    state.overleash.delete_override(&key).await;
    metrics().override_changes.with_label_values(&["delete"]).inc();
    info!(feature = %key, "override deleted");
    override_response(&state, &key).await
}

/// DELETE /overrides
pub async fn handle_delete_overrides(State(state): State<Arc<AppState>>) -> StatusCode {
    state.overleash.delete_all_overrides().await;
    metrics().override_changes.with_label_values(&["clear"]).inc();
    info!("all overrides deleted");
    StatusCode::NO_CONTENT
}

/// GET /overrides
pub async fn handle_list_overrides(State(state): State<Arc<AppState>>) -> Response {
    Json(state.overleash.overrides().await).into_response()
}

// ── Control ──────────────────────────────────────────────────

pub async fn handle_pause(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.overleash.set_paused(true).await;
    metrics().override_changes.with_label_values(&["pause"]).inc();
    info!("overrides paused");
    Json(json!({ "paused": true }))
}

pub async fn handle_unpause(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.overleash.set_paused(false).await;
    metrics().override_changes.with_label_values(&["unpause"]).inc();
    info!("overrides resumed");
    Json(json!({ "paused": false }))
}

/// POST /environment/{idx}
pub async fn handle_set_environment(State(state): State<Arc<AppState>>, Path(index): Path<usize>) -> Response {
    match state.overleash.set_active_environment(index).await {
        Ok(()) => {
            info!(environment = index, "active environment changed");
            Json(json!({ "activeEnvironment": index })).into_response()
        }
        Err(e @ OverleashError::InvalidEnvironmentIndex { .. }) => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /refresh
pub async fn handle_refresh(State(state): State<Arc<AppState>>) -> Response {
    match state.overleash.refresh_feature_files().await {
        Ok(()) => {
            metrics().refresh_total.with_label_values(&["api", "ok"]).inc();
            Json(json!({ "status": "ok" })).into_response()
        }
        Err(e) => {
            metrics().refresh_total.with_label_values(&["api", "error"]).inc();
            warn!(error = %e, "manual refresh failed");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// GET /status
pub async fn handle_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let o = &state.overleash;
    Json(json!({
        "instanceId": o.instance_id(),
        "remotes": o.remotes().await,
        "activeEnvironment": o.active_environment_index().await,
        "paused": o.is_paused().await,
        "lastSync": o.last_sync().await,
        "overrides": o.overrides().await.len(),
        "streamer": state.config.streamer,
        "delta": state.config.delta,
    }))
}

/// POST /api/webhook
pub async fn handle_webhook(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.overleash.webhook_received();
    metrics().refresh_total.with_label_values(&["webhook", "scheduled"]).inc();
    Json(json!({ "status": "ok" }))
}
