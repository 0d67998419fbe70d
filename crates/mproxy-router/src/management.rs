//! Management surface under /v0/management: availability introspection and
//! synchronous cooldown/suspension mutation.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use mproxy_core::bootstrap::set_client_enabled;
use mproxy_core::AppState;

pub fn management_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/model-availability", get(model_availability))
        .route(
            "/model-availability/{model_id}/reset",
            post(reset_model_availability),
        )
        .route("/clients", get(list_clients))
        .route("/clients/{client_id}/enabled", post(set_enabled))
        .route("/quota", get(quota))
        .route("/usage", get(usage))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            management_auth,
        ))
        .with_state(state)
}

async fn management_auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.global.load().management_key.clone() else {
        // No key configured: management is open (local setups).
        return Ok(next.run(req).await);
    };
    let presented = extract_management_key(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    if presented != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn extract_management_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-management-key")
        && let Ok(text) = value.to_str()
    {
        let text = text.trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    let auth = headers.get("authorization")?.to_str().ok()?.trim();
    if auth.len() > 7 && auth[..7].eq_ignore_ascii_case("bearer ") {
        let token = auth[7..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

/// GET /v0/management/model-availability
async fn model_availability(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let models = state.registry.unavailable_models();
    Json(json!({
        "models": models,
        "count": models.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    client_id: String,
}

/// POST /v0/management/model-availability/{model_id}/reset
///
/// Clears the quota cooldown and lifts any suspension, synchronously.
async fn reset_model_availability(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    Json(req): Json<ResetRequest>,
) -> impl IntoResponse {
    state.cooldown.clear_quota(&req.client_id, &model_id);
    state.cooldown.resume(&req.client_id, &model_id);
    Json(json!({
        "status": "ok",
        "model_id": model_id,
        "client_id": req.client_id,
    }))
}

/// GET /v0/management/clients
async fn list_clients(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut rows = Vec::new();
    for client in state.pool.all() {
        let token = client.token().await;
        rows.push(json!({
            "client_id": client.client_id,
            "provider": client.provider_tag,
            "kind": client.kind,
            "label": client.label,
            "priority": client.priority,
            "runtime_only": client.runtime_only,
            "expires_at": token.as_ref().map(|t| t.expires_at
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default()),
            "last_verified": token.as_ref().and_then(|t| t.last_verified).map(|at| at
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default()),
        }));
    }
    Json(json!({ "clients": rows }))
}

#[derive(Debug, Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

/// POST /v0/management/clients/{client_id}/enabled
async fn set_enabled(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Json(req): Json<EnabledRequest>,
) -> Response {
    match set_client_enabled(&state, &client_id, req.enabled).await {
        Ok(()) => Json(json!({
            "status": "ok",
            "client_id": client_id,
            "enabled": req.enabled,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

/// GET /v0/management/quota — rate limiter state per token key.
async fn quota(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rows: Vec<serde_json::Value> = state
        .limiter
        .snapshot_all()
        .into_iter()
        .map(|(key, snapshot)| {
            json!({
                "token_key": key,
                "request_count": snapshot.request_count,
                "fail_count": snapshot.fail_count,
                "daily_requests": snapshot.daily_requests,
                "cooldown_remaining_ms": snapshot.cooldown_remaining_ms,
                "suspended": snapshot.suspended,
                "suspend_reason": snapshot.suspend_reason,
            })
        })
        .collect();
    Json(json!({ "quota": rows }))
}

/// GET /v0/management/usage
async fn usage(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.usage.snapshot())
}
