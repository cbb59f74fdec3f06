//! Admin endpoints for API keys and rate-limit counters.
//!
//! Handlers only see requests that already passed their route's
//! [`SecurityGate`](crate::middleware::SecurityGate); the gate policy for each
//! one is set in [`crate::routes`].

use crate::errors::ApiError;
use crate::middleware::CallerIdentity;
use crate::models::{
    ApiKeyFilter, ApiKeyStatus, CreateApiKeyRequest, Pagination, RateLimitTestRequest,
    UpdateApiKeyStatusRequest,
};
use crate::rate_limit::MAX_WINDOW_MS;
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

pub const DEFAULT_TOP_LIMITS: usize = 50;
pub const MAX_TOP_LIMITS: usize = 500;

fn query<T>(extracted: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    extracted
        .map(|Query(q)| q)
        .map_err(|e| ApiError::InvalidRequest(e.body_text()))
}

fn body<T>(extracted: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    extracted
        .map(|Json(b)| b)
        .map_err(|e| ApiError::InvalidRequest(e.body_text()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_key_id(raw: Option<String>) -> Result<Uuid, ApiError> {
    let raw = non_empty(raw).ok_or_else(|| ApiError::InvalidRequest("keyId is required".into()))?;
    Uuid::parse_str(&raw).map_err(|_| ApiError::InvalidRequest(format!("invalid keyId '{}'", raw)))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct ListApiKeysQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    params: Result<Query<ListApiKeysQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let params = query(params)?;
    let status = non_empty(params.status)
        .map(|s| s.parse::<ApiKeyStatus>().map_err(ApiError::InvalidRequest))
        .transpose()?;

    let page = state.api_keys.list_api_keys(
        ApiKeyFilter { status },
        Pagination::new(params.limit, params.skip),
    )?;
    Ok(Json(page))
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: Result<Json<CreateApiKeyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = body(payload)?;
    let created = state.api_keys.create_api_key(payload, &caller.actor())?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "keyId": created.key_id,
            "apiKey": created.api_key,
            "message": "API key created. Store it now; it will not be shown again."
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeApiKeyQuery {
    pub key_id: Option<String>,
    pub reason: Option<String>,
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    params: Result<Query<RevokeApiKeyQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let params = query(params)?;
    let key_id = parse_key_id(params.key_id)?;

    state
        .api_keys
        .revoke_api_key(key_id, &caller.actor(), non_empty(params.reason))
        .map_err(|e| match e {
            ApiError::KeyNotFound(id) => {
                ApiError::InvalidRequest(format!("API key {} not found", id))
            }
            other => other,
        })?;

    Ok(Json(json!({
        "success": true,
        "message": format!("API key {} revoked", key_id)
    })))
}

pub async fn update_api_key_status(
    State(state): State<AppState>,
    payload: Result<Json<UpdateApiKeyStatusRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = body(payload)?;
    let key_id = payload
        .key_id
        .ok_or_else(|| ApiError::InvalidRequest("keyId is required".into()))?;
    let status = payload
        .status
        .ok_or_else(|| ApiError::InvalidRequest("status is required".into()))?;

    let key = state.api_keys.set_api_key_status(key_id, status)?;
    Ok(Json(key))
}

#[derive(Debug, Deserialize)]
pub struct RateLimitQuery {
    pub identifier: Option<String>,
    pub limit: Option<usize>,
    pub action: Option<String>,
}

pub async fn get_rate_limits(
    State(state): State<AppState>,
    params: Result<Query<RateLimitQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let params = query(params)?;

    if let Some(identifier) = non_empty(params.identifier) {
        let usage = state.rate_limits.get_usage(&identifier);
        return Ok(Json(json!({
            "identifier": identifier,
            "usage": usage,
        })));
    }

    let top = params
        .limit
        .unwrap_or(DEFAULT_TOP_LIMITS)
        .clamp(1, MAX_TOP_LIMITS);
    let all = state.rate_limits.get_all_limits();
    let total = all.len();
    let limits: Vec<_> = all.into_iter().take(top).collect();

    Ok(Json(json!({
        "limits": limits,
        "total": total,
        "limit": top,
    })))
}

pub async fn delete_rate_limits(
    State(state): State<AppState>,
    params: Result<Query<RateLimitQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let params = query(params)?;
    let identifier = non_empty(params.identifier);

    match non_empty(params.action).as_deref() {
        Some("cleanup") => {
            let removed = state.rate_limits.cleanup();
            tracing::info!(removed, "rate limit cleanup requested");
            Ok(Json(json!({
                "success": true,
                "action": "cleanup",
                "removed": removed,
            })))
        }
        Some("reset") | None => {
            let identifier = identifier.ok_or_else(|| {
                ApiError::InvalidRequest("identifier is required for reset".into())
            })?;
            let existed = state.rate_limits.reset(&identifier);
            tracing::info!(identifier = %identifier, existed, "rate limit reset");
            Ok(Json(json!({
                "success": true,
                "action": "reset",
                "identifier": identifier,
                "existed": existed,
            })))
        }
        Some(other) => Err(ApiError::InvalidRequest(format!(
            "unknown action '{}', expected cleanup or reset",
            other
        ))),
    }
}

pub async fn test_rate_limit(
    State(state): State<AppState>,
    payload: Result<Json<RateLimitTestRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = body(payload)?;

    let subject = non_empty(payload.identifier)
        .ok_or_else(|| ApiError::InvalidRequest("identifier is required".into()))?;
    let limit = payload
        .limit
        .filter(|l| *l > 0)
        .ok_or_else(|| ApiError::InvalidRequest("limit must be a positive integer".into()))?;
    let window_ms = payload
        .window_ms
        .filter(|w| (1..=MAX_WINDOW_MS).contains(w))
        .ok_or_else(|| {
            ApiError::InvalidRequest(format!("windowMs must be between 1 and {}", MAX_WINDOW_MS))
        })?;
    let category = non_empty(payload.category).unwrap_or_else(|| "test".to_string());

    let identifier = format!("test:{}", subject);
    let result = state
        .rate_limits
        .check_limit(&identifier, limit, window_ms, &category);

    Ok(Json(json!({
        "identifier": identifier,
        "category": category,
        "result": result,
    })))
}
