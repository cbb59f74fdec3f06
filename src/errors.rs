use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication required")]
    MissingCredentials,

    #[error("Admin credentials required")]
    AdminRequired,

    #[error("Invalid API key format")]
    InvalidKeyFormat,

    #[error("Invalid checksum")]
    InvalidChecksum,

    #[error("Unknown API key")]
    UnknownApiKey,

    #[error("API key is inactive")]
    KeyInactive,

    #[error("API key has been revoked")]
    KeyRevoked,

    #[error("API key expired")]
    KeyExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        limit: u32,
        remaining: u32,
        reset_time: DateTime<Utc>,
        retry_after_secs: u64,
    },

    #[error("API key not found: {0}")]
    KeyNotFound(Uuid),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingCredentials
            | ApiError::AdminRequired
            | ApiError::InvalidKeyFormat
            | ApiError::InvalidChecksum
            | ApiError::UnknownApiKey
            | ApiError::KeyInactive
            | ApiError::KeyRevoked
            | ApiError::KeyExpired
            | ApiError::InvalidToken
            | ApiError::TokenExpired => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::MissingCredentials | ApiError::AdminRequired => "unauthorized",
            ApiError::InvalidKeyFormat
            | ApiError::InvalidChecksum
            | ApiError::UnknownApiKey
            | ApiError::KeyInactive
            | ApiError::KeyRevoked
            | ApiError::KeyExpired => "invalid_api_key",
            ApiError::InvalidToken | ApiError::TokenExpired => "invalid_token",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ApiError::KeyNotFound(_) => "not_found",
            ApiError::Database(_) | ApiError::Internal(_) => "internal_error",
        }
    }

    /// True for every variant that answers 401.
    pub fn is_auth_error(&self) -> bool {
        self.status() == StatusCode::UNAUTHORIZED
    }
}

/// Writes the `X-RateLimit-*` trio onto a response.
pub fn insert_rate_limit_headers(
    headers: &mut HeaderMap,
    limit: u32,
    remaining: u32,
    reset_time: DateTime<Utc>,
) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(reset_time.timestamp().max(0) as u64),
    );
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        match self {
            ApiError::RateLimitExceeded {
                limit,
                remaining,
                reset_time,
                retry_after_secs,
            } => {
                let body = Json(json!({
                    "error": {
                        "code": code,
                        "message": "Too many requests",
                        "remaining": remaining,
                        "resetTime": reset_time,
                    }
                }));
                let mut response = (status, body).into_response();
                let headers = response.headers_mut();
                insert_rate_limit_headers(headers, limit, remaining, reset_time);
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            ApiError::Database(ref err) => {
                tracing::error!(error = %err, "database failure");
                internal_response(status, code)
            }
            ApiError::Internal(ref detail) => {
                tracing::error!(detail = %detail, "internal failure");
                internal_response(status, code)
            }
            ApiError::InvalidRequest(msg) => (
                status,
                Json(json!({ "error": { "code": code, "message": msg } })),
            )
                .into_response(),
            other => (
                status,
                Json(json!({ "error": { "code": code, "message": other.to_string() } })),
            )
                .into_response(),
        }
    }
}

fn internal_response(status: StatusCode, code: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": "An internal error occurred"
            }
        })),
    )
        .into_response()
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for ApiError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::TokenExpired,
            _ => ApiError::InvalidToken,
        }
    }
}
