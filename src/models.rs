use crate::permissions::Permission;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Inactive,
    Revoked,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Inactive => "inactive",
            ApiKeyStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for ApiKeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiKeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ApiKeyStatus::Active),
            "inactive" => Ok(ApiKeyStatus::Inactive),
            "revoked" => Ok(ApiKeyStatus::Revoked),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Request budget: at most `requests` per `window_ms` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub requests: u32,
    pub window_ms: u64,
}

impl RateLimitPolicy {
    pub const fn new(requests: u32, window_ms: u64) -> Self {
        Self {
            requests,
            window_ms,
        }
    }

    pub const fn per_minute(requests: u32) -> Self {
        Self::new(requests, 60_000)
    }

    // Listing keys and inspecting counters
    pub const fn admin_read() -> Self {
        Self::per_minute(100)
    }

    // Revocation, status changes, counter resets
    pub const fn admin_write() -> Self {
        Self::per_minute(30)
    }

    // Minting new key material
    pub const fn key_generation() -> Self {
        Self::per_minute(10)
    }

    // Operator test calls against the limiter itself
    pub const fn diagnostics() -> Self {
        Self::per_minute(20)
    }

    /// True when `self` admits a lower request rate than `other`.
    pub fn is_stricter_than(&self, other: &RateLimitPolicy) -> bool {
        // requests/window compared without division
        (self.requests as u128) * (other.window_ms as u128)
            < (other.requests as u128) * (self.window_ms as u128)
    }
}

/// Optional constraints on where a key may be used from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Restrictions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Restrictions {
    pub fn allows_ip(&self, client_addr: &str) -> bool {
        self.allowed_ips.is_empty()
            || self
                .allowed_ips
                .iter()
                .any(|ip| ip == "*" || ip == client_addr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revocation {
    pub revoked_by: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Stored API key record. `key_hash` is the SHA-256 of the issued key and is
/// never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: Uuid,
    #[serde(skip)]
    pub key_hash: String,
    pub name: String,
    pub description: Option<String>,
    pub permissions: Vec<Permission>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub restrictions: Option<Restrictions>,
    pub status: ApiKeyStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub revoked_by: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApiKeyFilter {
    pub status: Option<ApiKeyStatus>,
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: usize,
    pub skip: usize,
}

impl Pagination {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 100;

    pub fn new(limit: Option<usize>, skip: Option<usize>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            skip: skip.unwrap_or(0),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyPage {
    pub api_keys: Vec<ApiKey>,
    pub total: usize,
    pub limit: usize,
    pub skip: usize,
}

// Request/Response models
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApiKeyRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub restrictions: Option<Restrictions>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedApiKey {
    pub key_id: Uuid,
    /// Plaintext key; only ever returned here.
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateApiKeyStatusRequest {
    pub key_id: Option<Uuid>,
    pub status: Option<ApiKeyStatus>,
}

/// Outcome of a single `check_limit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub total_requests: u32,
}

/// Snapshot of one counter, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitUsage {
    pub identifier: String,
    pub category: String,
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub window_start: DateTime<Utc>,
    pub reset_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitTestRequest {
    pub identifier: Option<String>,
    pub limit: Option<u32>,
    pub window_ms: Option<u64>,
    pub category: Option<String>,
}
