use crate::errors::ApiError;
use crate::models::{ApiKey, ApiKeyFilter, ApiKeyStatus, Pagination, Revocation};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Persistence for API key records.
///
/// Stores never rewrite `key_hash` after `insert`, and refuse to move a
/// revoked key to any other status.
pub trait ApiKeyStore: Send + Sync {
    fn insert(&self, key: &ApiKey) -> Result<(), ApiError>;

    fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKey>, ApiError>;

    fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, ApiError>;

    /// Newest first. Returns the page and the total number of matches.
    fn list(
        &self,
        filter: &ApiKeyFilter,
        pagination: Pagination,
    ) -> Result<(Vec<ApiKey>, usize), ApiError>;

    /// Returns `false` when no key has this id. Revocation details are only
    /// written on the transition into `revoked`; an already revoked key keeps
    /// its first record.
    fn set_status(
        &self,
        id: Uuid,
        status: ApiKeyStatus,
        revocation: Option<&Revocation>,
    ) -> Result<bool, ApiError>;

    fn record_usage(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ApiError>;
}

fn terminal_status_error() -> ApiError {
    ApiError::InvalidRequest("revoked API keys cannot change status".to_string())
}

/// In-process store for tests and single-node development.
#[derive(Clone, Default)]
pub struct MemoryApiKeyStore {
    keys: Arc<Mutex<HashMap<Uuid, ApiKey>>>,
}

impl MemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<Uuid, ApiKey>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ApiKeyStore for MemoryApiKeyStore {
    fn insert(&self, key: &ApiKey) -> Result<(), ApiError> {
        let mut keys = self.keys();
        if keys.contains_key(&key.id) || keys.values().any(|k| k.key_hash == key.key_hash) {
            return Err(ApiError::Internal("duplicate api key record".to_string()));
        }
        keys.insert(key.id, key.clone());
        Ok(())
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKey>, ApiError> {
        Ok(self.keys().get(&id).cloned())
    }

    fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, ApiError> {
        Ok(self
            .keys()
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    fn list(
        &self,
        filter: &ApiKeyFilter,
        pagination: Pagination,
    ) -> Result<(Vec<ApiKey>, usize), ApiError> {
        let mut matching: Vec<ApiKey> = self
            .keys()
            .values()
            .filter(|k| filter.status.map_or(true, |status| k.status == status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(pagination.skip)
            .take(pagination.limit)
            .collect();
        Ok((page, total))
    }

    fn set_status(
        &self,
        id: Uuid,
        status: ApiKeyStatus,
        revocation: Option<&Revocation>,
    ) -> Result<bool, ApiError> {
        let mut keys = self.keys();
        let Some(key) = keys.get_mut(&id) else {
            return Ok(false);
        };
        if key.status == ApiKeyStatus::Revoked {
            return if status == ApiKeyStatus::Revoked {
                Ok(true)
            } else {
                Err(terminal_status_error())
            };
        }
        key.status = status;
        if let Some(revocation) = revocation {
            key.revoked_by = Some(revocation.revoked_by.clone());
            key.revoked_at = Some(revocation.revoked_at);
            key.revocation_reason = revocation.reason.clone();
        }
        Ok(true)
    }

    fn record_usage(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ApiError> {
        if let Some(key) = self.keys().get_mut(&id) {
            key.last_used_at = Some(at);
            key.usage_count += 1;
        }
        Ok(())
    }
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const SELECT_API_KEY: &str = "SELECT id, key_hash, name, description, permissions, rate_limit, \
     restrictions, status, expires_at, created_by, created_at, revoked_by, revoked_at, \
     revocation_reason, last_used_at, usage_count FROM api_keys";

impl Database {
    pub fn new(path: &str) -> Result<Self, ApiError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, ApiError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ApiError> {
        conn.execute_batch(include_str!("../db/schema.sql"))?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.conn
            .lock()
            .map_err(|_| ApiError::Internal("database connection lock poisoned".to_string()))
    }
}

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|text| serde_json::from_str(&text).map_err(|e| conversion_error(index, e)))
        .transpose()
}

fn row_to_api_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let id: String = row.get(0)?;
    let status: String = row.get(7)?;

    Ok(ApiKey {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        key_hash: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        permissions: json_column(row, 4)?.unwrap_or_default(),
        rate_limit: json_column(row, 5)?,
        restrictions: json_column(row, 6)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(7, Type::Text, e.into())
        })?,
        expires_at: row.get(8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
        revoked_by: row.get(11)?,
        revoked_at: row.get(12)?,
        revocation_reason: row.get(13)?,
        last_used_at: row.get(14)?,
        usage_count: row.get(15)?,
    })
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, ApiError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| ApiError::Internal(e.to_string()))
}

impl ApiKeyStore for Database {
    fn insert(&self, key: &ApiKey) -> Result<(), ApiError> {
        let permissions = serde_json::to_string(&key.permissions)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let rate_limit = to_json(&key.rate_limit)?;
        let restrictions = to_json(&key.restrictions)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO api_keys (id, key_hash, name, description, permissions, rate_limit, restrictions, status, expires_at, created_by, created_at, usage_count) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                key.id.to_string(),
                key.key_hash,
                key.name,
                key.description,
                permissions,
                rate_limit,
                restrictions,
                key.status.as_str(),
                key.expires_at,
                key.created_by,
                key.created_at,
                key.usage_count,
            ],
        )?;
        Ok(())
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKey>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?", SELECT_API_KEY))?;
        let key = stmt
            .query_row(params![id.to_string()], row_to_api_key)
            .optional()?;
        Ok(key)
    }

    fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE key_hash = ?", SELECT_API_KEY))?;
        let key = stmt.query_row(params![key_hash], row_to_api_key).optional()?;
        Ok(key)
    }

    fn list(
        &self,
        filter: &ApiKeyFilter,
        pagination: Pagination,
    ) -> Result<(Vec<ApiKey>, usize), ApiError> {
        let status = filter.status.map(|s| s.as_str());
        let limit = i64::try_from(pagination.limit).unwrap_or(i64::MAX);
        let skip = i64::try_from(pagination.skip).unwrap_or(i64::MAX);

        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE (?1 IS NULL OR status = ?1)",
            params![status],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC, id ASC LIMIT ?2 OFFSET ?3",
            SELECT_API_KEY
        ))?;
        let keys = stmt
            .query_map(params![status, limit, skip], row_to_api_key)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((keys, total as usize))
    }

    fn set_status(
        &self,
        id: Uuid,
        status: ApiKeyStatus,
        revocation: Option<&Revocation>,
    ) -> Result<bool, ApiError> {
        let conn = self.conn()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM api_keys WHERE id = ?",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match current.as_deref() {
            None => return Ok(false),
            Some("revoked") if status != ApiKeyStatus::Revoked => {
                return Err(terminal_status_error())
            }
            Some("revoked") => return Ok(true),
            _ => {}
        }

        // The status guard keeps a racing revocation from replacing the first record.
        match revocation {
            Some(revocation) => conn.execute(
                "UPDATE api_keys SET status = ?, revoked_by = ?, revoked_at = ?, revocation_reason = ? WHERE id = ? AND status <> 'revoked'",
                params![
                    status.as_str(),
                    revocation.revoked_by,
                    revocation.revoked_at,
                    revocation.reason,
                    id.to_string(),
                ],
            )?,
            None => conn.execute(
                "UPDATE api_keys SET status = ? WHERE id = ?",
                params![status.as_str(), id.to_string()],
            )?,
        };
        Ok(true)
    }

    fn record_usage(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?, usage_count = usage_count + 1 WHERE id = ?",
            params![at, id.to_string()],
        )?;
        Ok(())
    }
}
