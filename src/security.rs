use crate::clock::{Clock, SystemClock};
use crate::database::ApiKeyStore;
use crate::errors::ApiError;
use crate::models::{
    ApiKey, ApiKeyFilter, ApiKeyPage, ApiKeyStatus, CreateApiKeyRequest, CreatedApiKey,
    Pagination, Revocation,
};
use crate::permissions::{has_permission, Permission};
use chrono::Duration;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

const BASE32: base32::Alphabet = base32::Alphabet::RFC4648 { padding: false };

pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn key_checksum(prefix: &str, env: &str, version: &str, timestamp: &str, random: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(env.as_bytes());
    hasher.update(version.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(random);
    hasher.finalize()[..4].to_vec()
}

/// Issues, looks up and retires API keys.
#[derive(Clone)]
pub struct ApiKeyService {
    store: Arc<dyn ApiKeyStore>,
    clock: Arc<dyn Clock>,
    pub prefix: String,
    pub environment: String,
    pub version: i32,
}

impl ApiKeyService {
    pub fn new(store: Arc<dyn ApiKeyStore>, prefix: String, environment: String) -> Self {
        Self::with_clock(store, prefix, environment, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ApiKeyStore>,
        prefix: String,
        environment: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            prefix,
            environment,
            version: 1,
        }
    }

    // Generate 160-bit API key, returning it with its storage hash
    pub fn generate_api_key(&self) -> (String, String) {
        let mut random_bytes = [0u8; 20];
        rand::thread_rng().fill(&mut random_bytes);

        let version = format!("v{}", self.version);
        let timestamp = (self.clock.now().timestamp() as u32).to_string();
        let checksum = key_checksum(
            &self.prefix,
            &self.environment,
            &version,
            &timestamp,
            &random_bytes,
        );

        // Format: prefix_env_version_timestamp_random_checksum
        let key_string = format!(
            "{}_{}_{}_{}_{}_{}",
            self.prefix,
            self.environment,
            version,
            timestamp,
            base32::encode(BASE32, &random_bytes),
            base32::encode(BASE32, &checksum)
        );

        let key_hash = hash_api_key(&key_string);
        (key_string, key_hash)
    }

    pub fn validate_api_key_format(&self, key: &str) -> Result<(), ApiError> {
        let parts: Vec<&str> = key.split('_').collect();
        let [prefix, env, version, timestamp, random_part, checksum_part] = parts[..] else {
            return Err(ApiError::InvalidKeyFormat);
        };

        if prefix != self.prefix || env != self.environment {
            return Err(ApiError::InvalidKeyFormat);
        }
        if !version.starts_with('v') || version[1..].parse::<i32>().is_err() {
            return Err(ApiError::InvalidKeyFormat);
        }
        timestamp
            .parse::<u32>()
            .map_err(|_| ApiError::InvalidKeyFormat)?;

        let random_bytes =
            base32::decode(BASE32, random_part).ok_or(ApiError::InvalidKeyFormat)?;
        let provided = base32::decode(BASE32, checksum_part).ok_or(ApiError::InvalidChecksum)?;
        let expected = key_checksum(prefix, env, version, timestamp, &random_bytes);

        if provided != expected {
            return Err(ApiError::InvalidChecksum);
        }
        Ok(())
    }

    pub fn create_api_key(
        &self,
        request: CreateApiKeyRequest,
        created_by: &str,
    ) -> Result<CreatedApiKey, ApiError> {
        let name = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ApiError::InvalidRequest("name is required".to_string()))?
            .to_string();

        let scopes = request
            .permissions
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ApiError::InvalidRequest("permissions are required".to_string()))?;
        let mut permissions = Vec::with_capacity(scopes.len());
        for scope in &scopes {
            let permission = Permission::parse_known(scope)?;
            if !permissions.contains(&permission) {
                permissions.push(permission);
            }
        }

        if let Some(policy) = &request.rate_limit {
            if policy.requests == 0 || policy.window_ms == 0 {
                return Err(ApiError::InvalidRequest(
                    "rateLimit requests and windowMs must be positive".to_string(),
                ));
            }
        }

        let now = self.clock.now();
        if request.expires_at.is_some_and(|at| at <= now) {
            return Err(ApiError::InvalidRequest(
                "expiresAt must be in the future".to_string(),
            ));
        }

        let (api_key, key_hash) = self.generate_api_key();
        let record = ApiKey {
            id: Uuid::new_v4(),
            key_hash,
            name,
            description: request.description,
            permissions,
            rate_limit: request.rate_limit,
            restrictions: request.restrictions,
            status: ApiKeyStatus::Active,
            expires_at: request.expires_at,
            created_by: created_by.to_string(),
            created_at: now,
            revoked_by: None,
            revoked_at: None,
            revocation_reason: None,
            last_used_at: None,
            usage_count: 0,
        };

        self.store.insert(&record)?;
        tracing::info!(key_id = %record.id, name = %record.name, created_by, "API key created");

        Ok(CreatedApiKey {
            key_id: record.id,
            api_key,
        })
    }

    pub fn get_api_key(&self, key_id: Uuid) -> Result<ApiKey, ApiError> {
        self.store
            .find_by_id(key_id)?
            .ok_or(ApiError::KeyNotFound(key_id))
    }

    pub fn list_api_keys(
        &self,
        filter: ApiKeyFilter,
        pagination: Pagination,
    ) -> Result<ApiKeyPage, ApiError> {
        let (api_keys, total) = self.store.list(&filter, pagination)?;
        Ok(ApiKeyPage {
            api_keys,
            total,
            limit: pagination.limit,
            skip: pagination.skip,
        })
    }

    /// Moves a key to `revoked`. Revoking twice keeps the first record; the
    /// stores enforce that too, so concurrent revocations cannot overwrite it.
    pub fn revoke_api_key(
        &self,
        key_id: Uuid,
        revoked_by: &str,
        reason: Option<String>,
    ) -> Result<(), ApiError> {
        let key = self.get_api_key(key_id)?;
        if key.status == ApiKeyStatus::Revoked {
            tracing::debug!(key_id = %key_id, "API key already revoked");
            return Ok(());
        }

        let revocation = Revocation {
            revoked_by: revoked_by.to_string(),
            revoked_at: self.clock.now(),
            reason,
        };
        if !self
            .store
            .set_status(key_id, ApiKeyStatus::Revoked, Some(&revocation))?
        {
            return Err(ApiError::KeyNotFound(key_id));
        }

        tracing::info!(
            key_id = %key_id,
            revoked_by,
            reason = revocation.reason.as_deref().unwrap_or(""),
            "API key revoked"
        );
        Ok(())
    }

    /// Disables or re-enables a key. Use [`Self::revoke_api_key`] to revoke.
    pub fn set_api_key_status(
        &self,
        key_id: Uuid,
        status: ApiKeyStatus,
    ) -> Result<ApiKey, ApiError> {
        if status == ApiKeyStatus::Revoked {
            return Err(ApiError::InvalidRequest(
                "use revocation to revoke a key".to_string(),
            ));
        }
        if !self.store.set_status(key_id, status, None)? {
            return Err(ApiError::KeyNotFound(key_id));
        }
        tracing::info!(key_id = %key_id, status = %status, "API key status changed");
        self.get_api_key(key_id)
    }

    /// Resolves presented key material to an active, unexpired record.
    pub fn authenticate(&self, presented: &str) -> Result<ApiKey, ApiError> {
        self.validate_api_key_format(presented)?;

        let mut api_key = self
            .store
            .find_by_hash(&hash_api_key(presented))?
            .ok_or(ApiError::UnknownApiKey)?;

        match api_key.status {
            ApiKeyStatus::Revoked => return Err(ApiError::KeyRevoked),
            ApiKeyStatus::Inactive => return Err(ApiError::KeyInactive),
            ApiKeyStatus::Active => {}
        }

        let now = self.clock.now();
        if api_key.is_expired(now) {
            return Err(ApiError::KeyExpired);
        }

        if let Err(e) = self.store.record_usage(api_key.id, now) {
            tracing::warn!(key_id = %api_key.id, error = %e, "failed to record API key usage");
        } else {
            api_key.last_used_at = Some(now);
            api_key.usage_count += 1;
        }

        Ok(api_key)
    }

    pub fn has_permission(key: &ApiKey, required: &str) -> bool {
        has_permission(&key.permissions, required)
    }
}

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub role: String,
    pub exp: i64, // expiration time
    pub iat: i64, // issued at
}

/// Signs and checks admin session tokens (HS256 JWTs).
///
/// Issue and expiry checks both read the injected clock.
#[derive(Clone)]
pub struct AdminTokenService {
    secret_key: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl AdminTokenService {
    pub fn new(secret_key: String, ttl: Duration) -> Self {
        Self::with_clock(secret_key, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(secret_key: String, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret_key,
            ttl,
            clock,
        }
    }

    pub fn issue_admin_token(&self, subject: &str) -> Result<String, ApiError> {
        let now = self.clock.now();
        let claims = AdminClaims {
            sub: subject.to_string(),
            role: ADMIN_ROLE.to_string(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret_key.as_ref()),
        )?;
        Ok(token)
    }

    pub fn validate_admin_token(&self, token: &str) -> Result<AdminClaims, ApiError> {
        let mut validation = Validation::default();
        // exp is still required, but compared against our clock below
        validation.validate_exp = false;

        let token_data = decode::<AdminClaims>(
            token,
            &DecodingKey::from_secret(self.secret_key.as_ref()),
            &validation,
        )?;

        let claims = token_data.claims;
        if claims.role != ADMIN_ROLE {
            return Err(ApiError::InvalidToken);
        }
        if claims.exp <= self.clock.now().timestamp() {
            return Err(ApiError::TokenExpired);
        }
        Ok(claims)
    }
}
