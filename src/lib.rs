// Request admission layer for the community platform:
// API key registry, fixed-window rate limiting and the gate that combines them.

pub mod clock;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod permissions;
pub mod rate_limit;
pub mod routes;
pub mod security;

use std::sync::Arc;

// Re-export commonly used items
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use database::{ApiKeyStore, Database, MemoryApiKeyStore};
pub use errors::ApiError;
pub use middleware::{CallerIdentity, GatePolicy, SecurityGate};
pub use models::{ApiKey, ApiKeyStatus, CreateApiKeyRequest, RateLimitPolicy, RateLimitResult};
pub use permissions::Permission;
pub use rate_limit::{MemoryRateLimitStore, RateLimitStore};
pub use security::{AdminTokenService, ApiKeyService};

/// Shared services handed to every gate and handler.
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyService>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub admin_tokens: Arc<AdminTokenService>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        api_keys: ApiKeyService,
        rate_limits: Arc<dyn RateLimitStore>,
        admin_tokens: AdminTokenService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api_keys: Arc::new(api_keys),
            rate_limits,
            admin_tokens: Arc::new(admin_tokens),
            clock,
        }
    }
}
