//! Admission gate for protected routes.
//!
//! A [`SecurityGate`] runs an ordered list of [`GateStage`]s over each request.
//! Every stage either rejects with an [`ApiError`] or enriches the shared
//! [`GateContext`] and lets the next stage run. Stage order:
//!
//! 1. [`ResolveIdentity`]: reads admin token / API key, records who is calling
//! 2. [`RateLimitStage`]: counts the request against the caller's window
//! 3. [`AdmissionStage`]: enforces `admin_only` and rejects bad credentials
//! 4. [`AuthorizationStage`]: checks the required permission and key restrictions
//!
//! The rate-limit stage runs before the credential and permission checks, so a
//! caller who fails either of them still spends a request from its window.

use crate::errors::{insert_rate_limit_headers, ApiError};
use crate::models::{ApiKey, RateLimitPolicy, RateLimitResult};
use crate::permissions::{Permission, ADMIN_SCOPE};
use crate::security::{AdminClaims, ApiKeyService};
use crate::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
pub const ADMIN_TOKEN_COOKIE: &str = "admin_token";
pub const API_KEY_HEADER: &str = "x-api-key";

/// Per-route admission settings.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    /// Label for the endpoint group; namespaces rate-limit counters.
    pub category: &'static str,
    pub admin_only: bool,
    pub required_permission: Option<String>,
    pub rate_limit: Option<RateLimitPolicy>,
}

impl GatePolicy {
    pub fn new(category: &'static str) -> Self {
        Self {
            category,
            admin_only: false,
            required_permission: None,
            rate_limit: None,
        }
    }

    pub fn admin(category: &'static str, rate_limit: RateLimitPolicy) -> Self {
        Self::new(category).admin_only().rate_limited(rate_limit)
    }

    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }

    pub fn require(mut self, permission: impl Into<String>) -> Self {
        self.required_permission = Some(permission.into());
        self
    }

    pub fn rate_limited(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }
}

/// Who passed the gate. Inserted into request extensions for handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum CallerIdentity {
    Admin {
        subject: String,
    },
    ApiKey {
        key_id: uuid::Uuid,
        name: String,
        permissions: Vec<Permission>,
    },
    Anonymous {
        client_addr: String,
    },
}

impl CallerIdentity {
    /// Actor name recorded on audit fields such as `createdBy`.
    pub fn actor(&self) -> String {
        match self {
            CallerIdentity::Admin { subject } => subject.clone(),
            CallerIdentity::ApiKey { key_id, .. } => format!("apikey:{}", key_id),
            CallerIdentity::Anonymous { client_addr } => format!("anonymous:{}", client_addr),
        }
    }
}

/// The parts of a request the stages look at.
#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    pub client_addr: String,
    pub admin_token: Option<String>,
    pub api_key: Option<String>,
}

impl GateRequest {
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        Self {
            client_addr: client_address(headers, peer),
            admin_token: header_str(headers, ADMIN_TOKEN_HEADER)
                .or_else(|| cookie_value(headers, ADMIN_TOKEN_COOKIE)),
            api_key: header_str(headers, API_KEY_HEADER).or_else(|| bearer_token(headers)),
        }
    }
}

#[derive(Debug, Default)]
pub struct GateContext {
    pub admin: Option<AdminClaims>,
    pub api_key: Option<ApiKey>,
    /// First failure seen while resolving presented credentials.
    pub credential_error: Option<ApiError>,
    pub rate_limit: Option<RateLimitResult>,
}

impl GateContext {
    pub fn identity(&self, request: &GateRequest) -> CallerIdentity {
        if let Some(claims) = &self.admin {
            return CallerIdentity::Admin {
                subject: claims.sub.clone(),
            };
        }
        if let Some(key) = &self.api_key {
            return CallerIdentity::ApiKey {
                key_id: key.id,
                name: key.name.clone(),
                permissions: key.permissions.clone(),
            };
        }
        CallerIdentity::Anonymous {
            client_addr: request.client_addr.clone(),
        }
    }

    fn is_admin(&self) -> bool {
        self.admin.is_some()
            || self
                .api_key
                .as_ref()
                .is_some_and(|key| ApiKeyService::has_permission(key, ADMIN_SCOPE))
    }

    fn take_credential_error(&mut self) -> Option<ApiError> {
        self.credential_error.take()
    }
}

pub trait GateStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, request: &GateRequest, ctx: &mut GateContext) -> Result<(), ApiError>;
}

pub struct ResolveIdentity {
    state: AppState,
}

impl GateStage for ResolveIdentity {
    fn name(&self) -> &'static str {
        "resolve_identity"
    }

    fn evaluate(&self, request: &GateRequest, ctx: &mut GateContext) -> Result<(), ApiError> {
        if let Some(token) = &request.admin_token {
            match self.state.admin_tokens.validate_admin_token(token) {
                Ok(claims) => ctx.admin = Some(claims),
                Err(e) => {
                    tracing::debug!(error = %e, "admin token rejected");
                    ctx.credential_error.get_or_insert(e);
                }
            }
        }

        if let Some(presented) = &request.api_key {
            match self.state.api_keys.authenticate(presented) {
                Ok(key) => ctx.api_key = Some(key),
                Err(e) if e.is_auth_error() => {
                    tracing::debug!(error = %e, "API key rejected");
                    ctx.credential_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub struct RateLimitStage {
    state: AppState,
    category: &'static str,
    policy: RateLimitPolicy,
}

impl RateLimitStage {
    /// The key's own budget wins only when it is stricter than the route's.
    fn effective_policy(&self, key: Option<&ApiKey>) -> RateLimitPolicy {
        match key.and_then(|k| k.rate_limit) {
            Some(own) if own.is_stricter_than(&self.policy) => own,
            _ => self.policy,
        }
    }

    fn identifier(&self, request: &GateRequest, key: Option<&ApiKey>) -> String {
        match key {
            Some(key) => format!("{}:key:{}", self.category, key.id),
            None => format!("{}:ip:{}", self.category, request.client_addr),
        }
    }
}

impl GateStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn evaluate(&self, request: &GateRequest, ctx: &mut GateContext) -> Result<(), ApiError> {
        let key = ctx.api_key.as_ref();
        let policy = self.effective_policy(key);
        let identifier = self.identifier(request, key);

        let result = self.state.rate_limits.check_limit(
            &identifier,
            policy.requests,
            policy.window_ms,
            self.category,
        );
        ctx.rate_limit = Some(result);

        if result.allowed {
            return Ok(());
        }

        tracing::warn!(
            identifier = %identifier,
            count = result.total_requests,
            limit = result.limit,
            "rate limit exceeded"
        );
        let retry_after_secs = (result.reset_time - self.state.clock.now())
            .num_seconds()
            .max(1) as u64;
        Err(ApiError::RateLimitExceeded {
            limit: result.limit,
            remaining: result.remaining,
            reset_time: result.reset_time,
            retry_after_secs,
        })
    }
}

pub struct AdmissionStage {
    admin_only: bool,
}

impl GateStage for AdmissionStage {
    fn name(&self) -> &'static str {
        "admission"
    }

    fn evaluate(&self, _request: &GateRequest, ctx: &mut GateContext) -> Result<(), ApiError> {
        if self.admin_only {
            if ctx.is_admin() {
                return Ok(());
            }
            return Err(ctx
                .take_credential_error()
                .unwrap_or(ApiError::AdminRequired));
        }

        // A credential that was presented but failed is never silently ignored.
        if ctx.admin.is_none() && ctx.api_key.is_none() {
            if let Some(e) = ctx.take_credential_error() {
                return Err(e);
            }
        }
        Ok(())
    }
}

pub struct AuthorizationStage {
    required_permission: Option<String>,
}

impl GateStage for AuthorizationStage {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn evaluate(&self, request: &GateRequest, ctx: &mut GateContext) -> Result<(), ApiError> {
        let key = match (&ctx.admin, &ctx.api_key) {
            (Some(_), _) => return Ok(()),
            (None, Some(key)) => key,
            (None, None) => {
                return match &self.required_permission {
                    Some(_) => Err(ApiError::MissingCredentials),
                    None => Ok(()),
                }
            }
        };

        if let Some(restrictions) = &key.restrictions {
            if !restrictions.allows_ip(&request.client_addr) {
                return Err(ApiError::Forbidden(format!(
                    "API key may not be used from {}",
                    request.client_addr
                )));
            }
        }

        if let Some(required) = &self.required_permission {
            if !ApiKeyService::has_permission(key, required) {
                return Err(ApiError::Forbidden(format!(
                    "missing permission '{}'",
                    required
                )));
            }
        }
        Ok(())
    }
}

/// Ordered admission pipeline for one route.
pub struct SecurityGate {
    category: &'static str,
    stages: Vec<Box<dyn GateStage>>,
}

impl SecurityGate {
    pub fn new(state: AppState, policy: GatePolicy) -> Self {
        let mut stages: Vec<Box<dyn GateStage>> = vec![Box::new(ResolveIdentity {
            state: state.clone(),
        })];
        if let Some(rate_limit) = policy.rate_limit {
            stages.push(Box::new(RateLimitStage {
                state,
                category: policy.category,
                policy: rate_limit,
            }));
        }
        stages.push(Box::new(AdmissionStage {
            admin_only: policy.admin_only,
        }));
        stages.push(Box::new(AuthorizationStage {
            required_permission: policy.required_permission,
        }));

        Self {
            category: policy.category,
            stages,
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage in order, stopping at the first rejection.
    pub fn evaluate(&self, request: &GateRequest) -> Result<GateContext, ApiError> {
        let mut ctx = GateContext::default();
        for stage in &self.stages {
            if let Err(e) = stage.evaluate(request, &mut ctx) {
                tracing::warn!(
                    category = self.category,
                    stage = stage.name(),
                    client = %request.client_addr,
                    error = %e,
                    "request rejected"
                );
                return Err(e);
            }
            tracing::debug!(category = self.category, stage = stage.name(), "stage passed");
        }
        Ok(ctx)
    }
}

pub async fn security_middleware(
    State(gate): State<Arc<SecurityGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let gate_request = GateRequest::from_headers(request.headers(), peer);

    let (identity, rate_limit) = match gate.evaluate(&gate_request) {
        Ok(ctx) => (ctx.identity(&gate_request), ctx.rate_limit),
        Err(e) => return e.into_response(),
    };
    request.extensions_mut().insert(identity);

    let mut response = next.run(request).await;
    if let Some(result) = rate_limit {
        insert_rate_limit_headers(
            response.headers_mut(),
            result.limit,
            result.remaining,
            result.reset_time,
        );
    }
    response
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// Forwarded headers first, then the socket peer.
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip;
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
