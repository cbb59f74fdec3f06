use crate::handlers;
use crate::middleware::{security_middleware, GatePolicy, SecurityGate};
use crate::models::RateLimitPolicy;
use crate::AppState;
use axum::{
    middleware,
    routing::{delete, get, patch, post, MethodRouter},
    Router,
};
use std::sync::Arc;

// One counter space per route policy, so differing budgets never share a window.
pub const API_KEYS_READ: &str = "admin-api-keys-read";
pub const API_KEYS_CREATE: &str = "admin-api-keys-create";
pub const API_KEYS_WRITE: &str = "admin-api-keys-write";
pub const RATE_LIMITS_READ: &str = "admin-rate-limits-read";
pub const RATE_LIMITS_WRITE: &str = "admin-rate-limits-write";
pub const RATE_LIMITS_TEST: &str = "admin-rate-limits-test";

fn gated(
    route: MethodRouter<AppState>,
    state: &AppState,
    policy: GatePolicy,
) -> MethodRouter<AppState> {
    let gate = Arc::new(SecurityGate::new(state.clone(), policy));
    route.route_layer(middleware::from_fn_with_state(gate, security_middleware))
}

pub fn app(state: AppState) -> Router {
    // GET: 100/min. POST: 10/min. DELETE and PATCH: 30/min, shared.
    let api_keys = gated(
        get(handlers::list_api_keys),
        &state,
        GatePolicy::admin(API_KEYS_READ, RateLimitPolicy::admin_read()),
    )
    .merge(gated(
        post(handlers::create_api_key),
        &state,
        GatePolicy::admin(API_KEYS_CREATE, RateLimitPolicy::key_generation()),
    ))
    .merge(gated(
        delete(handlers::revoke_api_key),
        &state,
        GatePolicy::admin(API_KEYS_WRITE, RateLimitPolicy::admin_write()),
    ))
    .merge(gated(
        patch(handlers::update_api_key_status),
        &state,
        GatePolicy::admin(API_KEYS_WRITE, RateLimitPolicy::admin_write()),
    ));

    // GET: 100/min. DELETE (reset/cleanup): 30/min.
    let rate_limits = gated(
        get(handlers::get_rate_limits),
        &state,
        GatePolicy::admin(RATE_LIMITS_READ, RateLimitPolicy::admin_read()),
    )
    .merge(gated(
        delete(handlers::delete_rate_limits),
        &state,
        GatePolicy::admin(RATE_LIMITS_WRITE, RateLimitPolicy::admin_write()),
    ));

    // 20/min; each call also spends a slot in the caller-chosen test: counter.
    let rate_limit_test = gated(
        post(handlers::test_rate_limit),
        &state,
        GatePolicy::admin(RATE_LIMITS_TEST, RateLimitPolicy::diagnostics()),
    );

    Router::new()
        .route("/health", get(handlers::health))
        .route("/admin/api-keys", api_keys)
        .route("/admin/rate-limits", rate_limits)
        .route("/admin/rate-limits/test", rate_limit_test)
        .with_state(state)
}
