use community_gate::{
    config::Config,
    database::Database,
    rate_limit::{MemoryRateLimitStore, RateLimitStore},
    routes,
    security::{AdminTokenService, ApiKeyService},
    AppState, SystemClock,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    if config.uses_dev_secret() {
        tracing::warn!("JWT_SECRET not set, admin tokens are signed with the development secret");
    }

    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Database::new(&config.database_path)?;
    tracing::info!(path = %config.database_path, "API key database ready");

    let clock = Arc::new(SystemClock);
    let api_key_service = ApiKeyService::with_clock(
        Arc::new(db),
        config.api_key_prefix.clone(),
        config.api_key_environment.clone(),
        clock.clone(),
    );
    let admin_tokens = AdminTokenService::with_clock(
        config.jwt_secret.clone(),
        config.admin_token_ttl()?,
        clock.clone(),
    );
    let rate_limits: Arc<dyn RateLimitStore> =
        Arc::new(MemoryRateLimitStore::with_clock(clock.clone()));

    if config.issue_admin_token {
        let token = admin_tokens.issue_admin_token("bootstrap")?;
        tracing::warn!(
            ttl_hours = config.admin_token_ttl_hours,
            "bootstrap admin token issued: {}",
            token
        );
    }

    spawn_cleanup(rate_limits.clone(), config.cleanup_interval_secs);

    let state = AppState::new(api_key_service, rate_limits, admin_tokens, clock);
    let app = routes::app(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// Expired windows are also replaced lazily on their next check; this keeps
// idle identifiers from piling up.
fn spawn_cleanup(store: Arc<dyn RateLimitStore>, every_secs: u64) {
    if every_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(every_secs));
        loop {
            interval.tick().await;
            let removed = store.cleanup();
            if removed > 0 {
                tracing::info!(removed, "expired rate limit windows cleared");
            }
        }
    });
}
