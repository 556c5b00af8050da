use anyhow::{Context, Result};
use std::sync::Arc;
use tether::api::{
    create_connection_router, create_oauth_router, create_refresh_router, create_webhook_router,
    run_state_purge, ConnectionAppState, OAuthAppState, RefreshAppState, WebhookAppState,
};
use tether::config::Config;
use tether::platforms::PlatformDirectory;
use tether::refresh::RefreshSweeper;
use tether::registry::Registry;
use tether::vault::TokenVault;
use tower_http::cors::CorsLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let vault = Arc::new(TokenVault::new(&config.encryption_key)?);
    let registry = Arc::new(Registry::open(&config.database_path)?);
    let platforms = Arc::new(PlatformDirectory::from_env(config.platforms_file.as_deref())?);

    info!(
        platforms = platforms.ids().len(),
        database = %config.database_path,
        "Tether starting"
    );

    // One bounded-timeout client for every provider call
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.provider_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;

    let sweeper = Arc::new(RefreshSweeper::new(
        Arc::clone(&registry),
        Arc::clone(&vault),
        Arc::clone(&platforms),
        http.clone(),
        chrono::Duration::minutes(config.refresh_lookahead_minutes),
    ));

    // Reap abandoned authorization states in the background
    tokio::spawn(run_state_purge(
        Arc::clone(&registry),
        config.state_purge_interval_seconds,
    ));

    let app = create_oauth_router(OAuthAppState {
        registry: Arc::clone(&registry),
        vault: Arc::clone(&vault),
        platforms: Arc::clone(&platforms),
        http,
        auth_enabled: config.auth_enabled,
        callback_base_url: config.callback_base_url.clone(),
        state_ttl_seconds: config.state_ttl_seconds,
    })
    .merge(create_connection_router(ConnectionAppState {
        registry: Arc::clone(&registry),
        platforms: Arc::clone(&platforms),
        auth_enabled: config.auth_enabled,
    }))
    .merge(create_webhook_router(WebhookAppState {
        registry: Arc::clone(&registry),
        platforms: Arc::clone(&platforms),
    }))
    .merge(create_refresh_router(RefreshAppState {
        sweeper,
        sweep_secret: config.sweep_secret.clone(),
    }))
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "Listening");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
