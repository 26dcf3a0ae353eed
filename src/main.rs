use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

use prompt_architect::{config::Config, gemini::GeminiClient, routes::{evict_idle_sessions, router, AppState, SessionStore}};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    if config.gemini.api_key.is_empty() {
        tracing::warn!("GEMINI_API_KEY is not set; generation requests will be rejected by the API");
    }
    tracing::info!(
        prompt_model = %config.gemini.prompt_model,
        image_model = %config.gemini.image_model,
        "Using Gemini at {}", config.gemini.base_url
    );

    let state = AppState::new(Arc::new(GeminiClient::new(config.gemini.clone())));
    tokio::spawn(sweep_idle_sessions(state.store.clone(), config.session_ttl_secs));
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn sweep_idle_sessions(store: SessionStore, ttl_secs: u64) {
    let ttl = chrono::Duration::from_std(Duration::from_secs(ttl_secs)).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        evict_idle_sessions(&store, chrono::Utc::now(), ttl);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return std::future::pending().await;
    }
    tracing::info!("Shutting down");
}
