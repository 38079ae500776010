//! tcap-daemon entry point.
//!
//! Boot order matters here: logging first, then config (so the config hash
//! lands in the log), then the database and the capture runtime, and only
//! then the admin listener. Handlers live in `routes.rs`, shared state in
//! `state.rs`; nothing else belongs in this file.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use tcap_daemon::{routes, state};
use tcap_runtime::CaptureRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // A dev checkout may carry a .env.local; deployed processes get real
    // env vars and the missing file is simply ignored.
    let _ = dotenvy::from_filename(".env.local");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (settings, config_hash) = load_config()?;
    info!(%config_hash, "trade-capture starting");

    let pool = tcap_db::connect_from_env().await?;
    tcap_db::migrate(&pool).await?;

    let runtime = CaptureRuntime::start(pool.clone(), &settings).await?;
    let shared = Arc::new(state::AppState {
        pool,
        runtime,
        config_hash,
    });

    let app = routes::build_router(Arc::clone(&shared)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = admin_addr().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8091)));
    info!("tcap-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    shared.runtime.shutdown().await?;
    Ok(())
}

/// TCAP_CONFIG is a comma-separated list of YAML layers, later overriding
/// earlier. Without it the built-in defaults apply.
fn load_config() -> Result<(tcap_config::CaptureSettings, String)> {
    match std::env::var("TCAP_CONFIG") {
        Ok(paths_env) => {
            let paths: Vec<&str> = paths_env.split(',').map(str::trim).collect();
            let loaded = tcap_config::load_layered_yaml(&paths)?;
            Ok((loaded.settings, loaded.config_hash))
        }
        Err(_) => Ok((tcap_config::default_settings(), "builtin-defaults".to_string())),
    }
}

fn admin_addr() -> Option<SocketAddr> {
    std::env::var("TCAP_BIND_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
