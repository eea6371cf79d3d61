//! mdk-api entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads and validates
//! config, connects the DB pool, wires middleware, and starts the HTTP
//! server. All route handlers live in `routes.rs`; shared state lives in
//! `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use mdk_api::{routes, state::AppState};
use mdk_config::AppConfig;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    // Config layers: MDK_CONFIG is a comma-separated path list, later paths
    // override earlier ones. Secrets never live in these files; the loader
    // rejects any it finds.
    let cfg_var =
        std::env::var("MDK_CONFIG").unwrap_or_else(|_| "config/medidesk.yaml".to_string());
    let cfg_paths: Vec<&str> = cfg_var
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let loaded = mdk_config::load_layered_yaml(&cfg_paths).context("config load failed")?;
    let app_cfg =
        AppConfig::from_config_json(&loaded.config_json).context("config validation failed")?;
    info!(
        config_hash = %loaded.config_hash,
        branches = app_cfg.branches.len(),
        "config loaded"
    );

    let pool = mdk_db::connect_from_env_with(app_cfg.db_max_connections)
        .await
        .context("db connect failed")?;
    match mdk_db::status(&pool).await {
        Ok(s) if s.has_bills_table => info!("db schema present"),
        Ok(_) => warn!("db reachable but not migrated; run `mdk db migrate` first"),
        Err(e) => warn!(error = %e, "db status probe failed"),
    }

    let addr = bind_addr(&app_cfg)?;
    let shared = Arc::new(AppState::new(pool, app_cfg, loaded.config_hash));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    info!("mdk-api listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// `MDK_API_ADDR` overrides the configured listen address.
fn bind_addr(cfg: &AppConfig) -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("MDK_API_ADDR").unwrap_or_else(|_| cfg.listen_addr.clone());
    raw.parse()
        .with_context(|| format!("invalid listen address {raw:?}"))
}

/// CORS: allow only localhost origins (the reception/lab desks run the UI
/// off the same host).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
