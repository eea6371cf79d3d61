//! Shared runtime state for mdk-api.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The state is a DB
//! pool plus the validated config snapshot the process booted with; there
//! is no mutable in-process state, every request goes to the database.

use mdk_config::AppConfig;
use serde::Serialize;
use sqlx::PgPool;

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (via Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Branch registry and allocator policy, fixed for the process lifetime.
    pub config: AppConfig,
    /// Hash of the canonical config JSON, surfaced in /v1/status so an
    /// operator can confirm which config a running instance carries.
    pub config_hash: String,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig, config_hash: String) -> Self {
        Self {
            pool,
            config,
            config_hash,
            build: BuildInfo {
                service: "mdk-api",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}
