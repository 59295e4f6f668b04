//! `annotator`: feedback annotation service entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP export).
//! 3. Load the primary / rotation key ring and build the [`FieldCipher`].
//! 4. Open the record store.
//! 5. Build the Axum router and serve until Ctrl-C.

mod config;
mod server;
mod services;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use fieldcrypt::{FieldCipher, KeyRing, MemoryStore};
use tracing::info;

use config::Config;
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otlp_endpoint(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.listen_port,
        "annotator starting"
    );

    // -----------------------------------------------------------------------
    // 3. Keys
    // -----------------------------------------------------------------------
    let keys = KeyRing::load(
        cfg.user_encryption_key.as_deref(),
        cfg.user_encryption_key_rotation.as_deref(),
        cfg.key_policy(),
    )
    .context("failed to load field encryption keys")?;
    let cipher = Arc::new(FieldCipher::new(keys));

    // -----------------------------------------------------------------------
    // 4. Record store
    // -----------------------------------------------------------------------
    let store = MemoryStore::open(&cfg.data_path)
        .await
        .with_context(|| format!("failed to open record store at {}", cfg.data_path))?;

    // -----------------------------------------------------------------------
    // 5. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(Arc::new(store), cipher, cfg.user_header_name.clone());
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("annotator stopped");
    telemetry::shutdown_telemetry();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
