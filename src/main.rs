// =============================================================================
// RWA Rebalance Engine — Main Entry Point
// =============================================================================
//
// Loads service config, wires the chain client and stores, and serves the
// trigger API. The engine never schedules itself: an external cron calls the
// trigger endpoints. It starts in Demo mode unless Live is configured
// explicitly. Demo always runs on the simulated chain, and Live refuses to
// start without a chain gateway.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod assessor;
mod chain;
mod config_store;
mod decider;
mod error;
mod executor;
mod nav_monitor;
mod notify;
mod runtime_config;
mod scheduler;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::chain::ChainBackend;
use crate::config_store::FileConfigStore;
use crate::runtime_config::ServiceConfig;
use crate::store::FileStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        RWA Rebalance Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("ENGINE_CONFIG_PATH").unwrap_or_else(|_| "service_config.json".into());
    let mut config = ServiceConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load service config, using defaults");
        let defaults = ServiceConfig::default();
        if !std::path::Path::new(&config_path).exists() {
            // Seed an editable file; env overrides are applied after, never persisted.
            if let Err(e) = defaults.save(&config_path) {
                warn!(error = %e, "Failed to write default service config");
            }
        }
        defaults
    });
    config.apply_env_overrides();

    let cron_secret = std::env::var("CRON_SECRET").unwrap_or_default();
    if cron_secret.is_empty() {
        warn!("CRON_SECRET is not set — every trigger request will be rejected");
    }
    let proof_key = std::env::var("PROOF_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .map(String::into_bytes);

    info!(
        execution_mode = %config.execution_mode,
        cooldown_hours = config.rebalance_cooldown_hours,
        chain_timeout_secs = config.chain_timeout().as_secs(),
        "Engine configuration resolved"
    );

    // ── 2. Chain client ──────────────────────────────────────────────────
    let gateway_token = std::env::var("CHAIN_GATEWAY_TOKEN").ok().filter(|t| !t.is_empty());
    let chain = ChainBackend::for_config(&config, gateway_token)?.into_client();

    // ── 3. Stores & notifier ─────────────────────────────────────────────
    let config_store = Arc::new(FileConfigStore::new(&config.portfolios_path));
    let store = Arc::new(FileStore::new(&config.state_path));
    let notifier = notify::spawn_risk_notifier(config.risk_webhook_url.clone());

    // ── 4. Build shared state ────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(
        config,
        cron_secret,
        chain,
        config_store,
        store,
        notifier,
        proof_key,
    ));

    // ── 5. Start the API server ──────────────────────────────────────────
    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            warn!("Shutdown signal received — stopping gracefully");
        })
        .await
        .context("API server failed")?;

    info!("RWA Rebalance Engine shut down complete.");
    Ok(())
}
