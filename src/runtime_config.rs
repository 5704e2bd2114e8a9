// =============================================================================
// Runtime Configuration — service-wide settings with atomic save
// =============================================================================
//
// Service-level knobs for the rebalance engine: where to listen, how long the
// rebalance cooldown lasts, chain call timeouts, parallelism, and where the
// durable stores live. Per-portfolio policy is NOT here; it lives in the
// config store (`config_store.rs`) so operators can edit it between ticks.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Secrets (trigger credential, proof key, gateway token) are read from the
// environment only and are never written to disk.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::ExecutionMode;

/// Chain calls must time out somewhere in this window.
const MIN_CHAIN_TIMEOUT_SECS: u64 = 8;
const MAX_CHAIN_TIMEOUT_SECS: u64 = 15;

/// Lease TTL window. The floor keeps a lease alive across a full pipeline run
/// (three chain calls at the longest timeout plus cooldown retries).
const MIN_LOCK_TTL_SECS: u64 = 60;
const MAX_LOCK_TTL_SECS: u64 = 86_400;

/// Longest cooldown any window can express: ten years.
pub const MAX_COOLDOWN_HOURS: f64 = 87_600.0;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:3002".to_string()
}

fn default_rebalance_cooldown_hours() -> f64 {
    24.0
}

fn default_hedge_leverage_cap() -> f64 {
    5.0
}

fn default_min_actionable_drift_percent() -> f64 {
    1.0
}

fn default_chain_timeout_secs() -> u64 {
    12
}

fn default_max_concurrent_portfolios() -> usize {
    4
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_cooldown_write_retries() -> u32 {
    3
}

fn default_portfolios_path() -> String {
    "portfolios.json".to_string()
}

fn default_state_path() -> String {
    "engine_state.json".to_string()
}

fn default_demo_holdings_path() -> String {
    "demo_holdings.json".to_string()
}

fn default_nav_drawdown_alert_percent() -> f64 {
    10.0
}

// =============================================================================
// ServiceConfig
// =============================================================================

/// Top-level configuration for the rebalance engine service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the HTTP trigger surface listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Demo runs against the simulated chain client; Live requires a gateway.
    #[serde(default)]
    pub execution_mode: ExecutionMode,

    // --- Decision policy ----------------------------------------------------

    /// Minimum hours between two automated rebalances of one portfolio.
    #[serde(default = "default_rebalance_cooldown_hours")]
    pub rebalance_cooldown_hours: f64,

    /// Hard ceiling on hedge leverage regardless of portfolio config.
    #[serde(default = "default_hedge_leverage_cap")]
    pub hedge_leverage_cap: f64,

    /// Assets drifting by no more than this many points get no trade leg.
    #[serde(default = "default_min_actionable_drift_percent")]
    pub min_actionable_drift_percent: f64,

    // --- Pipeline -----------------------------------------------------------

    /// Per-call timeout for chain reads and writes (clamped to 8..=15s).
    #[serde(default = "default_chain_timeout_secs")]
    pub chain_timeout_secs: u64,

    /// Upper bound on portfolios processed in parallel within one tick.
    #[serde(default = "default_max_concurrent_portfolios")]
    pub max_concurrent_portfolios: usize,

    /// Lifetime of the per-portfolio advisory lease.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Attempts for the write-after-execute cooldown update.
    #[serde(default = "default_cooldown_write_retries")]
    pub cooldown_write_retries: u32,

    // --- Storage & collaborators -------------------------------------------

    #[serde(default = "default_portfolios_path")]
    pub portfolios_path: String,

    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Seed holdings for the simulated chain client in Demo mode.
    #[serde(default = "default_demo_holdings_path")]
    pub demo_holdings_path: String,

    #[serde(default)]
    pub chain_gateway_url: Option<String>,

    #[serde(default)]
    pub risk_webhook_url: Option<String>,

    // --- NAV monitor --------------------------------------------------------

    /// Drawdown from peak NAV (percent) that raises a risk event.
    #[serde(default = "default_nav_drawdown_alert_percent")]
    pub nav_drawdown_alert_percent: f64,

    /// Sign execution proofs when a proof secret is available.
    #[serde(default = "default_true")]
    pub proof_signing: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            execution_mode: ExecutionMode::Demo,
            rebalance_cooldown_hours: default_rebalance_cooldown_hours(),
            hedge_leverage_cap: default_hedge_leverage_cap(),
            min_actionable_drift_percent: default_min_actionable_drift_percent(),
            chain_timeout_secs: default_chain_timeout_secs(),
            max_concurrent_portfolios: default_max_concurrent_portfolios(),
            lock_ttl_secs: default_lock_ttl_secs(),
            cooldown_write_retries: default_cooldown_write_retries(),
            portfolios_path: default_portfolios_path(),
            state_path: default_state_path(),
            demo_holdings_path: default_demo_holdings_path(),
            chain_gateway_url: None,
            risk_webhook_url: None,
            nav_drawdown_alert_percent: default_nav_drawdown_alert_percent(),
            proof_signing: true,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse service config from {}", path.display()))?;

        info!(
            path = %path.display(),
            execution_mode = %config.execution_mode,
            rebalance_cooldown_hours = config.rebalance_cooldown_hours,
            "service config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise service config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "service config saved (atomic)");
        Ok(())
    }

    /// Apply `ENGINE_*` / collaborator environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("ENGINE_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        if let Ok(mode) = std::env::var("ENGINE_EXECUTION_MODE") {
            match mode.parse() {
                Ok(m) => self.execution_mode = m,
                Err(e) => warn!(error = %e, "ignoring ENGINE_EXECUTION_MODE"),
            }
        }
        if let Ok(url) = std::env::var("CHAIN_GATEWAY_URL") {
            if !url.trim().is_empty() {
                self.chain_gateway_url = Some(url.trim().to_string());
            }
        }
        if let Ok(url) = std::env::var("RISK_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                self.risk_webhook_url = Some(url.trim().to_string());
            }
        }
    }

    /// Chain call timeout, clamped into the supported window.
    pub fn chain_timeout(&self) -> Duration {
        Duration::from_secs(
            self.chain_timeout_secs
                .clamp(MIN_CHAIN_TIMEOUT_SECS, MAX_CHAIN_TIMEOUT_SECS),
        )
    }

    /// Lease TTL, clamped into the supported window.
    pub fn lock_ttl(&self) -> chrono::Duration {
        let secs = self.lock_ttl_secs.clamp(MIN_LOCK_TTL_SECS, MAX_LOCK_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn rebalance_cooldown(&self) -> chrono::Duration {
        hours_to_duration(self.rebalance_cooldown_hours)
    }
}

/// Convert fractional hours to a chrono duration (millisecond precision).
/// Negative and NaN map to zero; anything above [`MAX_COOLDOWN_HOURS`] is
/// capped there.
pub fn hours_to_duration(hours: f64) -> chrono::Duration {
    let hours = if hours.is_nan() {
        0.0
    } else {
        hours.clamp(0.0, MAX_COOLDOWN_HOURS)
    };
    chrono::Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}
