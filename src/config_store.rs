// =============================================================================
// Portfolio Config Store — per-portfolio rebalance policy
// =============================================================================
//
// Operators own these records; the engine only reads them. The file-backed
// store re-reads `portfolios.json` on every call so edits take effect on the
// next tick without a restart.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::types::PortfolioId;

/// Loss-protection (hedging) policy for one portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossProtection {
    #[serde(default)]
    pub enabled: bool,
    /// Positive number; a pnl below `-loss_threshold_percent` breaches.
    pub loss_threshold_percent: f64,
    /// Fraction of NAV to hedge, in (0, 1].
    pub hedge_ratio: f64,
    pub max_leverage: f64,
    pub cooldown_hours: f64,
}

/// Per-portfolio rebalance policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceConfig {
    pub portfolio_id: PortfolioId,
    /// Opt-in: a record without `"enabled": true` is never processed.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub wallet_address: Option<String>,
    pub drift_threshold_percent: f64,
    #[serde(default)]
    pub auto_approval_enabled: bool,
    #[serde(default, rename = "autoApprovalValueCeilingUSD")]
    pub auto_approval_value_ceiling_usd: Option<f64>,
    /// Known NAV at inception; enables since-inception returns.
    #[serde(default, rename = "inceptionNavUSD")]
    pub inception_nav_usd: Option<f64>,
    #[serde(default)]
    pub loss_protection: Option<LossProtection>,
}

impl RebalanceConfig {
    /// Check required fields and ranges. Returns the wallet address on
    /// success since every caller needs it next.
    pub fn validate(&self) -> Result<&str, PipelineError> {
        let wallet = self
            .wallet_address
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .ok_or_else(|| {
                PipelineError::ConfigInvalid(format!(
                    "portfolio {} is enabled but has no walletAddress",
                    self.portfolio_id
                ))
            })?;

        if !self.drift_threshold_percent.is_finite() || self.drift_threshold_percent <= 0.0 {
            return Err(PipelineError::ConfigInvalid(format!(
                "driftThresholdPercent must be > 0, got {}",
                self.drift_threshold_percent
            )));
        }

        if let Some(ceiling) = self.auto_approval_value_ceiling_usd {
            if !ceiling.is_finite() || ceiling <= 0.0 {
                return Err(PipelineError::ConfigInvalid(format!(
                    "autoApprovalValueCeilingUSD must be > 0, got {ceiling}"
                )));
            }
        }

        if let Some(lp) = self.loss_protection.as_ref().filter(|lp| lp.enabled) {
            if !lp.loss_threshold_percent.is_finite() || lp.loss_threshold_percent <= 0.0 {
                return Err(PipelineError::ConfigInvalid(format!(
                    "lossThresholdPercent must be > 0, got {}",
                    lp.loss_threshold_percent
                )));
            }
            if !(lp.hedge_ratio > 0.0 && lp.hedge_ratio <= 1.0) {
                return Err(PipelineError::ConfigInvalid(format!(
                    "hedgeRatio must be in (0, 1], got {}",
                    lp.hedge_ratio
                )));
            }
            if !lp.max_leverage.is_finite() || lp.max_leverage < 1.0 {
                return Err(PipelineError::ConfigInvalid(format!(
                    "maxLeverage must be >= 1, got {}",
                    lp.max_leverage
                )));
            }
            if !lp.cooldown_hours.is_finite() || lp.cooldown_hours < 0.0 {
                return Err(PipelineError::ConfigInvalid(format!(
                    "cooldownHours must be >= 0, got {}",
                    lp.cooldown_hours
                )));
            }
        }

        Ok(wallet)
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// One record as read from the store. A record that fails to parse
/// is kept as `Malformed` so the tick can report it next to its siblings.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEntry {
    Valid(RebalanceConfig),
    Malformed {
        portfolio_id: PortfolioId,
        error: String,
    },
}

impl ConfigEntry {
    pub fn portfolio_id(&self) -> &PortfolioId {
        match self {
            Self::Valid(c) => &c.portfolio_id,
            Self::Malformed { portfolio_id, .. } => portfolio_id,
        }
    }

    pub fn into_config(self) -> Result<RebalanceConfig, PipelineError> {
        match self {
            Self::Valid(c) => Ok(c),
            Self::Malformed {
                portfolio_id,
                error,
            } => Err(PipelineError::ConfigInvalid(format!(
                "portfolio {portfolio_id}: {error}"
            ))),
        }
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All portfolios with `enabled == true`, in store order.
    async fn list_enabled_portfolios(&self) -> Result<Vec<ConfigEntry>>;

    /// Look up one portfolio regardless of its enabled flag.
    async fn get_portfolio(&self, id: &PortfolioId) -> Result<Option<ConfigEntry>>;
}

/// Reads a JSON array of [`RebalanceConfig`] from disk on every call.
pub struct FileConfigStore {
    path: PathBuf,
}

/// A raw record plus whether the operator switched it on. Any `enabled`
/// value other than absent or `false` counts, so a mistyped flag is reported
/// rather than silently ignored.
struct RawEntry {
    enabled: bool,
    entry: ConfigEntry,
}

fn parse_entry(index: usize, value: Value) -> RawEntry {
    let enabled = !matches!(value.get("enabled"), None | Some(Value::Bool(false)));
    let portfolio_id = value
        .get("portfolioId")
        .cloned()
        .and_then(|v| serde_json::from_value::<PortfolioId>(v).ok())
        .unwrap_or_else(|| PortfolioId::new(format!("#{index}")));

    let entry = match serde_json::from_value::<RebalanceConfig>(value) {
        Ok(config) => ConfigEntry::Valid(config),
        Err(e) => {
            warn!(portfolio_id = %portfolio_id, index, error = %e, "malformed portfolio config");
            ConfigEntry::Malformed {
                portfolio_id,
                error: e.to_string(),
            }
        }
    };
    RawEntry { enabled, entry }
}

fn read_entries(path: &Path) -> Result<Vec<RawEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read portfolio configs from {}", path.display()))?;
    let values: Vec<Value> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse portfolio configs from {}", path.display()))?;
    debug!(path = %path.display(), count = values.len(), "portfolio configs read");
    Ok(values
        .into_iter()
        .enumerate()
        .map(|(i, v)| parse_entry(i, v))
        .collect())
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<Vec<RawEntry>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_entries(&path))
            .await
            .context("portfolio config read task failed")?
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn list_enabled_portfolios(&self) -> Result<Vec<ConfigEntry>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|raw| match &raw.entry {
                ConfigEntry::Valid(c) => c.enabled,
                ConfigEntry::Malformed { .. } => raw.enabled,
            })
            .map(|raw| raw.entry)
            .collect())
    }

    async fn get_portfolio(&self, id: &PortfolioId) -> Result<Option<ConfigEntry>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .map(|raw| raw.entry)
            .find(|e| e.portfolio_id() == id))
    }
}

/// In-memory store used in demo wiring and tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: RwLock<Vec<RebalanceConfig>>,
}

impl MemoryConfigStore {
    pub fn new(configs: Vec<RebalanceConfig>) -> Self {
        Self {
            configs: RwLock::new(configs),
        }
    }

    pub fn upsert(&self, config: RebalanceConfig) {
        let mut configs = self.configs.write();
        match configs.iter_mut().find(|c| c.portfolio_id == config.portfolio_id) {
            Some(existing) => *existing = config,
            None => configs.push(config),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn list_enabled_portfolios(&self) -> Result<Vec<ConfigEntry>> {
        Ok(self
            .configs
            .read()
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .map(ConfigEntry::Valid)
            .collect())
    }

    async fn get_portfolio(&self, id: &PortfolioId) -> Result<Option<ConfigEntry>> {
        Ok(self
            .configs
            .read()
            .iter()
            .find(|c| &c.portfolio_id == id)
            .cloned()
            .map(ConfigEntry::Valid))
    }
}
