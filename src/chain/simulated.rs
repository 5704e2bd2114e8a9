// =============================================================================
// Simulated Chain — demo-mode holdings and synthetic transactions
// =============================================================================
//
// Holds per-portfolio holdings and targets in memory. Submissions never touch
// a real chain: they are recorded and acknowledged with a synthetic hash.
// Reads, writes, and latency can be perturbed so failure paths are testable.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{AssetHolding, ChainClient, PortfolioHoldings, TargetAllocation, TxReceipt};
use crate::types::{ActionPlan, HedgeAction, PortfolioId, RebalanceAction};

/// Seed for one demo portfolio, as found in the demo holdings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedPortfolio {
    pub portfolio_id: PortfolioId,
    #[serde(default, rename = "entryValueUSD")]
    pub entry_value_usd: Option<f64>,
    pub assets: Vec<AssetHolding>,
    pub targets: Vec<TargetAllocation>,
}

/// A submission the simulated chain accepted.
#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub portfolio_id: PortfolioId,
    pub wallet: String,
    pub plan: ActionPlan,
    pub tx_hash: String,
}

#[derive(Default)]
pub struct SimulatedChainClient {
    portfolios: RwLock<HashMap<PortfolioId, SimulatedPortfolio>>,
    submissions: RwLock<Vec<SubmittedTx>>,
    fail_reads: AtomicBool,
    fail_submits: AtomicBool,
    latency_ms: AtomicU64,
}

impl SimulatedChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load demo portfolios from a JSON array file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read demo holdings from {}", path.display()))?;
        let seeds: Vec<SimulatedPortfolio> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse demo holdings from {}", path.display()))?;
        let client = Self::new();
        for seed in seeds {
            client.upsert(seed);
        }
        info!(
            path = %path.display(),
            portfolios = client.portfolios.read().len(),
            "simulated chain seeded"
        );
        Ok(client)
    }

    pub fn upsert(&self, portfolio: SimulatedPortfolio) {
        self.portfolios
            .write()
            .insert(portfolio.portfolio_id.clone(), portfolio);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_submits(&self, fail: bool) {
        self.fail_submits.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<SubmittedTx> {
        self.submissions.read().clone()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn record(&self, id: &PortfolioId, wallet: &str, plan: ActionPlan) -> TxReceipt {
        let tx_hash = format!("0x{}", Uuid::new_v4().simple());
        self.submissions.write().push(SubmittedTx {
            portfolio_id: id.clone(),
            wallet: wallet.to_string(),
            plan,
            tx_hash: tx_hash.clone(),
        });
        info!(portfolio_id = %id, tx_hash = %tx_hash, "simulated transaction accepted");
        TxReceipt { tx_hash }
    }

    fn check_submit(&self) -> Result<()> {
        if self.fail_submits.load(Ordering::SeqCst) {
            anyhow::bail!("simulated revert: execution reverted");
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for SimulatedChainClient {
    async fn get_portfolio_assets(
        &self,
        id: &PortfolioId,
        _wallet: &str,
    ) -> Result<PortfolioHoldings> {
        self.simulate_latency().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("simulated RPC failure");
        }
        let portfolios = self.portfolios.read();
        let p = portfolios
            .get(id)
            .with_context(|| format!("unknown portfolio {id}"))?;
        Ok(PortfolioHoldings {
            total_value_usd: p.assets.iter().map(|a| a.value_usd).sum(),
            entry_value_usd: p.entry_value_usd,
            assets: p.assets.clone(),
        })
    }

    async fn get_target_allocations(&self, id: &PortfolioId) -> Result<Vec<TargetAllocation>> {
        self.simulate_latency().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("simulated RPC failure");
        }
        let portfolios = self.portfolios.read();
        let p = portfolios
            .get(id)
            .with_context(|| format!("unknown portfolio {id}"))?;
        Ok(p.targets.clone())
    }

    async fn submit_rebalance(
        &self,
        id: &PortfolioId,
        wallet: &str,
        actions: &[RebalanceAction],
    ) -> Result<TxReceipt> {
        self.simulate_latency().await;
        self.check_submit()?;
        Ok(self.record(id, wallet, ActionPlan::Rebalance(actions.to_vec())))
    }

    async fn submit_hedge(
        &self,
        id: &PortfolioId,
        wallet: &str,
        hedge: &HedgeAction,
    ) -> Result<TxReceipt> {
        self.simulate_latency().await;
        self.check_submit()?;
        Ok(self.record(id, wallet, ActionPlan::Hedge(hedge.clone())))
    }
}
