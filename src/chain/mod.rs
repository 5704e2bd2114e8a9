// =============================================================================
// Chain Client — the engine's only window onto on-chain state
// =============================================================================
//
// Reads (holdings, target weights) feed the assessor; writes (rebalance batch,
// hedge) come from the executor. Implementations:
//   - `HttpChainClient`      — JSON gateway in front of the EVM/SUI RPCs.
//   - `SimulatedChainClient` — in-process demo chain with failure injection.
// =============================================================================

pub mod http;
pub mod simulated;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::runtime_config::ServiceConfig;
use crate::types::{ExecutionMode, HedgeAction, PortfolioId, RebalanceAction};

pub use http::HttpChainClient;
pub use simulated::SimulatedChainClient;

/// Observed value of one asset in a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetHolding {
    pub symbol: String,
    #[serde(rename = "valueUSD")]
    pub value_usd: f64,
    #[serde(default)]
    pub pnl_percent: Option<f64>,
}

/// Everything the chain reports about a portfolio's holdings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioHoldings {
    #[serde(rename = "totalValueUSD")]
    pub total_value_usd: f64,
    /// Cost basis of the whole portfolio, when the chain tracks it.
    #[serde(default, rename = "entryValueUSD")]
    pub entry_value_usd: Option<f64>,
    pub assets: Vec<AssetHolding>,
}

/// Target weight of one asset, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetAllocation {
    pub symbol: String,
    pub percent: f64,
}

/// Acknowledgement of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub tx_hash: String,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_portfolio_assets(
        &self,
        id: &PortfolioId,
        wallet: &str,
    ) -> Result<PortfolioHoldings>;

    async fn get_target_allocations(&self, id: &PortfolioId) -> Result<Vec<TargetAllocation>>;

    /// Submit all legs as one transaction batch.
    async fn submit_rebalance(
        &self,
        id: &PortfolioId,
        wallet: &str,
        actions: &[RebalanceAction],
    ) -> Result<TxReceipt>;

    async fn submit_hedge(
        &self,
        id: &PortfolioId,
        wallet: &str,
        hedge: &HedgeAction,
    ) -> Result<TxReceipt>;
}

// =============================================================================
// Backend selection
// =============================================================================

/// The chain client picked for an execution mode.
pub enum ChainBackend {
    Gateway(HttpChainClient),
    Simulated(SimulatedChainClient),
}

impl ChainBackend {
    /// Demo always runs against the simulated chain, so no Demo deployment
    /// can submit a real transaction. Live requires a gateway URL.
    pub fn for_config(config: &ServiceConfig, gateway_token: Option<String>) -> Result<Self> {
        match config.execution_mode {
            ExecutionMode::Live => {
                let Some(url) = config.chain_gateway_url.as_ref() else {
                    anyhow::bail!(
                        "Live execution mode requires chain_gateway_url (or CHAIN_GATEWAY_URL)"
                    );
                };
                info!(url = %url, "Using chain gateway");
                Ok(Self::Gateway(HttpChainClient::new(
                    url.clone(),
                    gateway_token,
                    config.chain_timeout(),
                )?))
            }
            ExecutionMode::Demo => {
                if let Some(url) = &config.chain_gateway_url {
                    warn!(url = %url, "Demo mode ignores chain_gateway_url; using simulated chain");
                }
                let sim = SimulatedChainClient::from_file(&config.demo_holdings_path)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "No demo holdings loaded — simulated chain starts empty");
                        SimulatedChainClient::new()
                    });
                Ok(Self::Simulated(sim))
            }
        }
    }

    pub fn into_client(self) -> Arc<dyn ChainClient> {
        match self {
            Self::Gateway(c) => Arc::new(c),
            Self::Simulated(c) => Arc::new(c),
        }
    }
}
