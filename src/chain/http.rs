// =============================================================================
// Chain Gateway REST Client
// =============================================================================
//
// Talks JSON to the gateway that wraps the EVM/SUI contract calls. The
// optional gateway token is sent as a bearer header and never logged.
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{ChainClient, PortfolioHoldings, TargetAllocation, TxReceipt};
use crate::types::{HedgeAction, PortfolioId, RebalanceAction};

#[derive(Clone)]
pub struct HttpChainClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RebalanceRequest<'a> {
    wallet_address: &'a str,
    actions: &'a [RebalanceAction],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HedgeRequest<'a> {
    wallet_address: &'a str,
    hedge: &'a HedgeAction,
}

impl HttpChainClient {
    /// Build a client for `base_url`. `timeout` bounds every request.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let val = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("chain gateway token is not a valid header value")?;
            default_headers.insert(AUTHORIZATION, val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "HttpChainClient initialised");

        Ok(Self { base_url, client })
    }

    fn url(&self, id: &PortfolioId, tail: &str) -> String {
        format!("{}/portfolios/{}/{}", self.base_url, id, tail)
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("chain gateway {what} returned {status}: {body}");
        }
        resp.json()
            .await
            .with_context(|| format!("failed to parse {what} response"))
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    #[instrument(skip(self), name = "chain::get_portfolio_assets")]
    async fn get_portfolio_assets(
        &self,
        id: &PortfolioId,
        wallet: &str,
    ) -> Result<PortfolioHoldings> {
        let resp = self
            .client
            .get(self.url(id, "assets"))
            .query(&[("wallet", wallet)])
            .send()
            .await
            .context("GET portfolio assets request failed")?;
        Self::read_json(resp, "assets").await
    }

    #[instrument(skip(self), name = "chain::get_target_allocations")]
    async fn get_target_allocations(&self, id: &PortfolioId) -> Result<Vec<TargetAllocation>> {
        let resp = self
            .client
            .get(self.url(id, "allocations"))
            .send()
            .await
            .context("GET target allocations request failed")?;
        let map: BTreeMap<String, f64> = Self::read_json(resp, "allocations").await?;
        Ok(map
            .into_iter()
            .map(|(symbol, percent)| TargetAllocation { symbol, percent })
            .collect())
    }

    #[instrument(skip(self, actions), fields(legs = actions.len()), name = "chain::submit_rebalance")]
    async fn submit_rebalance(
        &self,
        id: &PortfolioId,
        wallet: &str,
        actions: &[RebalanceAction],
    ) -> Result<TxReceipt> {
        let resp = self
            .client
            .post(self.url(id, "rebalance"))
            .json(&RebalanceRequest {
                wallet_address: wallet,
                actions,
            })
            .send()
            .await
            .context("POST rebalance request failed")?;
        Self::read_json(resp, "rebalance").await
    }

    #[instrument(skip(self, hedge), fields(asset = %hedge.asset), name = "chain::submit_hedge")]
    async fn submit_hedge(
        &self,
        id: &PortfolioId,
        wallet: &str,
        hedge: &HedgeAction,
    ) -> Result<TxReceipt> {
        let resp = self
            .client
            .post(self.url(id, "hedge"))
            .json(&HedgeRequest {
                wallet_address: wallet,
                hedge,
            })
            .send()
            .await
            .context("POST hedge request failed")?;
        Self::read_json(resp, "hedge").await
    }
}
