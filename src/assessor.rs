// =============================================================================
// Portfolio Assessor — allocation drift and P&L from on-chain holdings
// =============================================================================
//
// Read-only. Each call fetches fresh holdings and target weights and builds
// an immutable `PortfolioAssessment`:
//
//   current% = value / total * 100
//   drift    = current% - target%
//
// The total is taken as the sum of asset values so current weights always add
// up to 100. A reported total that disagrees is logged, not trusted.
//
// Any read failure, timeout, or zero/undetected total is `DataUnavailable`.
// Callers must not touch cooldown state on that path.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::chain::{ChainClient, PortfolioHoldings, TargetAllocation};
use crate::error::PipelineError;
use crate::types::PortfolioId;

/// Relative disagreement between reported and summed totals worth a warning.
const TOTAL_MISMATCH_WARN: f64 = 0.005;

/// Observed state of one asset at assessment time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSnapshot {
    pub symbol: String,
    pub target_percent: f64,
    pub current_percent: f64,
    #[serde(rename = "currentValueUSD")]
    pub current_value_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_percent: Option<f64>,
}

/// Signed deviation of one asset from its target, in percentage points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Drift {
    pub asset: String,
    pub target: f64,
    pub current: f64,
    pub drift: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioAssessment {
    pub portfolio_id: PortfolioId,
    #[serde(rename = "totalValueUSD")]
    pub total_value_usd: f64,
    pub timestamp: DateTime<Utc>,
    pub assets: Vec<AssetSnapshot>,
    pub drifts: Vec<Drift>,
    /// Absent when no cost baseline is known. Never defaulted to zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_percent: Option<f64>,
}

impl PortfolioAssessment {
    /// Largest absolute drift across all assets (0 for an empty portfolio).
    pub fn max_abs_drift(&self) -> f64 {
        self.drifts
            .iter()
            .map(|d| d.drift.abs())
            .fold(0.0, f64::max)
    }

    /// Build an assessment from already-fetched data. Pure.
    pub fn from_holdings(
        portfolio_id: PortfolioId,
        holdings: &PortfolioHoldings,
        targets: &[TargetAllocation],
        timestamp: DateTime<Utc>,
    ) -> Result<Self, PipelineError> {
        if let Some(bad) = holdings
            .assets
            .iter()
            .find(|a| !a.value_usd.is_finite() || a.value_usd < 0.0)
        {
            return Err(PipelineError::DataUnavailable(format!(
                "asset {} has invalid value {}",
                bad.symbol, bad.value_usd
            )));
        }

        let total: f64 = holdings.assets.iter().map(|a| a.value_usd).sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(PipelineError::DataUnavailable(format!(
                "portfolio {portfolio_id} total value is zero or undetected"
            )));
        }
        if targets.is_empty() {
            return Err(PipelineError::DataUnavailable(format!(
                "portfolio {portfolio_id} has no target allocation"
            )));
        }

        if (holdings.total_value_usd - total).abs() > total * TOTAL_MISMATCH_WARN {
            warn!(
                portfolio_id = %portfolio_id,
                reported = holdings.total_value_usd,
                summed = total,
                "reported total disagrees with asset values; using summed total"
            );
        }
        let target_sum: f64 = targets.iter().map(|t| t.percent).sum();
        if (target_sum - 100.0).abs() > 0.5 {
            warn!(portfolio_id = %portfolio_id, target_sum, "target weights do not sum to 100");
        }

        let target_of = |symbol: &str| {
            targets
                .iter()
                .find(|t| t.symbol == symbol)
                .map(|t| t.percent)
                .unwrap_or(0.0)
        };

        // Held assets in chain order, then targeted assets with no holding.
        let mut assets: Vec<AssetSnapshot> = holdings
            .assets
            .iter()
            .map(|a| AssetSnapshot {
                symbol: a.symbol.clone(),
                target_percent: target_of(&a.symbol),
                current_percent: a.value_usd / total * 100.0,
                current_value_usd: a.value_usd,
                pnl_percent: a.pnl_percent,
            })
            .collect();
        for t in targets {
            if !assets.iter().any(|a| a.symbol == t.symbol) {
                assets.push(AssetSnapshot {
                    symbol: t.symbol.clone(),
                    target_percent: t.percent,
                    current_percent: 0.0,
                    current_value_usd: 0.0,
                    pnl_percent: None,
                });
            }
        }

        let drifts = assets
            .iter()
            .map(|a| Drift {
                asset: a.symbol.clone(),
                target: a.target_percent,
                current: a.current_percent,
                drift: a.current_percent - a.target_percent,
            })
            .collect();

        let pnl_percent = portfolio_pnl(holdings, total);

        Ok(Self {
            portfolio_id,
            total_value_usd: total,
            timestamp,
            assets,
            drifts,
            pnl_percent,
        })
    }
}

/// Portfolio-level P&L in percent.
///
/// Uses the reported entry value when present. Otherwise, when every held
/// asset reports its own pnl, derives each cost basis as
/// `value / (1 + pnl/100)` and compares totals. Anything less is `None`.
fn portfolio_pnl(holdings: &PortfolioHoldings, total: f64) -> Option<f64> {
    if let Some(entry) = holdings.entry_value_usd.filter(|e| e.is_finite() && *e > 0.0) {
        return Some((total - entry) / entry * 100.0);
    }

    let held: Vec<_> = holdings.assets.iter().filter(|a| a.value_usd > 0.0).collect();
    if held.is_empty() {
        return None;
    }
    let mut cost = 0.0;
    for a in held {
        let pnl = a.pnl_percent?;
        let growth = 1.0 + pnl / 100.0;
        if growth <= 0.0 {
            return None;
        }
        cost += a.value_usd / growth;
    }
    (cost > 0.0).then(|| (total - cost) / cost * 100.0)
}

pub struct PortfolioAssessor {
    chain: Arc<dyn ChainClient>,
    timeout: Duration,
}

impl PortfolioAssessor {
    pub fn new(chain: Arc<dyn ChainClient>, timeout: Duration) -> Self {
        Self { chain, timeout }
    }

    /// Fetch and assess one portfolio. Never mutates any state.
    pub async fn assess(
        &self,
        portfolio_id: &PortfolioId,
        wallet: &str,
    ) -> Result<PortfolioAssessment, PipelineError> {
        let holdings = tokio::time::timeout(
            self.timeout,
            self.chain.get_portfolio_assets(portfolio_id, wallet),
        )
        .await
        .map_err(|_| {
            PipelineError::DataUnavailable(format!(
                "holdings read timed out after {}s",
                self.timeout.as_secs()
            ))
        })?
        .map_err(|e| PipelineError::DataUnavailable(format!("holdings read failed: {e:#}")))?;

        let targets = tokio::time::timeout(
            self.timeout,
            self.chain.get_target_allocations(portfolio_id),
        )
        .await
        .map_err(|_| {
            PipelineError::DataUnavailable(format!(
                "target allocation read timed out after {}s",
                self.timeout.as_secs()
            ))
        })?
        .map_err(|e| {
            PipelineError::DataUnavailable(format!("target allocation read failed: {e:#}"))
        })?;

        let assessment =
            PortfolioAssessment::from_holdings(portfolio_id.clone(), &holdings, &targets, Utc::now())?;

        debug!(
            portfolio_id = %portfolio_id,
            total_value_usd = assessment.total_value_usd,
            max_abs_drift = assessment.max_abs_drift(),
            pnl_percent = ?assessment.pnl_percent,
            "portfolio assessed"
        );
        Ok(assessment)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::SimulatedPortfolio;
    use crate::chain::{AssetHolding, SimulatedChainClient};

    fn holding(symbol: &str, value: f64, pnl: Option<f64>) -> AssetHolding {
        AssetHolding {
            symbol: symbol.into(),
            value_usd: value,
            pnl_percent: pnl,
        }
    }

    fn target(symbol: &str, percent: f64) -> TargetAllocation {
        TargetAllocation {
            symbol: symbol.into(),
            percent,
        }
    }

    fn holdings(assets: Vec<AssetHolding>) -> PortfolioHoldings {
        PortfolioHoldings {
            total_value_usd: assets.iter().map(|a| a.value_usd).sum(),
            entry_value_usd: None,
            assets,
        }
    }

    #[test]
    fn drift_is_current_minus_target() {
        let h = holdings(vec![
            holding("BTC", 3_800.0, None),
            holding("ETH", 3_000.0, None),
            holding("CRO", 2_000.0, None),
            holding("SUI", 1_200.0, None),
        ]);
        let t = vec![target("BTC", 35.0), target("ETH", 30.0), target("CRO", 20.0), target("SUI", 15.0)];
        let a = PortfolioAssessment::from_holdings(PortfolioId::from(1), &h, &t, Utc::now()).unwrap();

        assert!((a.drifts[0].drift - 3.0).abs() < 1e-9);
        assert!((a.drifts[3].drift + 3.0).abs() < 1e-9);
        assert!((a.max_abs_drift() - 3.0).abs() < 1e-9);
        assert!(a.pnl_percent.is_none());
    }

    #[test]
    fn current_percents_sum_to_100() {
        let cases = [
            vec![1.0, 2.0, 3.0],
            vec![0.333, 1_000_000.0, 17.5, 0.0],
            vec![42.0],
        ];
        for values in cases {
            let h = holdings(
                values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| holding(&format!("A{i}"), *v, None))
                    .collect(),
            );
            let a = PortfolioAssessment::from_holdings(
                PortfolioId::from(1),
                &h,
                &[target("A0", 100.0)],
                Utc::now(),
            )
            .unwrap();
            let sum: f64 = a.assets.iter().map(|s| s.current_percent).sum();
            assert!((sum - 100.0).abs() <= 0.5, "sum was {sum}");
        }
    }

    #[test]
    fn mismatched_reported_total_is_not_trusted() {
        let mut h = holdings(vec![holding("BTC", 500.0, None), holding("ETH", 500.0, None)]);
        h.total_value_usd = 2_000.0;
        let a = PortfolioAssessment::from_holdings(
            PortfolioId::from(1),
            &h,
            &[target("BTC", 50.0), target("ETH", 50.0)],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(a.total_value_usd, 1_000.0);
        assert!((a.assets[0].current_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn targeted_but_unheld_asset_is_under_allocated() {
        let h = holdings(vec![holding("BTC", 1_000.0, None)]);
        let a = PortfolioAssessment::from_holdings(
            PortfolioId::from(1),
            &h,
            &[target("BTC", 80.0), target("SUI", 20.0)],
            Utc::now(),
        )
        .unwrap();
        let sui = a.drifts.iter().find(|d| d.asset == "SUI").unwrap();
        assert_eq!(sui.current, 0.0);
        assert!((sui.drift + 20.0).abs() < 1e-9);
    }

    #[test]
    fn zero_total_is_data_unavailable() {
        let h = holdings(vec![holding("BTC", 0.0, None)]);
        let err = PortfolioAssessment::from_holdings(
            PortfolioId::from(1),
            &h,
            &[target("BTC", 100.0)],
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "DataUnavailable");
    }

    #[test]
    fn pnl_from_entry_value() {
        let mut h = holdings(vec![holding("BTC", 900.0, None)]);
        h.entry_value_usd = Some(1_000.0);
        let a = PortfolioAssessment::from_holdings(
            PortfolioId::from(1),
            &h,
            &[target("BTC", 100.0)],
            Utc::now(),
        )
        .unwrap();
        assert!((a.pnl_percent.unwrap() + 10.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_from_per_asset_cost_basis() {
        // BTC cost 500 now 400 (-20%), ETH cost 500 now 550 (+10%).
        let h = holdings(vec![holding("BTC", 400.0, Some(-20.0)), holding("ETH", 550.0, Some(10.0))]);
        let a = PortfolioAssessment::from_holdings(
            PortfolioId::from(1),
            &h,
            &[target("BTC", 50.0), target("ETH", 50.0)],
            Utc::now(),
        )
        .unwrap();
        assert!((a.pnl_percent.unwrap() + 5.0).abs() < 1e-9);
    }

    #[test]
    fn partial_pnl_is_omitted_not_zero() {
        let h = holdings(vec![holding("BTC", 400.0, Some(-20.0)), holding("ETH", 550.0, None)]);
        let a = PortfolioAssessment::from_holdings(
            PortfolioId::from(1),
            &h,
            &[target("BTC", 50.0), target("ETH", 50.0)],
            Utc::now(),
        )
        .unwrap();
        assert!(a.pnl_percent.is_none());
    }

    #[tokio::test]
    async fn chain_failure_is_data_unavailable() {
        let chain = Arc::new(SimulatedChainClient::new());
        chain.set_fail_reads(true);
        let assessor = PortfolioAssessor::new(chain, Duration::from_secs(8));
        let err = assessor.assess(&PortfolioId::from(1), "0x1").await.unwrap_err();
        assert!(matches!(err, PipelineError::DataUnavailable(_)));
    }

    #[tokio::test]
    async fn slow_chain_times_out_as_data_unavailable() {
        let chain = Arc::new(SimulatedChainClient::new());
        chain.upsert(SimulatedPortfolio {
            portfolio_id: PortfolioId::from(1),
            entry_value_usd: None,
            assets: vec![holding("BTC", 1.0, None)],
            targets: vec![target("BTC", 100.0)],
        });
        chain.set_latency(Duration::from_millis(200));
        let assessor = PortfolioAssessor::new(chain, Duration::from_millis(20));
        let err = assessor.assess(&PortfolioId::from(1), "0x1").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
