// =============================================================================
// Scheduler Tick — one externally-triggered pass over all enabled portfolios
// =============================================================================
//
// Per portfolio, in its own task:
//   validate config -> take lease -> assess -> read cooldown -> decide
//     -> execute (non-empty plan) -> record cooldown -> release lease
//
// Every failure becomes a `ProcessingResult`; nothing escapes the tick, not
// even a config record that fails to parse. The lease spans read-cooldown
// through write-cooldown, so overlapping ticks can never both act on the same
// portfolio inside one cooldown window. Lease expiry runs on the store's wall
// clock, independent of the `now` a tick decides with.
//
// Cooldown is untouched when assessment or execution fails, so the next tick
// retries without waiting out a window.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::assessor::PortfolioAssessor;
use crate::config_store::{ConfigStore, RebalanceConfig};
use crate::decider::{DecisionStatus, RebalanceDecider};
use crate::error::PipelineError;
use crate::executor::{ActionExecutor, ExecutionProof};
use crate::store::CooldownStore;
use crate::types::{ActionPlan, PortfolioId, ProposedAction};

/// Everything one tick needs. Cheap to clone.
#[derive(Clone)]
pub struct PipelineDeps {
    pub config_store: Arc<dyn ConfigStore>,
    pub cooldown_store: Arc<dyn CooldownStore>,
    pub assessor: Arc<PortfolioAssessor>,
    pub decider: Arc<RebalanceDecider>,
    pub executor: Arc<ActionExecutor>,
    pub max_concurrency: usize,
    pub lock_ttl: chrono::Duration,
    pub cooldown_write_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Rebalanced,
    Hedged,
    Checked,
    Skipped,
    ManualApproval,
    Error,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Rebalanced => "rebalanced",
            Self::Hedged => "hedged",
            Self::Checked => "checked",
            Self::Skipped => "skipped",
            Self::ManualApproval => "manual_approval",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome for one portfolio in one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub portfolio_id: PortfolioId,
    pub status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionStatus>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_drift: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ProposedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<ExecutionProof>,
    /// Non-fatal problem on an otherwise successful run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessingResult {
    fn new(portfolio_id: PortfolioId, status: ProcessingStatus, message: String, at: DateTime<Utc>) -> Self {
        Self {
            portfolio_id,
            status,
            decision: None,
            message,
            error_kind: None,
            max_drift: None,
            pnl_percent: None,
            tx_hash: None,
            actions: Vec::new(),
            proof: None,
            warning: None,
            processed_at: at,
        }
    }

    fn error(portfolio_id: PortfolioId, err: &PipelineError, at: DateTime<Utc>) -> Self {
        let mut r = Self::new(portfolio_id, ProcessingStatus::Error, err.to_string(), at);
        r.error_kind = Some(err.kind());
        r
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub total: usize,
    /// Executed plans, hedges included.
    pub rebalanced: usize,
    pub hedged: usize,
    pub checked: usize,
    /// Includes portfolios awaiting manual approval.
    pub skipped: usize,
    pub errors: usize,
}

impl TickSummary {
    pub fn from_results(results: &[ProcessingResult]) -> Self {
        let mut s = Self {
            total: results.len(),
            ..Self::default()
        };
        for r in results {
            match r.status {
                ProcessingStatus::Rebalanced => s.rebalanced += 1,
                ProcessingStatus::Hedged => {
                    s.rebalanced += 1;
                    s.hedged += 1;
                }
                ProcessingStatus::Checked => s.checked += 1,
                ProcessingStatus::Skipped | ProcessingStatus::ManualApproval => s.skipped += 1,
                ProcessingStatus::Error => s.errors += 1,
            }
        }
        s
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub summary: TickSummary,
    pub results: Vec<ProcessingResult>,
    pub duration_ms: u64,
}

/// Run one tick over every enabled portfolio.
pub async fn run_tick(deps: &PipelineDeps, now: DateTime<Utc>) -> TickReport {
    let started = Instant::now();

    let portfolios = match deps.config_store.list_enabled_portfolios().await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to list enabled portfolios");
            return TickReport {
                success: false,
                error: Some(format!("failed to list portfolios: {e:#}")),
                summary: TickSummary::default(),
                results: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }
    };

    info!(count = portfolios.len(), "rebalance tick started");

    let results: Vec<ProcessingResult> = stream::iter(portfolios)
        .map(|entry| {
            let deps = deps.clone();
            let id = entry.portfolio_id().clone();
            async move {
                let config = match entry.into_config() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(portfolio_id = %id, error = %e, "skipping unreadable portfolio config");
                        return ProcessingResult::error(id, &e, now);
                    }
                };
                // Own task per portfolio: a panic is contained to its result.
                match tokio::spawn(async move { process_portfolio(&deps, config, now).await }).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(portfolio_id = %id, error = %e, "portfolio pipeline panicked");
                        let mut r = ProcessingResult::new(
                            id,
                            ProcessingStatus::Error,
                            format!("pipeline aborted: {e}"),
                            now,
                        );
                        r.error_kind = Some("Internal");
                        r
                    }
                }
            }
        })
        .buffered(deps.max_concurrency.max(1))
        .collect()
        .await;

    let summary = TickSummary::from_results(&results);
    let duration_ms = started.elapsed().as_millis() as u64;
    info!(
        total = summary.total,
        rebalanced = summary.rebalanced,
        hedged = summary.hedged,
        checked = summary.checked,
        skipped = summary.skipped,
        errors = summary.errors,
        duration_ms,
        "rebalance tick completed"
    );

    TickReport {
        success: true,
        error: None,
        summary,
        results,
        duration_ms,
    }
}

/// Full pipeline for one portfolio, wrapped in its advisory lease.
pub async fn process_portfolio(
    deps: &PipelineDeps,
    config: RebalanceConfig,
    now: DateTime<Utc>,
) -> ProcessingResult {
    let id = config.portfolio_id.clone();

    let wallet = match config.validate() {
        Ok(w) => w.to_string(),
        Err(e) => {
            warn!(portfolio_id = %id, error = %e, "skipping portfolio with invalid config");
            return ProcessingResult::error(id, &e, now);
        }
    };

    let lease = match deps.cooldown_store.try_acquire_lock(&id, deps.lock_ttl).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            info!(portfolio_id = %id, "portfolio locked by concurrent run; skipping");
            return ProcessingResult::new(
                id,
                ProcessingStatus::Skipped,
                "portfolio locked by concurrent run".to_string(),
                now,
            );
        }
        Err(e) => {
            let err = PipelineError::DataUnavailable(format!("lease acquisition failed: {e:#}"));
            warn!(portfolio_id = %id, error = %err, "lease unavailable");
            return ProcessingResult::error(id, &err, now);
        }
    };

    let result = run_locked(deps, &config, &wallet, now).await;

    match deps.cooldown_store.release_lock(&id, lease).await {
        Ok(true) => {}
        Ok(false) => warn!(portfolio_id = %id, "lease expired before the run finished"),
        // The lease expires on its own after the TTL.
        Err(e) => warn!(portfolio_id = %id, error = %e, "failed to release portfolio lease"),
    }

    info!(
        portfolio_id = %id,
        status = %result.status,
        message = %result.message,
        "portfolio processed"
    );
    result
}

async fn run_locked(
    deps: &PipelineDeps,
    config: &RebalanceConfig,
    wallet: &str,
    now: DateTime<Utc>,
) -> ProcessingResult {
    let id = config.portfolio_id.clone();

    let assessment = match deps.assessor.assess(&id, wallet).await {
        Ok(a) => a,
        Err(e) => {
            warn!(portfolio_id = %id, error = %e, "assessment failed");
            return ProcessingResult::error(id, &e, now);
        }
    };

    let cooldown = match deps.cooldown_store.load_state(&id).await {
        Ok(c) => c,
        Err(e) => {
            // Unknown cooldown means we cannot rule out a duplicate action.
            let err = PipelineError::DataUnavailable(format!("cooldown read failed: {e:#}"));
            warn!(portfolio_id = %id, error = %err, "cooldown state unavailable");
            return ProcessingResult::error(id, &err, now);
        }
    };

    let decision = deps.decider.decide(&assessment, config, &cooldown, now);

    let status = match decision.status {
        DecisionStatus::CheckedOk => ProcessingStatus::Checked,
        DecisionStatus::RequiresManualApproval => ProcessingStatus::ManualApproval,
        DecisionStatus::SkippedCooldownHedge
        | DecisionStatus::SkippedCooldownRebalance
        | DecisionStatus::SkippedValueCeiling => ProcessingStatus::Skipped,
        DecisionStatus::RebalanceProposed => ProcessingStatus::Rebalanced,
        DecisionStatus::Hedged => ProcessingStatus::Hedged,
    };

    let mut result = ProcessingResult::new(id.clone(), status, decision.reason.clone(), now);
    result.decision = Some(decision.status);
    result.max_drift = Some(decision.max_abs_drift);
    result.pnl_percent = assessment.pnl_percent;

    if decision.plan.is_empty() {
        if matches!(status, ProcessingStatus::Rebalanced | ProcessingStatus::Hedged) {
            // Drift beyond threshold but every leg under the actionable floor.
            result.status = ProcessingStatus::Checked;
            result.message = format!("{}; no actionable legs", decision.reason);
        }
        return result;
    }

    let execution = match deps.executor.execute(&id, wallet, &decision.plan).await {
        Ok(x) => x,
        Err(e) => {
            warn!(portfolio_id = %id, error = %e, "execution failed; cooldown left untouched");
            let mut r = ProcessingResult::error(id, &e, now);
            r.decision = Some(decision.status);
            r.max_drift = Some(decision.max_abs_drift);
            r.actions = decision.plan.actions();
            return r;
        }
    };

    result.warning = record_cooldown(deps, &id, &decision.plan, now).await;
    result.tx_hash = Some(execution.tx_hash);
    result.actions = execution.applied_actions;
    result.proof = Some(execution.proof);
    result
}

/// Write-after-execute with bounded retries. Returns a warning when every
/// attempt failed.
async fn record_cooldown(
    deps: &PipelineDeps,
    id: &PortfolioId,
    plan: &ActionPlan,
    at: DateTime<Utc>,
) -> Option<String> {
    let attempts = deps.cooldown_write_retries.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        let res = match plan {
            ActionPlan::Hedge(_) => deps.cooldown_store.set_last_hedge(id, at).await,
            _ => deps.cooldown_store.set_last_rebalance(id, at).await,
        };
        match res {
            Ok(()) => return None,
            Err(e) => {
                warn!(portfolio_id = %id, attempt, error = %e, "cooldown write failed");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(std::time::Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }
    }

    let msg = format!(
        "action executed but cooldown not recorded: {}",
        last_err.map(|e| format!("{e:#}")).unwrap_or_default()
    );
    error!(portfolio_id = %id, "{}", msg);
    Some(msg)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::chain::simulated::SimulatedPortfolio;
    use crate::chain::{AssetHolding, SimulatedChainClient, TargetAllocation};
    use crate::config_store::{FileConfigStore, LossProtection, MemoryConfigStore};
    use crate::decider::DecisionPolicy;
    use crate::notify::RiskNotifier;
    use crate::store::{LeaseToken, MemoryStore};
    use crate::types::ExecutionMode;

    fn holding(symbol: &str, value: f64, pnl: Option<f64>) -> AssetHolding {
        AssetHolding {
            symbol: symbol.into(),
            value_usd: value,
            pnl_percent: pnl,
        }
    }

    fn targets() -> Vec<TargetAllocation> {
        [("BTC", 35.0), ("ETH", 30.0), ("CRO", 20.0), ("SUI", 15.0)]
            .into_iter()
            .map(|(s, p)| TargetAllocation {
                symbol: s.into(),
                percent: p,
            })
            .collect()
    }

    /// The drifted example portfolio: BTC 38 / ETH 30 / CRO 20 / SUI 12.
    fn drifted(id: u64, pnl: Option<f64>) -> SimulatedPortfolio {
        SimulatedPortfolio {
            portfolio_id: PortfolioId::from(id),
            entry_value_usd: None,
            assets: vec![
                holding("BTC", 3_800.0, pnl),
                holding("ETH", 3_000.0, pnl),
                holding("CRO", 2_000.0, pnl),
                holding("SUI", 1_200.0, pnl),
            ],
            targets: targets(),
        }
    }

    fn balanced(id: u64) -> SimulatedPortfolio {
        SimulatedPortfolio {
            portfolio_id: PortfolioId::from(id),
            entry_value_usd: None,
            assets: vec![
                holding("BTC", 3_500.0, None),
                holding("ETH", 3_000.0, None),
                holding("CRO", 2_000.0, None),
                holding("SUI", 1_500.0, None),
            ],
            targets: targets(),
        }
    }

    fn config(id: u64) -> RebalanceConfig {
        RebalanceConfig {
            portfolio_id: PortfolioId::from(id),
            enabled: true,
            wallet_address: Some(format!("0x{id:040x}")),
            drift_threshold_percent: 2.0,
            auto_approval_enabled: true,
            auto_approval_value_ceiling_usd: None,
            inception_nav_usd: None,
            loss_protection: Some(LossProtection {
                enabled: true,
                loss_threshold_percent: 10.0,
                hedge_ratio: 0.5,
                max_leverage: 3.0,
                cooldown_hours: 4.0,
            }),
        }
    }

    struct Harness {
        chain: Arc<SimulatedChainClient>,
        configs: Arc<MemoryConfigStore>,
        store: Arc<MemoryStore>,
        deps: PipelineDeps,
    }

    fn harness() -> Harness {
        let chain = Arc::new(SimulatedChainClient::new());
        let configs = Arc::new(MemoryConfigStore::default());
        let store = Arc::new(MemoryStore::new());
        harness_with_store(chain, configs, store.clone(), store)
    }

    fn harness_with_store(
        chain: Arc<SimulatedChainClient>,
        configs: Arc<MemoryConfigStore>,
        store: Arc<MemoryStore>,
        cooldown_store: Arc<dyn CooldownStore>,
    ) -> Harness {
        let (notifier, _rx) = RiskNotifier::channel(64);
        let deps = PipelineDeps {
            config_store: configs.clone(),
            cooldown_store,
            assessor: Arc::new(PortfolioAssessor::new(chain.clone(), Duration::from_secs(8))),
            decider: Arc::new(RebalanceDecider::new(DecisionPolicy::default())),
            executor: Arc::new(ActionExecutor::new(
                chain.clone(),
                notifier,
                Duration::from_secs(8),
                ExecutionMode::Demo,
                None,
            )),
            max_concurrency: 4,
            lock_ttl: chrono::Duration::minutes(5),
            cooldown_write_retries: 2,
        };
        Harness {
            chain,
            configs,
            store,
            deps,
        }
    }

    #[tokio::test]
    async fn drifted_portfolio_is_rebalanced_and_cooldown_recorded() {
        let h = harness();
        h.chain.upsert(drifted(1, None));
        h.configs.upsert(config(1));
        let now = Utc::now();

        let report = run_tick(&h.deps, now).await;
        assert!(report.success);
        assert_eq!(report.summary.total, 1);
        assert_eq!(report.summary.rebalanced, 1);
        let r = &report.results[0];
        assert_eq!(r.status, ProcessingStatus::Rebalanced);
        assert_eq!(r.decision, Some(DecisionStatus::RebalanceProposed));
        assert_eq!(r.actions.len(), 2);
        assert!(r.tx_hash.is_some());
        assert!(r.proof.is_some());

        let id = PortfolioId::from(1);
        assert_eq!(h.store.get_last_rebalance(&id).await.unwrap(), Some(now));
        assert!(h.store.get_last_hedge(&id).await.unwrap().is_none());

        // Second tick within the window does nothing.
        let again = run_tick(&h.deps, now + chrono::Duration::hours(1)).await;
        assert_eq!(again.results[0].decision, Some(DecisionStatus::SkippedCooldownRebalance));
        assert_eq!(h.chain.submissions().len(), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_others() {
        let h = harness();
        h.chain.upsert(drifted(1, None));
        h.chain.upsert(balanced(3));
        h.configs.upsert(config(1));
        // Portfolio 2 has no chain data at all.
        h.configs.upsert(config(2));
        h.configs.upsert(config(3));
        let mut bad = config(4);
        bad.wallet_address = None;
        h.configs.upsert(bad);

        let report = run_tick(&h.deps, Utc::now()).await;
        assert!(report.success);
        assert_eq!(report.summary.total, 4);
        assert_eq!(report.summary.rebalanced, 1);
        assert_eq!(report.summary.checked, 1);
        assert_eq!(report.summary.errors, 2);

        // Order matches the config store.
        let ids: Vec<&str> = report.results.iter().map(|r| r.portfolio_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert_eq!(report.results[1].error_kind, Some("DataUnavailable"));
        assert_eq!(report.results[3].error_kind, Some("ConfigInvalid"));
    }

    #[tokio::test]
    async fn assessment_failure_leaves_cooldown_untouched() {
        let h = harness();
        h.chain.upsert(drifted(1, None));
        h.configs.upsert(config(1));
        h.chain.set_fail_reads(true);

        let report = run_tick(&h.deps, Utc::now()).await;
        assert_eq!(report.results[0].status, ProcessingStatus::Error);
        let state = h.store.load_state(&PortfolioId::from(1)).await.unwrap();
        assert!(state.last_rebalance_at.is_none());
        assert!(state.last_hedge_at.is_none());
    }

    #[tokio::test]
    async fn execution_failure_allows_retry_next_tick() {
        let h = harness();
        h.chain.upsert(drifted(1, None));
        h.configs.upsert(config(1));
        h.chain.set_fail_submits(true);
        let now = Utc::now();

        let report = run_tick(&h.deps, now).await;
        assert_eq!(report.results[0].status, ProcessingStatus::Error);
        assert_eq!(report.results[0].error_kind, Some("ExecutionFailed"));
        assert!(h.store.get_last_rebalance(&PortfolioId::from(1)).await.unwrap().is_none());

        h.chain.set_fail_submits(false);
        let retry = run_tick(&h.deps, now + chrono::Duration::minutes(5)).await;
        assert_eq!(retry.results[0].status, ProcessingStatus::Rebalanced);
    }

    #[tokio::test]
    async fn loss_breach_hedges_instead_of_rebalancing() {
        let h = harness();
        h.chain.upsert(drifted(1, Some(-12.0)));
        h.configs.upsert(config(1));
        let now = Utc::now();

        let report = run_tick(&h.deps, now).await;
        assert_eq!(report.results[0].status, ProcessingStatus::Hedged);
        assert_eq!(report.summary.hedged, 1);
        assert_eq!(report.summary.rebalanced, 1);
        let subs = h.chain.submissions();
        assert_eq!(subs.len(), 1);
        assert!(matches!(subs[0].plan, ActionPlan::Hedge(_)));

        let id = PortfolioId::from(1);
        assert_eq!(h.store.get_last_hedge(&id).await.unwrap(), Some(now));
        assert!(h.store.get_last_rebalance(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_duplicate_hedge_under_concurrent_triggers() {
        let h = harness();
        h.chain.upsert(drifted(1, Some(-12.0)));
        h.configs.upsert(config(1));
        h.chain.set_latency(Duration::from_millis(50));
        let now = Utc::now();

        let (a, b) = tokio::join!(run_tick(&h.deps, now), run_tick(&h.deps, now));

        let hedges = h
            .chain
            .submissions()
            .iter()
            .filter(|s| matches!(s.plan, ActionPlan::Hedge(_)))
            .count();
        assert_eq!(hedges, 1);

        let statuses = [a.results[0].status, b.results[0].status];
        assert!(statuses.contains(&ProcessingStatus::Hedged));
        assert!(statuses.contains(&ProcessingStatus::Skipped));
    }

    #[tokio::test]
    async fn lease_holds_across_runs_with_distant_decision_times() {
        let h = harness();
        h.chain.upsert(drifted(1, Some(-12.0)));
        h.chain.set_latency(Duration::from_millis(50));
        let t0 = Utc::now();
        // The second run decides with a clock past the first run's lease TTL.
        let t1 = t0 + chrono::Duration::minutes(6);

        let (a, b) = tokio::join!(
            process_portfolio(&h.deps, config(1), t0),
            process_portfolio(&h.deps, config(1), t1),
        );

        let hedges = h
            .chain
            .submissions()
            .iter()
            .filter(|s| matches!(s.plan, ActionPlan::Hedge(_)))
            .count();
        assert_eq!(hedges, 1);
        let statuses = [a.status, b.status];
        assert!(statuses.contains(&ProcessingStatus::Hedged));
        assert!(statuses.contains(&ProcessingStatus::Skipped));

        // Both runs are done, so the lease is free again.
        let id = PortfolioId::from(1);
        let token = h.store.try_acquire_lock(&id, h.deps.lock_ttl).await.unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn malformed_config_entry_is_reported_alongside_valid_ones() {
        let mut h = harness();
        h.chain.upsert(drifted(1, None));
        h.chain.upsert(drifted(2, None));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portfolios.json");
        let json = r#"[
            {"portfolioId": 1, "enabled": true, "walletAddress": "0x01", "driftThresholdPercent": 2},
            {"portfolioId": 2, "enabled": true, "walletAddress": "0x02"}
        ]"#;
        std::fs::write(&path, json).unwrap();
        h.deps.config_store = Arc::new(FileConfigStore::new(&path));

        let report = run_tick(&h.deps, Utc::now()).await;
        assert!(report.success);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.rebalanced, 1);
        assert_eq!(report.summary.errors, 1);

        assert_eq!(report.results[0].portfolio_id.as_str(), "1");
        assert_eq!(report.results[0].status, ProcessingStatus::Rebalanced);
        let bad = &report.results[1];
        assert_eq!(bad.portfolio_id.as_str(), "2");
        assert_eq!(bad.status, ProcessingStatus::Error);
        assert_eq!(bad.error_kind, Some("ConfigInvalid"));
        assert_eq!(h.chain.submissions().len(), 1);
    }

    #[tokio::test]
    async fn hedge_cooldown_blocks_second_tick() {
        let h = harness();
        h.chain.upsert(drifted(1, Some(-12.0)));
        h.configs.upsert(config(1));
        let now = Utc::now();

        run_tick(&h.deps, now).await;
        let second = run_tick(&h.deps, now + chrono::Duration::hours(1)).await;
        assert_eq!(second.results[0].decision, Some(DecisionStatus::SkippedCooldownHedge));
        assert!(second.results[0].message.contains("3.0h"));
        assert_eq!(h.chain.submissions().len(), 1);
    }

    struct FailingWrites(MemoryStore);

    #[async_trait]
    impl CooldownStore for FailingWrites {
        async fn get_last_rebalance(&self, id: &PortfolioId) -> anyhow::Result<Option<DateTime<Utc>>> {
            self.0.get_last_rebalance(id).await
        }
        async fn set_last_rebalance(&self, _: &PortfolioId, _: DateTime<Utc>) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        async fn get_last_hedge(&self, id: &PortfolioId) -> anyhow::Result<Option<DateTime<Utc>>> {
            self.0.get_last_hedge(id).await
        }
        async fn set_last_hedge(&self, _: &PortfolioId, _: DateTime<Utc>) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        async fn try_acquire_lock(
            &self,
            id: &PortfolioId,
            ttl: chrono::Duration,
        ) -> anyhow::Result<Option<LeaseToken>> {
            self.0.try_acquire_lock(id, ttl).await
        }
        async fn release_lock(&self, id: &PortfolioId, token: LeaseToken) -> anyhow::Result<bool> {
            self.0.release_lock(id, token).await
        }
    }

    #[tokio::test]
    async fn unrecorded_cooldown_is_reported_as_warning() {
        let chain = Arc::new(SimulatedChainClient::new());
        let configs = Arc::new(MemoryConfigStore::default());
        let store = Arc::new(MemoryStore::new());
        let h = harness_with_store(
            chain,
            configs,
            store,
            Arc::new(FailingWrites(MemoryStore::new())),
        );
        h.chain.upsert(drifted(1, None));
        h.configs.upsert(config(1));

        let report = run_tick(&h.deps, Utc::now()).await;
        let r = &report.results[0];
        assert_eq!(r.status, ProcessingStatus::Rebalanced);
        assert!(r.warning.as_deref().unwrap_or("").contains("cooldown not recorded"));
    }

    #[tokio::test]
    async fn manual_approval_counts_as_skipped() {
        let h = harness();
        h.chain.upsert(drifted(1, None));
        let mut cfg = config(1);
        cfg.auto_approval_enabled = false;
        h.configs.upsert(cfg);

        let report = run_tick(&h.deps, Utc::now()).await;
        assert_eq!(report.results[0].status, ProcessingStatus::ManualApproval);
        assert_eq!(report.summary.skipped, 1);
        assert!(h.chain.submissions().is_empty());
    }

    #[test]
    fn report_serialises_with_duration_ms() {
        let report = TickReport {
            success: true,
            error: None,
            summary: TickSummary::default(),
            results: vec![],
            duration_ms: 12,
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["durationMs"], 12);
        assert_eq!(v["summary"]["rebalanced"], 0);
        assert!(v.get("error").is_none());
    }
}
