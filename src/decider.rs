// =============================================================================
// Rebalance Decider — ordered, pure decision state machine
// =============================================================================
//
// Evaluation order (first match wins):
//   1. Loss protection    — breached loss + hedge cooldown clear -> HEDGED
//                           breached loss + in cooldown          -> SKIPPED_COOLDOWN_HEDGE
//   2. Rebalance cooldown — last rebalance too recent           -> SKIPPED_COOLDOWN_REBALANCE
//   3. Drift threshold    — max |drift| <= threshold            -> CHECKED_OK
//   4. Approval gating    — auto-approval off                   -> REQUIRES_MANUAL_APPROVAL
//                           NAV above auto-approval ceiling     -> SKIPPED_VALUE_CEILING
//   5. Otherwise          — BUY/SELL legs per drifted asset     -> REBALANCE_PROPOSED
//
// No I/O and no clock reads: `now` is an argument, so identical inputs always
// yield identical results.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::assessor::{AssetSnapshot, PortfolioAssessment};
use crate::config_store::{LossProtection, RebalanceConfig};
use crate::runtime_config::{hours_to_duration, ServiceConfig};
use crate::store::CooldownState;
use crate::types::{ActionPlan, HedgeAction, HedgeSide, RebalanceAction, TradeSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    CheckedOk,
    RebalanceProposed,
    Hedged,
    SkippedCooldownHedge,
    SkippedCooldownRebalance,
    RequiresManualApproval,
    SkippedValueCeiling,
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CheckedOk => "CHECKED_OK",
            Self::RebalanceProposed => "REBALANCE_PROPOSED",
            Self::Hedged => "HEDGED",
            Self::SkippedCooldownHedge => "SKIPPED_COOLDOWN_HEDGE",
            Self::SkippedCooldownRebalance => "SKIPPED_COOLDOWN_REBALANCE",
            Self::RequiresManualApproval => "REQUIRES_MANUAL_APPROVAL",
            Self::SkippedValueCeiling => "SKIPPED_VALUE_CEILING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResult {
    pub status: DecisionStatus,
    pub plan: ActionPlan,
    pub reason: String,
    pub max_abs_drift: f64,
}

impl DecisionResult {
    fn new(status: DecisionStatus, plan: ActionPlan, reason: String, max_abs_drift: f64) -> Self {
        Self {
            status,
            plan,
            reason,
            max_abs_drift,
        }
    }
}

/// System-wide policy constants the decider applies to every portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPolicy {
    pub rebalance_cooldown: chrono::Duration,
    pub hedge_leverage_cap: f64,
    pub min_actionable_drift_percent: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            rebalance_cooldown: chrono::Duration::hours(24),
            hedge_leverage_cap: 5.0,
            min_actionable_drift_percent: 1.0,
        }
    }
}

impl From<&ServiceConfig> for DecisionPolicy {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            rebalance_cooldown: cfg.rebalance_cooldown(),
            hedge_leverage_cap: cfg.hedge_leverage_cap,
            min_actionable_drift_percent: cfg.min_actionable_drift_percent,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RebalanceDecider {
    policy: DecisionPolicy,
}

impl RebalanceDecider {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }

    pub fn decide(
        &self,
        assessment: &PortfolioAssessment,
        config: &RebalanceConfig,
        cooldown: &CooldownState,
        now: DateTime<Utc>,
    ) -> DecisionResult {
        let max_abs_drift = assessment.max_abs_drift();

        // 1. Loss protection pre-empts any drift correction.
        if let (Some(lp), Some(pnl)) = (
            config.loss_protection.as_ref().filter(|lp| lp.enabled),
            assessment.pnl_percent,
        ) {
            if pnl < -lp.loss_threshold_percent {
                return self.loss_protection(assessment, lp, pnl, cooldown, now, max_abs_drift);
            }
        }

        // 2. Rebalance cooldown applies regardless of drift size.
        if let Some(remaining) =
            remaining_cooldown(cooldown.last_rebalance_at, self.policy.rebalance_cooldown, now)
        {
            return DecisionResult::new(
                DecisionStatus::SkippedCooldownRebalance,
                ActionPlan::Empty,
                format!(
                    "rebalance cooldown active: {:.1}h remaining",
                    hours(remaining)
                ),
                max_abs_drift,
            );
        }

        // 3. Threshold is strict: drift equal to it does not trigger.
        if max_abs_drift <= config.drift_threshold_percent {
            return DecisionResult::new(
                DecisionStatus::CheckedOk,
                ActionPlan::Empty,
                format!(
                    "max drift {:.2}% within {:.2}% threshold",
                    max_abs_drift, config.drift_threshold_percent
                ),
                max_abs_drift,
            );
        }

        // 4. Approval gating.
        if !config.auto_approval_enabled {
            return DecisionResult::new(
                DecisionStatus::RequiresManualApproval,
                ActionPlan::Empty,
                format!(
                    "max drift {:.2}% exceeds {:.2}% threshold; auto-approval disabled",
                    max_abs_drift, config.drift_threshold_percent
                ),
                max_abs_drift,
            );
        }
        if let Some(ceiling) = config.auto_approval_value_ceiling_usd {
            if assessment.total_value_usd > ceiling {
                return DecisionResult::new(
                    DecisionStatus::SkippedValueCeiling,
                    ActionPlan::Empty,
                    format!(
                        "NAV ${:.2} exceeds auto-approval ceiling ${:.2}",
                        assessment.total_value_usd, ceiling
                    ),
                    max_abs_drift,
                );
            }
        }

        // 5. Drift-correcting legs.
        let actions = self.rebalance_actions(assessment);
        DecisionResult::new(
            DecisionStatus::RebalanceProposed,
            ActionPlan::Rebalance(actions),
            format!(
                "max drift {:.2}% exceeds {:.2}% threshold",
                max_abs_drift, config.drift_threshold_percent
            ),
            max_abs_drift,
        )
    }

    fn loss_protection(
        &self,
        assessment: &PortfolioAssessment,
        lp: &LossProtection,
        pnl: f64,
        cooldown: &CooldownState,
        now: DateTime<Utc>,
        max_abs_drift: f64,
    ) -> DecisionResult {
        let hedge_cooldown = hours_to_duration(lp.cooldown_hours);
        if let Some(remaining) = remaining_cooldown(cooldown.last_hedge_at, hedge_cooldown, now) {
            return DecisionResult::new(
                DecisionStatus::SkippedCooldownHedge,
                ActionPlan::Empty,
                format!(
                    "loss {:.2}% breaches -{:.2}% but hedge cooldown active: {:.1}h remaining",
                    pnl,
                    lp.loss_threshold_percent,
                    hours(remaining)
                ),
                max_abs_drift,
            );
        }

        // Most negative pnl wins; ties keep the first. Without any per-asset
        // pnl the largest position is hedged.
        let mut target: Option<(&str, f64)> = None;
        for a in &assessment.assets {
            if let Some(p) = a.pnl_percent {
                if target.map_or(true, |(_, best)| p < best) {
                    target = Some((&a.symbol, p));
                }
            }
        }
        let asset = match target {
            Some((symbol, _)) => symbol.to_string(),
            None => {
                let mut largest: Option<&AssetSnapshot> = None;
                for a in &assessment.assets {
                    if largest.map_or(true, |l| a.current_value_usd > l.current_value_usd) {
                        largest = Some(a);
                    }
                }
                match largest {
                    Some(a) => a.symbol.clone(),
                    None => {
                        return DecisionResult::new(
                            DecisionStatus::CheckedOk,
                            ActionPlan::Empty,
                            "loss threshold breached but portfolio holds no assets".to_string(),
                            max_abs_drift,
                        )
                    }
                }
            }
        };

        let leverage = lp.max_leverage.min(self.policy.hedge_leverage_cap);
        let reason = format!(
            "portfolio pnl {:.2}% below -{:.2}% loss threshold",
            pnl, lp.loss_threshold_percent
        );
        DecisionResult::new(
            DecisionStatus::Hedged,
            ActionPlan::Hedge(HedgeAction {
                asset,
                side: HedgeSide::Short,
                notional_usd: assessment.total_value_usd * lp.hedge_ratio,
                leverage,
                reason: reason.clone(),
            }),
            reason,
            max_abs_drift,
        )
    }

    /// One leg per asset beyond the actionable floor, most under-allocated
    /// first. Zero-target holdings are always fully divested.
    fn rebalance_actions(&self, assessment: &PortfolioAssessment) -> Vec<RebalanceAction> {
        let mut legs: Vec<(f64, RebalanceAction)> = Vec::new();

        for snap in &assessment.assets {
            let drift = snap.current_percent - snap.target_percent;

            if snap.target_percent == 0.0 && snap.current_value_usd > 0.0 {
                legs.push((
                    drift,
                    RebalanceAction {
                        asset: snap.symbol.clone(),
                        action: TradeSide::Sell,
                        amount_usd: snap.current_value_usd,
                        reason: format!(
                            "not in target allocation; divest {:.2}%",
                            snap.current_percent
                        ),
                    },
                ));
                continue;
            }

            if drift.abs() <= self.policy.min_actionable_drift_percent {
                continue;
            }

            let side = if drift < 0.0 { TradeSide::Buy } else { TradeSide::Sell };
            legs.push((
                drift,
                RebalanceAction {
                    asset: snap.symbol.clone(),
                    action: side,
                    amount_usd: drift.abs() / 100.0 * assessment.total_value_usd,
                    reason: format!(
                        "{} at {:.2}% vs target {:.2}% (drift {:+.2}%)",
                        snap.symbol, snap.current_percent, snap.target_percent, drift
                    ),
                },
            ));
        }

        legs.sort_by(|a, b| a.0.total_cmp(&b.0));
        legs.into_iter().map(|(_, leg)| leg).collect()
    }
}

/// Time left in a cooldown window, or `None` when it has elapsed (or never
/// started).
fn remaining_cooldown(
    last: Option<DateTime<Utc>>,
    period: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<chrono::Duration> {
    let elapsed = now.signed_duration_since(last?);
    if elapsed >= period {
        return None;
    }
    // A timestamp far in the future can push the difference out of range.
    Some(
        period
            .checked_sub(&elapsed)
            .unwrap_or_else(chrono::Duration::max_value),
    )
}

fn hours(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 3_600_000.0
}
