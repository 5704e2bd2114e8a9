// =============================================================================
// NAV Monitor — periodic net-asset-value sampling and drawdown alerts
// =============================================================================
//
// Each check reads holdings for every enabled portfolio, appends a NAV sample
// to the store and reports change since the previous sample, drawdown from
// the observed peak, and return since the first observation.
//
// Return since inception is reported only when the operator configured the
// inception NAV. Without it there is no trustworthy baseline, so the field is
// omitted rather than approximated.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::chain::ChainClient;
use crate::config_store::{ConfigEntry, ConfigStore};
use crate::error::PipelineError;
use crate::notify::{RiskEvent, RiskNotifier};
use crate::store::{NavSample, NavStore};
use crate::types::PortfolioId;

#[derive(Clone)]
pub struct NavMonitorDeps {
    pub config_store: Arc<dyn ConfigStore>,
    pub chain: Arc<dyn ChainClient>,
    pub nav_store: Arc<dyn NavStore>,
    pub notifier: RiskNotifier,
    pub chain_timeout: Duration,
    pub drawdown_alert_percent: f64,
    pub max_concurrency: usize,
}

/// Where a return figure is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavBaseline {
    /// Operator-supplied `inceptionNavUSD`.
    Configured,
    /// First NAV sample this service recorded.
    Observed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavCheckResult {
    pub portfolio_id: PortfolioId,
    pub success: bool,
    #[serde(rename = "navUSD", skip_serializing_if = "Option::is_none")]
    pub nav_usd: Option<f64>,
    #[serde(rename = "peakNavUSD", skip_serializing_if = "Option::is_none")]
    pub peak_nav_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawdown_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_since_last_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_first_observation_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_inception_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<NavBaseline>,
    pub drawdown_alert: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl NavCheckResult {
    fn failed(portfolio_id: PortfolioId, err: &PipelineError) -> Self {
        Self {
            portfolio_id,
            success: false,
            nav_usd: None,
            peak_nav_usd: None,
            drawdown_percent: None,
            change_since_last_percent: None,
            since_first_observation_percent: None,
            since_inception_percent: None,
            baseline: None,
            drawdown_alert: false,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavCheckReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked: usize,
    pub alerts: usize,
    pub errors: usize,
    pub results: Vec<NavCheckResult>,
    pub duration_ms: u64,
}

fn percent_change(from: f64, to: f64) -> Option<f64> {
    (from > 0.0 && from.is_finite()).then(|| (to - from) / from * 100.0)
}

/// Sample NAV for every enabled portfolio.
pub async fn run_nav_check(deps: &NavMonitorDeps, now: DateTime<Utc>) -> NavCheckReport {
    let started = Instant::now();

    let portfolios = match deps.config_store.list_enabled_portfolios().await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "nav check: failed to list portfolios");
            return NavCheckReport {
                success: false,
                error: Some(format!("failed to list portfolios: {e:#}")),
                checked: 0,
                alerts: 0,
                errors: 0,
                results: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }
    };

    let results: Vec<NavCheckResult> = stream::iter(portfolios)
        .map(|entry| check_portfolio(deps, entry, now))
        .buffered(deps.max_concurrency.max(1))
        .collect()
        .await;

    let checked = results.iter().filter(|r| r.success).count();
    let alerts = results.iter().filter(|r| r.drawdown_alert).count();
    let errors = results.len() - checked;
    let duration_ms = started.elapsed().as_millis() as u64;
    info!(checked, alerts, errors, duration_ms, "nav check completed");

    NavCheckReport {
        success: true,
        error: None,
        checked,
        alerts,
        errors,
        results,
        duration_ms,
    }
}

async fn check_portfolio(
    deps: &NavMonitorDeps,
    entry: ConfigEntry,
    now: DateTime<Utc>,
) -> NavCheckResult {
    let id = entry.portfolio_id().clone();
    let config = match entry.into_config() {
        Ok(c) => c,
        Err(e) => return NavCheckResult::failed(id, &e),
    };

    let wallet = match config.validate() {
        Ok(w) => w,
        Err(e) => return NavCheckResult::failed(id, &e),
    };

    let holdings = match tokio::time::timeout(
        deps.chain_timeout,
        deps.chain.get_portfolio_assets(&id, wallet),
    )
    .await
    {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => {
            let err = PipelineError::DataUnavailable(format!("holdings read failed: {e:#}"));
            warn!(portfolio_id = %id, error = %err, "nav check skipped");
            return NavCheckResult::failed(id, &err);
        }
        Err(_) => {
            let err = PipelineError::DataUnavailable(format!(
                "holdings read timed out after {}s",
                deps.chain_timeout.as_secs()
            ));
            warn!(portfolio_id = %id, error = %err, "nav check skipped");
            return NavCheckResult::failed(id, &err);
        }
    };

    let nav: f64 = holdings.assets.iter().map(|a| a.value_usd).sum();
    if !(nav.is_finite() && nav > 0.0) {
        let err = PipelineError::DataUnavailable(format!("no holdings value detected (nav {nav})"));
        warn!(portfolio_id = %id, "nav check skipped: zero NAV");
        return NavCheckResult::failed(id, &err);
    }

    let history = match deps
        .nav_store
        .record_nav(&id, NavSample { at: now, nav_usd: nav })
        .await
    {
        Ok(h) => h,
        Err(e) => {
            let err = PipelineError::DataUnavailable(format!("nav history write failed: {e:#}"));
            warn!(portfolio_id = %id, error = %err, "nav check failed");
            return NavCheckResult::failed(id, &err);
        }
    };

    let peak = history.peak.map_or(nav, |p| p.nav_usd);
    let drawdown = if peak > 0.0 {
        ((peak - nav) / peak * 100.0).max(0.0)
    } else {
        0.0
    };
    let change_since_last = history
        .previous()
        .and_then(|p| percent_change(p.nav_usd, nav));
    let since_first = history
        .first
        .filter(|f| f.at != now)
        .and_then(|f| percent_change(f.nav_usd, nav));
    let since_inception = config
        .inception_nav_usd
        .and_then(|base| percent_change(base, nav));

    let baseline = if since_inception.is_some() {
        Some(NavBaseline::Configured)
    } else if since_first.is_some() {
        Some(NavBaseline::Observed)
    } else {
        None
    };

    let drawdown_alert = drawdown >= deps.drawdown_alert_percent;
    if drawdown_alert {
        warn!(
            portfolio_id = %id,
            nav_usd = nav,
            peak_nav_usd = peak,
            drawdown_percent = drawdown,
            "NAV drawdown beyond alert threshold"
        );
        deps.notifier.notify(RiskEvent::NavDrawdown {
            portfolio_id: id.clone(),
            nav_usd: nav,
            peak_nav_usd: peak,
            drawdown_percent: drawdown,
            at: now,
        });
    }

    NavCheckResult {
        portfolio_id: id,
        success: true,
        nav_usd: Some(nav),
        peak_nav_usd: Some(peak),
        drawdown_percent: Some(drawdown),
        change_since_last_percent: change_since_last,
        since_first_observation_percent: since_first,
        since_inception_percent: since_inception,
        baseline,
        drawdown_alert,
        error: None,
        error_kind: None,
    }
}
