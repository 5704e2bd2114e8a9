// =============================================================================
// Central Application State — RWA Rebalance Engine
// =============================================================================
//
// Ties the collaborators (chain client, config store, durable store, risk
// notifier) to the pipeline components and keeps a small in-memory audit
// trail for the API.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the ring buffers.
//   - Arc wrappers for collaborators that manage their own interior
//     mutability.
//
// Nothing in here is the source of truth for cooldowns: those are always read
// from the durable store.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::assessor::PortfolioAssessor;
use crate::chain::ChainClient;
use crate::config_store::ConfigStore;
use crate::decider::{DecisionPolicy, RebalanceDecider};
use crate::executor::ActionExecutor;
use crate::nav_monitor::NavMonitorDeps;
use crate::notify::RiskNotifier;
use crate::runtime_config::ServiceConfig;
use crate::scheduler::{PipelineDeps, ProcessingResult, TickSummary};
use crate::store::{CooldownStore, NavStore};

// =============================================================================
// Error Record
// =============================================================================

/// A tick-level failure kept for the results endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Outline of the most recent completed tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastTick {
    pub at: DateTime<Utc>,
    pub summary: TickSummary,
    pub duration_ms: u64,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent tick errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent processing results to retain.
const MAX_RECENT_RESULTS: usize = 100;

/// Shared across all request handlers via `Arc<AppState>`.
pub struct AppState {
    /// Incremented on every recorded tick or error.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: ServiceConfig,
    /// Bearer credential for the trigger endpoints. Empty means every
    /// protected request is rejected.
    pub cron_secret: String,

    // ── Collaborators ───────────────────────────────────────────────────
    pub chain: Arc<dyn ChainClient>,
    pub config_store: Arc<dyn ConfigStore>,
    pub cooldown_store: Arc<dyn CooldownStore>,
    pub nav_store: Arc<dyn NavStore>,
    pub notifier: RiskNotifier,

    // ── Pipeline ────────────────────────────────────────────────────────
    pub assessor: Arc<PortfolioAssessor>,
    pub decider: Arc<RebalanceDecider>,
    pub executor: Arc<ActionExecutor>,

    // ── Audit trail ─────────────────────────────────────────────────────
    pub recent_results: RwLock<Vec<ProcessingResult>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub last_tick: RwLock<Option<LastTick>>,

    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire the pipeline from its collaborators. `store` backs both cooldown
    /// state and NAV history.
    pub fn new<S>(
        config: ServiceConfig,
        cron_secret: String,
        chain: Arc<dyn ChainClient>,
        config_store: Arc<dyn ConfigStore>,
        store: Arc<S>,
        notifier: RiskNotifier,
        proof_key: Option<Vec<u8>>,
    ) -> Self
    where
        S: CooldownStore + NavStore + 'static,
    {
        let timeout = config.chain_timeout();
        let proof_key = if config.proof_signing { proof_key } else { None };

        let assessor = PortfolioAssessor::new(chain.clone(), timeout);
        let decider = RebalanceDecider::new(DecisionPolicy::from(&config));
        let executor = ActionExecutor::new(
            chain.clone(),
            notifier.clone(),
            timeout,
            config.execution_mode,
            proof_key,
        );

        Self {
            state_version: AtomicU64::new(1),
            config,
            cron_secret,
            chain,
            config_store,
            cooldown_store: store.clone(),
            nav_store: store,
            notifier,
            assessor: Arc::new(assessor),
            decider: Arc::new(decider),
            executor: Arc::new(executor),
            recent_results: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            last_tick: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn pipeline_deps(&self) -> PipelineDeps {
        PipelineDeps {
            config_store: self.config_store.clone(),
            cooldown_store: self.cooldown_store.clone(),
            assessor: self.assessor.clone(),
            decider: self.decider.clone(),
            executor: self.executor.clone(),
            max_concurrency: self.config.max_concurrent_portfolios,
            lock_ttl: self.config.lock_ttl(),
            cooldown_write_retries: self.config.cooldown_write_retries,
        }
    }

    pub fn nav_deps(&self) -> NavMonitorDeps {
        NavMonitorDeps {
            config_store: self.config_store.clone(),
            chain: self.chain.clone(),
            nav_store: self.nav_store.clone(),
            notifier: self.notifier.clone(),
            chain_timeout: self.config.chain_timeout(),
            drawdown_alert_percent: self.config.nav_drawdown_alert_percent,
            max_concurrency: self.config.max_concurrent_portfolios,
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Audit ───────────────────────────────────────────────────────────

    /// Record the outcome of a completed tick. The results ring is capped at
    /// [`MAX_RECENT_RESULTS`]; oldest entries are evicted first.
    pub fn record_tick(
        &self,
        at: DateTime<Utc>,
        summary: TickSummary,
        duration_ms: u64,
        results: &[ProcessingResult],
    ) {
        {
            let mut recent = self.recent_results.write();
            recent.extend_from_slice(results);
            if recent.len() > MAX_RECENT_RESULTS {
                let excess = recent.len() - MAX_RECENT_RESULTS;
                recent.drain(..excess);
            }
        }
        *self.last_tick.write() = Some(LastTick {
            at,
            summary,
            duration_ms,
        });
        self.increment_version();
    }

    pub fn push_error(&self, msg: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    pub fn build_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            execution_mode: self.config.execution_mode.to_string(),
            last_tick: self.last_tick.read().clone(),
            recent_results: self.recent_results.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }

    /// Minimal state for handler tests: simulated chain, in-memory stores.
    #[cfg(test)]
    pub(crate) fn for_tests(
        chain: Arc<crate::chain::SimulatedChainClient>,
        configs: Vec<crate::config_store::RebalanceConfig>,
        cron_secret: &str,
    ) -> Arc<Self> {
        let (notifier, _rx) = RiskNotifier::channel(64);
        Arc::new(Self::new(
            ServiceConfig::default(),
            cron_secret.to_string(),
            chain,
            Arc::new(crate::config_store::MemoryConfigStore::new(configs)),
            Arc::new(crate::store::MemoryStore::new()),
            notifier,
            None,
        ))
    }
}

/// Service status sent by `GET /api/v1/results`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub execution_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<LastTick>,
    pub recent_results: Vec<ProcessingResult>,
    pub recent_errors: Vec<ErrorRecord>,
}
