// =============================================================================
// Durable State — cooldown timestamps, advisory leases, NAV history
// =============================================================================
//
// Cooldown state is the only mutable state shared across invocations. It is
// always read from the backing store at decision time (never cached in
// process) and written only after a successful execution.
//
// The advisory lease serialises decide -> execute per portfolio. Its expiry is
// stamped from the wall clock at acquisition, so it expires on its own if a
// holder crashes. Each grant carries an owner token and only that token can
// release it.
// =============================================================================

pub mod file;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::PortfolioId;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Proof of lease ownership handed out by [`CooldownStore::try_acquire_lock`].
pub type LeaseToken = Uuid;

/// Maximum NAV samples retained per portfolio.
pub const MAX_NAV_SAMPLES: usize = 500;

/// Last automated action times for one portfolio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownState {
    pub portfolio_id: Option<PortfolioId>,
    pub last_rebalance_at: Option<DateTime<Utc>>,
    pub last_hedge_at: Option<DateTime<Utc>>,
}

impl CooldownState {
    /// A state for a portfolio with no recorded actions.
    pub fn fresh(id: &PortfolioId) -> Self {
        Self {
            portfolio_id: Some(id.clone()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn get_last_rebalance(&self, id: &PortfolioId) -> Result<Option<DateTime<Utc>>>;
    async fn set_last_rebalance(&self, id: &PortfolioId, at: DateTime<Utc>) -> Result<()>;
    async fn get_last_hedge(&self, id: &PortfolioId) -> Result<Option<DateTime<Utc>>>;
    async fn set_last_hedge(&self, id: &PortfolioId, at: DateTime<Utc>) -> Result<()>;

    /// Take the advisory lease for `id` unless an unexpired one is held.
    /// Expiry is `Utc::now() + ttl` at the moment of acquisition. Returns
    /// `None` when another run holds it.
    async fn try_acquire_lock(
        &self,
        id: &PortfolioId,
        ttl: chrono::Duration,
    ) -> Result<Option<LeaseToken>>;

    /// Drop the lease if `token` still owns it. Returns `false` when the
    /// lease had already expired and passed to someone else.
    async fn release_lock(&self, id: &PortfolioId, token: LeaseToken) -> Result<bool>;

    async fn load_state(&self, id: &PortfolioId) -> Result<CooldownState> {
        Ok(CooldownState {
            portfolio_id: Some(id.clone()),
            last_rebalance_at: self.get_last_rebalance(id).await?,
            last_hedge_at: self.get_last_hedge(id).await?,
        })
    }
}

/// One observed NAV value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavSample {
    pub at: DateTime<Utc>,
    #[serde(rename = "navUSD")]
    pub nav_usd: f64,
}

/// Aggregates kept per portfolio alongside the capped sample history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavHistory {
    pub first: Option<NavSample>,
    pub peak: Option<NavSample>,
    #[serde(default)]
    pub samples: Vec<NavSample>,
}

impl NavHistory {
    /// Most recent sample before the one just pushed, if any.
    pub fn previous(&self) -> Option<&NavSample> {
        self.samples.iter().rev().nth(1)
    }

    pub(crate) fn push(&mut self, sample: NavSample) {
        if self.first.is_none() {
            self.first = Some(sample);
        }
        if self.peak.map_or(true, |p| sample.nav_usd > p.nav_usd) {
            self.peak = Some(sample);
        }
        self.samples.push(sample);
        if self.samples.len() > MAX_NAV_SAMPLES {
            let excess = self.samples.len() - MAX_NAV_SAMPLES;
            self.samples.drain(..excess);
        }
    }
}

#[async_trait]
pub trait NavStore: Send + Sync {
    /// Append a sample and return the updated history.
    async fn record_nav(&self, id: &PortfolioId, sample: NavSample) -> Result<NavHistory>;
    async fn nav_history(&self, id: &PortfolioId) -> Result<NavHistory>;
}

/// Everything the engine persists for one portfolio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PortfolioRecord {
    #[serde(default)]
    pub last_rebalance_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_hedge_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lock_owner: Option<LeaseToken>,
    #[serde(default)]
    pub nav: NavHistory,
}

impl PortfolioRecord {
    /// Lease acquisition on an already-loaded record.
    pub(crate) fn try_lock(
        &mut self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Option<LeaseToken> {
        match self.lock_expires_at {
            Some(expires) if expires > now => None,
            _ => {
                let token = Uuid::new_v4();
                self.lock_expires_at =
                    Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC));
                self.lock_owner = Some(token);
                Some(token)
            }
        }
    }

    /// Clear the lease only for its current owner.
    pub(crate) fn unlock(&mut self, token: LeaseToken) -> bool {
        if self.lock_owner != Some(token) {
            return false;
        }
        self.lock_expires_at = None;
        self.lock_owner = None;
        true
    }
}
