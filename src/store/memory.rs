// In-memory state store for demo wiring and tests. Not durable.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CooldownStore, LeaseToken, NavHistory, NavSample, NavStore, PortfolioRecord};
use crate::types::PortfolioId;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<PortfolioId, PortfolioRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(&self, id: &PortfolioId, f: impl FnOnce(&mut PortfolioRecord) -> T) -> T {
        let mut records = self.records.lock();
        f(records.entry(id.clone()).or_default())
    }
}

#[async_trait]
impl CooldownStore for MemoryStore {
    async fn get_last_rebalance(&self, id: &PortfolioId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.records.lock().get(id).and_then(|r| r.last_rebalance_at))
    }

    async fn set_last_rebalance(&self, id: &PortfolioId, at: DateTime<Utc>) -> Result<()> {
        self.with_record(id, |r| r.last_rebalance_at = Some(at));
        Ok(())
    }

    async fn get_last_hedge(&self, id: &PortfolioId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.records.lock().get(id).and_then(|r| r.last_hedge_at))
    }

    async fn set_last_hedge(&self, id: &PortfolioId, at: DateTime<Utc>) -> Result<()> {
        self.with_record(id, |r| r.last_hedge_at = Some(at));
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        id: &PortfolioId,
        ttl: chrono::Duration,
    ) -> Result<Option<LeaseToken>> {
        Ok(self.with_record(id, |r| r.try_lock(Utc::now(), ttl)))
    }

    async fn release_lock(&self, id: &PortfolioId, token: LeaseToken) -> Result<bool> {
        Ok(self.with_record(id, |r| r.unlock(token)))
    }
}

#[async_trait]
impl NavStore for MemoryStore {
    async fn record_nav(&self, id: &PortfolioId, sample: NavSample) -> Result<NavHistory> {
        Ok(self.with_record(id, |r| {
            r.nav.push(sample);
            r.nav.clone()
        }))
    }

    async fn nav_history(&self, id: &PortfolioId) -> Result<NavHistory> {
        Ok(self
            .records
            .lock()
            .get(id)
            .map(|r| r.nav.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_portfolio_has_no_cooldown() {
        let store = MemoryStore::new();
        let id = PortfolioId::from(9);
        let state = store.load_state(&id).await.unwrap();
        assert!(state.last_rebalance_at.is_none());
        assert!(state.last_hedge_at.is_none());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let id = PortfolioId::from(1);
        let ttl = chrono::Duration::minutes(5);
        let token = store.try_acquire_lock(&id, ttl).await.unwrap().unwrap();
        assert!(store.try_acquire_lock(&id, ttl).await.unwrap().is_none());
        assert!(!store.release_lock(&id, uuid::Uuid::new_v4()).await.unwrap());
        assert!(store.try_acquire_lock(&id, ttl).await.unwrap().is_none());
        assert!(store.release_lock(&id, token).await.unwrap());
        assert!(store.try_acquire_lock(&id, ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_passes_to_next_caller() {
        let store = MemoryStore::new();
        let id = PortfolioId::from(1);
        let first = store
            .try_acquire_lock(&id, chrono::Duration::milliseconds(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        let second = store
            .try_acquire_lock(&id, chrono::Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        // The first holder finishing late must not free the second's lease.
        assert!(!store.release_lock(&id, first).await.unwrap());
        assert!(store.try_acquire_lock(&id, chrono::Duration::minutes(5)).await.unwrap().is_none());
        assert!(store.release_lock(&id, second).await.unwrap());
    }
}
