// =============================================================================
// File-backed durable store
// =============================================================================
//
// A single JSON document keyed by portfolio id. Every read goes to disk and
// every mutation is a read-modify-write followed by an atomic tmp + rename,
// all under one process-wide mutex so concurrent pipelines in this process
// never interleave their read-modify-write cycles.
//
// Disk I/O and the mutex wait both run on tokio's blocking pool, never on a
// runtime worker.
// =============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::{CooldownStore, LeaseToken, NavHistory, NavSample, NavStore, PortfolioRecord};
use crate::types::PortfolioId;

type Document = BTreeMap<String, PortfolioRecord>;

pub struct FileStore {
    inner: Arc<StateFile>,
}

struct StateFile {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl StateFile {
    fn read_document(&self) -> Result<Document> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(Document::new()),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read state file {}", self.path.display())),
        }
    }

    fn write_document(&self, doc: &Document) -> Result<()> {
        let content = serde_json::to_string_pretty(doc).context("failed to serialise state")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp state to {}", self.path.display()))?;
        Ok(())
    }

    fn read_record(&self, id: &str) -> Result<Option<PortfolioRecord>> {
        let _guard = self.write_guard.lock();
        Ok(self.read_document()?.remove(id))
    }

    /// Read-modify-write one record atomically with respect to this process.
    fn update<T>(&self, id: &str, f: impl FnOnce(&mut PortfolioRecord) -> T) -> Result<T> {
        let _guard = self.write_guard.lock();
        let mut doc = self.read_document()?;
        let out = f(doc.entry(id.to_string()).or_default());
        self.write_document(&doc)?;
        debug!(portfolio_id = %id, path = %self.path.display(), "state record updated");
        Ok(out)
    }
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StateFile {
                path: path.into(),
                write_guard: Mutex::new(()),
            }),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&StateFile) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .context("state file task failed")?
    }

    async fn read_record(&self, id: &PortfolioId) -> Result<Option<PortfolioRecord>> {
        let id = id.as_str().to_string();
        self.blocking(move |file| file.read_record(&id)).await
    }

    async fn update<T, F>(&self, id: &PortfolioId, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PortfolioRecord) -> T + Send + 'static,
    {
        let id = id.as_str().to_string();
        self.blocking(move |file| file.update(&id, f)).await
    }
}

#[async_trait]
impl CooldownStore for FileStore {
    async fn get_last_rebalance(&self, id: &PortfolioId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_record(id).await?.and_then(|r| r.last_rebalance_at))
    }

    async fn set_last_rebalance(&self, id: &PortfolioId, at: DateTime<Utc>) -> Result<()> {
        self.update(id, move |r| r.last_rebalance_at = Some(at)).await
    }

    async fn get_last_hedge(&self, id: &PortfolioId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_record(id).await?.and_then(|r| r.last_hedge_at))
    }

    async fn set_last_hedge(&self, id: &PortfolioId, at: DateTime<Utc>) -> Result<()> {
        self.update(id, move |r| r.last_hedge_at = Some(at)).await
    }

    async fn try_acquire_lock(
        &self,
        id: &PortfolioId,
        ttl: chrono::Duration,
    ) -> Result<Option<LeaseToken>> {
        // Clock read under the file mutex, right before the expiry check.
        self.update(id, move |r| r.try_lock(Utc::now(), ttl)).await
    }

    async fn release_lock(&self, id: &PortfolioId, token: LeaseToken) -> Result<bool> {
        self.update(id, move |r| r.unlock(token)).await
    }
}

#[async_trait]
impl NavStore for FileStore {
    async fn record_nav(&self, id: &PortfolioId, sample: NavSample) -> Result<NavHistory> {
        self.update(id, move |r| {
            r.nav.push(sample);
            r.nav.clone()
        })
        .await
    }

    async fn nav_history(&self, id: &PortfolioId) -> Result<NavHistory> {
        Ok(self.read_record(id).await?.map(|r| r.nav).unwrap_or_default())
    }
}
