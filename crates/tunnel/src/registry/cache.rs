//! Short-lived snapshot cache in front of a node store

use super::{NodeRecord, NodeStore, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Snapshot {
    taken_at: Instant,
    records: Arc<Vec<NodeRecord>>,
}

/// Caches `list()` results for `ttl` to bound store load under connection
/// bursts
///
/// Failed reads are never cached. `add` and `remove` invalidate the
/// snapshot. A zero TTL disables caching.
#[derive(Debug)]
pub struct CachedNodeStore<S> {
    inner: S,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl<S: NodeStore> CachedNodeStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Drop the cached snapshot so the next `list` reads through
    pub async fn invalidate(&self) {
        self.snapshot.write().await.take();
    }

    async fn fresh(&self) -> Option<Arc<Vec<NodeRecord>>> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .as_ref()
            .filter(|s| s.taken_at.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.records))
    }
}

#[async_trait]
impl<S: NodeStore> NodeStore for CachedNodeStore<S> {
    async fn list(&self) -> Result<Vec<NodeRecord>> {
        if self.ttl.is_zero() {
            return self.inner.list().await;
        }

        if let Some(records) = self.fresh().await {
            trace!("Node list served from cache");
            return Ok(records.as_ref().clone());
        }

        let records = self.inner.list().await?;
        *self.snapshot.write().await = Some(Snapshot {
            taken_at: Instant::now(),
            records: Arc::new(records.clone()),
        });
        Ok(records)
    }

    async fn add(&self, record: NodeRecord) -> Result<()> {
        let result = self.inner.add(record).await;
        self.invalidate().await;
        result
    }

    async fn remove(&self, identifier: &str) -> Result<NodeRecord> {
        let result = self.inner.remove(identifier).await;
        self.invalidate().await;
        result
    }
}
