//! Node registry: the provisioned client identities
//!
//! The relay only ever calls [`NodeStore::list`]. Mutation goes through the
//! admin API.

pub mod cache;
pub mod file;

pub use cache::CachedNodeStore;
pub use file::FileNodeStore;

use crate::common::error::RegistryError;
use async_trait::async_trait;
use edgetunnel_core::tracing::metrics::gauge;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// One provisioned client identity
///
/// Serialized as `{"name": ..., "uuid": ...}`, the layout of the persisted
/// node list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Credential string, usually a UUID
    #[serde(rename = "uuid")]
    pub identifier: String,
    #[serde(rename = "name", default)]
    pub display_name: String,
}

impl NodeRecord {
    pub fn new(identifier: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
        }
    }
}

/// Ordered collection of node records
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Current persisted set, in insertion order
    ///
    /// Fails with [`RegistryError::Unavailable`] rather than returning an
    /// empty or stale set when the backing store cannot be read.
    async fn list(&self) -> Result<Vec<NodeRecord>>;

    /// Append a record; identifiers are unique
    async fn add(&self, record: NodeRecord) -> Result<()>;

    /// Remove and return the record with `identifier`
    async fn remove(&self, identifier: &str) -> Result<NodeRecord>;
}

pub(crate) fn insert_unique(records: &mut Vec<NodeRecord>, record: NodeRecord) -> Result<()> {
    if records.iter().any(|r| r.identifier == record.identifier) {
        return Err(RegistryError::Duplicate(record.identifier));
    }
    records.push(record);
    gauge("registry_nodes").set(records.len() as i64);
    Ok(())
}

pub(crate) fn remove_by_id(records: &mut Vec<NodeRecord>, identifier: &str) -> Result<NodeRecord> {
    let index = records
        .iter()
        .position(|r| r.identifier == identifier)
        .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))?;
    let record = records.remove(index);
    gauge("registry_nodes").set(records.len() as i64);
    Ok(record)
}

/// In-process store
#[derive(Debug, Clone, Default)]
pub struct MemoryNodeStore {
    records: Arc<RwLock<Vec<NodeRecord>>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `records`; later duplicates are dropped
    pub fn with_records(records: impl IntoIterator<Item = NodeRecord>) -> Self {
        let mut seeded = Vec::new();
        for record in records {
            if let Err(e) = insert_unique(&mut seeded, record) {
                debug!("Skipping seed record: {}", e);
            }
        }
        Self {
            records: Arc::new(RwLock::new(seeded)),
        }
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn list(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.records.read().await.clone())
    }

    async fn add(&self, record: NodeRecord) -> Result<()> {
        let mut records = self.records.write().await;
        insert_unique(&mut records, record)
    }

    async fn remove(&self, identifier: &str) -> Result<NodeRecord> {
        let mut records = self.records.write().await;
        remove_by_id(&mut records, identifier)
    }
}
