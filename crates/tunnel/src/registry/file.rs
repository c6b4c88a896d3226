//! JSON file backed node store

use super::{NodeRecord, NodeStore, Result, insert_unique, remove_by_id};
use crate::common::error::RegistryError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Node list persisted as a JSON array of `{"name", "uuid"}` objects
///
/// A missing file is an empty registry. Writes go to a temporary file that
/// is renamed over the previous one.
#[derive(Debug)]
pub struct FileNodeStore {
    path: PathBuf,
    // Serializes read-modify-write cycles from the admin API
    write_lock: Mutex<()>,
}

impl FileNodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<NodeRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Node file {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(RegistryError::Unavailable(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            warn!("Node file {} is not valid JSON: {}", self.path.display(), e);
            RegistryError::Unavailable(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    async fn save(&self, records: &[NodeRecord]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RegistryError::Unavailable(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &json).await.map_err(|e| {
            RegistryError::Unavailable(format!("failed to write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            RegistryError::Unavailable(format!("failed to replace {}: {e}", self.path.display()))
        })?;

        debug!("Saved {} node(s) to {}", records.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl NodeStore for FileNodeStore {
    async fn list(&self) -> Result<Vec<NodeRecord>> {
        self.load().await
    }

    async fn add(&self, record: NodeRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        insert_unique(&mut records, record)?;
        self.save(&records).await
    }

    async fn remove(&self, identifier: &str) -> Result<NodeRecord> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let removed = remove_by_id(&mut records, identifier)?;
        self.save(&records).await?;
        Ok(removed)
    }
}
