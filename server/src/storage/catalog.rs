//! Model catalog: object id -> metadata.
//!
//! [`MemoryCatalog`] is the default and forgets everything on restart.
//! [`FileCatalog`] keeps the same map and rewrites `catalog.json` after every
//! mutation so the catalog survives restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

use super::model::ModelMetadata;
use crate::error::Result;

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn insert(&self, metadata: ModelMetadata) -> Result<()>;
    async fn get(&self, id: &str) -> Option<ModelMetadata>;
    async fn remove(&self, id: &str) -> Result<Option<ModelMetadata>>;
    /// Point-in-time copy of every entry, in no particular order.
    async fn snapshot(&self) -> Vec<ModelMetadata>;
}

#[derive(Default)]
pub struct MemoryCatalog {
    entries: RwLock<HashMap<String, ModelMetadata>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_entries(entries: HashMap<String, ModelMetadata>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn insert(&self, metadata: ModelMetadata) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(metadata.id.clone(), metadata);
        Ok(())
    }

    async fn get(&self, id: &str) -> Option<ModelMetadata> {
        self.entries.read().await.get(id).cloned()
    }

    async fn remove(&self, id: &str) -> Result<Option<ModelMetadata>> {
        Ok(self.entries.write().await.remove(id))
    }

    async fn snapshot(&self) -> Vec<ModelMetadata> {
        self.entries.read().await.values().cloned().collect()
    }
}

/// Memory catalog mirrored to a JSON file.
pub struct FileCatalog {
    inner: MemoryCatalog,
    path: PathBuf,
    persist_lock: Mutex<()>,
}

impl FileCatalog {
    /// Load the catalog from `path`, or start empty if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries: Vec<ModelMetadata> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Loaded {} catalog entries from {}",
            entries.len(),
            path.display()
        );

        let map = entries.into_iter().map(|m| (m.id.clone(), m)).collect();
        Ok(Self {
            inner: MemoryCatalog::from_entries(map),
            path,
            persist_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.inner.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn insert(&self, metadata: ModelMetadata) -> Result<()> {
        let id = metadata.id.clone();
        self.inner.insert(metadata).await?;
        if let Err(e) = self.persist().await {
            self.inner.remove(&id).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Option<ModelMetadata> {
        self.inner.get(id).await
    }

    async fn remove(&self, id: &str) -> Result<Option<ModelMetadata>> {
        let removed = self.inner.remove(id).await?;
        if let Some(metadata) = &removed {
            if let Err(e) = self.persist().await {
                self.inner.insert(metadata.clone()).await?;
                return Err(e);
            }
        }
        Ok(removed)
    }

    async fn snapshot(&self) -> Vec<ModelMetadata> {
        self.inner.snapshot().await
    }
}
