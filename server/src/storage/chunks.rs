//! Position-indexed chunk persistence.
//!
//! Layout: `{base_path}/{object_id}/chunk_{index}`. Reconstruction order comes
//! from the index in the file name, never from content hashes, and chunks are
//! private to their object (no cross-object deduplication).

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Suffix given to an object directory between catalog removal and disk removal.
pub const TOMBSTONE_SUFFIX: &str = ".deleted";

/// Storage addressed by (object, position).
#[async_trait]
pub trait SequencedChunkStore: Send + Sync {
    fn base_path(&self) -> &Path;

    /// Create the empty directory for a new object.
    async fn create_object(&self, object_id: &str) -> Result<()>;

    async fn write_chunk(&self, object_id: &str, index: usize, data: &[u8]) -> Result<()>;

    async fn read_chunk(&self, object_id: &str, index: usize) -> Result<Vec<u8>>;

    /// Remove a partially written object outright.
    async fn discard_object(&self, object_id: &str) -> Result<()>;

    /// First deletion phase: move the object directory aside under a tombstone
    /// name. After this returns, the object is no longer readable.
    async fn retire_object(&self, object_id: &str) -> Result<()>;

    /// Undo [`retire_object`](Self::retire_object): move the tombstone back
    /// under the object's own name.
    async fn restore_object(&self, object_id: &str) -> Result<()>;

    /// Second deletion phase: recursively remove the tombstone.
    async fn purge_retired(&self, object_id: &str) -> Result<()>;

    /// Remove every leftover tombstone. Returns how many were removed.
    async fn sweep_retired(&self) -> Result<usize>;
}

pub fn chunk_file_name(index: usize) -> String {
    format!("chunk_{}", index)
}

/// Directory-per-object chunk store.
pub struct DirChunkStore {
    base_path: PathBuf,
}

impl DirChunkStore {
    pub async fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn object_path(&self, object_id: &str) -> PathBuf {
        self.base_path.join(object_id)
    }

    fn tombstone_path(&self, object_id: &str) -> PathBuf {
        self.base_path
            .join(format!("{}{}", object_id, TOMBSTONE_SUFFIX))
    }
}

/// Object IDs become directory names, so they must be a single plain path segment.
fn validate_object_id(object_id: &str) -> Result<()> {
    let valid = !object_id.is_empty()
        && object_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        return Err(Error::Validation(format!("invalid object id: {:?}", object_id)));
    }
    Ok(())
}

#[async_trait]
impl SequencedChunkStore for DirChunkStore {
    fn base_path(&self) -> &Path {
        &self.base_path
    }

    async fn create_object(&self, object_id: &str) -> Result<()> {
        validate_object_id(object_id)?;
        tokio::fs::create_dir_all(self.object_path(object_id)).await?;
        Ok(())
    }

    async fn write_chunk(&self, object_id: &str, index: usize, data: &[u8]) -> Result<()> {
        validate_object_id(object_id)?;
        let path = self.object_path(object_id).join(chunk_file_name(index));
        tokio::fs::write(&path, data)
            .await
            .map_err(|source| Error::ChunkWrite { index, source })
    }

    async fn read_chunk(&self, object_id: &str, index: usize) -> Result<Vec<u8>> {
        validate_object_id(object_id)?;
        let path = self.object_path(object_id).join(chunk_file_name(index));
        tokio::fs::read(&path)
            .await
            .map_err(|source| Error::ChunkRead { index, source })
    }

    async fn discard_object(&self, object_id: &str) -> Result<()> {
        validate_object_id(object_id)?;
        match tokio::fs::remove_dir_all(self.object_path(object_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn retire_object(&self, object_id: &str) -> Result<()> {
        validate_object_id(object_id)?;
        match tokio::fs::rename(self.object_path(object_id), self.tombstone_path(object_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Object directory for {} already missing", object_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn restore_object(&self, object_id: &str) -> Result<()> {
        validate_object_id(object_id)?;
        match tokio::fs::rename(self.tombstone_path(object_id), self.object_path(object_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_retired(&self, object_id: &str) -> Result<()> {
        validate_object_id(object_id)?;
        match tokio::fs::remove_dir_all(self.tombstone_path(object_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep_retired(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_tombstone = name
                .to_str()
                .map(|n| n.ends_with(TOMBSTONE_SUFFIX))
                .unwrap_or(false);
            if !is_tombstone || !entry.file_type().await?.is_dir() {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to sweep {}: {}", entry.path().display(), e),
            }
        }

        Ok(removed)
    }
}
