//! Content-addressed block persistence.
//!
//! Blocks are addressed by the SHA-256 of their content. Storage layout is a
//! flat directory with one file per block: `{base_path}/{hex_hash}`.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// An immutable payload and its content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: String,
    pub size: u64,
    pub data: Vec<u8>,
}

/// Storage addressed purely by content digest.
///
/// Storing the same bytes twice resolves to the same hash and keeps one copy.
/// Deletion is not reference-counted: callers must know nothing still points
/// at a block before removing it.
#[async_trait]
pub trait ContentAddressedStore: Send + Sync {
    async fn store_block(&self, data: &[u8]) -> Result<String>;
    async fn get_block(&self, hash: &str) -> Result<Block>;
    async fn has_block(&self, hash: &str) -> Result<bool>;
    async fn delete_block(&self, hash: &str) -> Result<()>;
}

/// Compute the hex SHA-256 digest used as a block identifier.
pub fn compute_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Reject anything that is not a 64-character hex digest. Keeps hashes from
/// escaping the block directory.
pub fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Validation(format!(
            "block hash must be a 64-character hex string (SHA-256), got {:?}",
            hash
        )));
    }
    Ok(())
}

/// Flat-directory block store.
pub struct BlockStore {
    base_path: PathBuf,
    lock: RwLock<()>,
}

impl BlockStore {
    /// Open (or create) the block directory.
    pub async fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path).await?;
        tracing::info!("Block store opened at {}", base_path.display());
        Ok(Self {
            base_path,
            lock: RwLock::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn block_path(&self, hash: &str) -> PathBuf {
        self.base_path.join(hash.to_ascii_lowercase())
    }
}

#[async_trait]
impl ContentAddressedStore for BlockStore {
    async fn store_block(&self, data: &[u8]) -> Result<String> {
        let hash = compute_hash(data);
        let path = self.block_path(&hash);

        let _guard = self.lock.write().await;

        if tokio::fs::try_exists(&path).await? {
            tracing::debug!("Block {} already exists, skipping", hash);
            return Ok(hash);
        }

        // Temp file + rename so a crash never leaves a truncated block under its final name.
        let temp_path = self
            .base_path
            .join(format!(".{}.{}.tmp", hash, uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&temp_path, data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!("Stored block {} ({} bytes)", hash, data.len());
        Ok(hash)
    }

    async fn get_block(&self, hash: &str) -> Result<Block> {
        validate_hash(hash)?;
        let path = self.block_path(hash);

        let _guard = self.lock.read().await;

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Block {
                hash: hash.to_ascii_lowercase(),
                size: data.len() as u64,
                data,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("block {}", hash)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_block(&self, hash: &str) -> Result<bool> {
        validate_hash(hash)?;
        let _guard = self.lock.read().await;
        Ok(tokio::fs::try_exists(self.block_path(hash)).await?)
    }

    async fn delete_block(&self, hash: &str) -> Result<()> {
        validate_hash(hash)?;
        let path = self.block_path(hash);

        let _guard = self.lock.write().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted block {}", hash);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("block {}", hash)))
            }
            Err(e) => Err(e.into()),
        }
    }
}
