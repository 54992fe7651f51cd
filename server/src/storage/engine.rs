//! Chunked model storage.
//!
//! A model is read from a byte stream, cut into fixed-size chunks written in
//! order to its own directory, and recorded in the catalog once every chunk is
//! on disk. Writes to different models run concurrently; the catalog lock is
//! only taken for the final insert.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::catalog::{Catalog, FileCatalog, MemoryCatalog};
use super::chunks::{DirChunkStore, SequencedChunkStore};
use super::model::{ModelMetadata, StorageStatus};
use crate::cancel::{self, CancelSignal};
use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Upper bound on a single chunk: 5 MiB.
pub const MAX_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// File name of the durable catalog inside the storage directory.
pub const CATALOG_FILE: &str = "catalog.json";

pub struct ModelStorage {
    chunks: Arc<dyn SequencedChunkStore>,
    catalog: Arc<dyn Catalog>,
    chunk_size: usize,
}

impl ModelStorage {
    /// Open storage rooted at `base_path` with a directory chunk store and the
    /// catalog selected by `config.persist_catalog`.
    pub async fn open(base_path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let base_path = base_path.as_ref();
        let chunks = DirChunkStore::open(base_path).await?;

        let catalog: Arc<dyn Catalog> = if config.persist_catalog {
            Arc::new(FileCatalog::open(base_path.join(CATALOG_FILE)).await?)
        } else {
            Arc::new(MemoryCatalog::new())
        };

        tracing::info!(
            "Model storage opened at {} (chunk size {} bytes, persistent catalog: {})",
            base_path.display(),
            config.chunk_size,
            config.persist_catalog
        );

        Self::with_parts(Arc::new(chunks), catalog, config.chunk_size)
    }

    pub fn with_parts(
        chunks: Arc<dyn SequencedChunkStore>,
        catalog: Arc<dyn Catalog>,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Validation(format!(
                "chunk size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, chunk_size
            )));
        }
        Ok(Self {
            chunks,
            catalog,
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn base_path(&self) -> &Path {
        self.chunks.base_path()
    }

    /// Store a model read from `reader`.
    ///
    /// On any failure (read, write, cancellation) the object's directory is
    /// removed and nothing is added to the catalog.
    pub async fn store_model<R>(
        &self,
        name: &str,
        format: &str,
        reader: &mut R,
        cancel: &CancelSignal,
    ) -> Result<ModelMetadata>
    where
        R: AsyncRead + Unpin + Send,
    {
        cancel::check(cancel)?;

        let id = Uuid::new_v4().to_string();
        self.chunks.create_object(&id).await?;

        let (chunk_ids, size) = match self.write_chunks(&id, reader, cancel).await {
            Ok(written) => written,
            Err(e) => {
                self.discard(&id).await;
                return Err(e);
            }
        };

        let mut metadata = ModelMetadata {
            id: id.clone(),
            name: name.to_string(),
            format: format.to_string(),
            size,
            hash: String::new(),
            chunks: chunk_ids,
            created_at: Utc::now(),
            owner: String::new(),
            permissions: Vec::new(),
        };
        metadata.hash = metadata.calculate_hash();

        if let Err(e) = self.catalog.insert(metadata.clone()).await {
            self.discard(&id).await;
            return Err(e);
        }

        tracing::info!(
            "Stored model {} ({}, {} bytes in {} chunks)",
            id,
            name,
            size,
            metadata.chunks.len()
        );
        Ok(metadata)
    }

    async fn discard(&self, id: &str) {
        if let Err(e) = self.chunks.discard_object(id).await {
            tracing::warn!("Failed to clean up partial model {}: {}", id, e);
        }
    }

    /// Write `reader` as consecutive chunks. Returns (chunk ids, total bytes).
    async fn write_chunks<R>(
        &self,
        id: &str,
        reader: &mut R,
        cancel: &CancelSignal,
    ) -> Result<(Vec<String>, u64)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut chunk_ids = Vec::new();
        let mut total: u64 = 0;
        let mut index = 0;

        loop {
            let filled = read_full(reader, &mut buffer, cancel).await?;
            if filled == 0 {
                break;
            }

            cancel::check(cancel)?;
            self.chunks.write_chunk(id, index, &buffer[..filled]).await?;

            chunk_ids.push(Uuid::new_v4().to_string());
            total += filled as u64;
            index += 1;

            if filled < buffer.len() {
                break;
            }
        }

        Ok((chunk_ids, total))
    }

    /// Write a stored model to `writer`, chunk by chunk in index order.
    pub async fn stream_model<W>(&self, id: &str, writer: &mut W, cancel: &CancelSignal) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let metadata = self.get_model(id).await?;

        for index in 0..metadata.chunks.len() {
            cancel::check(cancel)?;
            let data = self.chunks.read_chunk(id, index).await?;
            writer
                .write_all(&data)
                .await
                .map_err(|source| Error::StreamWrite { index, source })?;
        }

        writer.flush().await?;
        Ok(())
    }

    pub async fn list_models(&self) -> Vec<ModelMetadata> {
        self.catalog.snapshot().await
    }

    pub async fn get_model(&self, id: &str) -> Result<ModelMetadata> {
        self.catalog
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("model {}", id)))
    }

    pub async fn get_model_metadata(&self, id: &str) -> Result<ModelMetadata> {
        self.get_model(id).await
    }

    /// Delete a model from disk and catalog.
    ///
    /// The directory is first moved to a tombstone; only if that succeeds is
    /// the catalog entry removed. If the catalog removal fails the tombstone
    /// is moved back. A failure removing the tombstone itself is logged and
    /// left for [`ModelStorage::sweep_tombstones`].
    ///
    /// Of concurrent deletes of one model, exactly one succeeds; the others
    /// return `NotFound`.
    pub async fn delete_model(&self, id: &str) -> Result<()> {
        let not_found = || Error::NotFound(format!("model {}", id));
        if self.catalog.get(id).await.is_none() {
            return Err(not_found());
        }

        self.chunks.retire_object(id).await?;
        match self.catalog.remove(id).await {
            Ok(Some(_)) => {}
            // Lost a race with another delete, which owns the tombstone.
            Ok(None) => return Err(not_found()),
            Err(e) => {
                if let Err(restore) = self.chunks.restore_object(id).await {
                    tracing::error!("Failed to restore model {} after catalog error: {}", id, restore);
                }
                return Err(e);
            }
        }

        if let Err(e) = self.chunks.purge_retired(id).await {
            tracing::warn!("Model {} removed from catalog but its files remain: {}", id, e);
        }

        tracing::info!("Deleted model {}", id);
        Ok(())
    }

    pub async fn get_status(&self) -> StorageStatus {
        let models = self.catalog.snapshot().await;
        StorageStatus {
            total_models: models.len(),
            total_size: models.iter().map(|m| m.size).sum(),
            base_path: self.base_path().display().to_string(),
            models: models.iter().map(ModelMetadata::summary).collect(),
        }
    }

    /// Remove directories left behind by deletes whose final removal failed.
    pub async fn sweep_tombstones(&self) -> Result<usize> {
        self.chunks.sweep_retired().await
    }
}

/// Fill `buf` from `reader` until it is full or the reader hits EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8], cancel: &CancelSignal) -> Result<usize>
where
    R: AsyncRead + Unpin + Send,
{
    let mut filled = 0;
    while filled < buf.len() {
        cancel::check(cancel)?;
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
