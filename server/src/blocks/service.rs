//! Turns decoded model records into content-addressed blocks.
//!
//! Format-specific parsing lives outside this crate behind [`ModelDecoder`];
//! the service only validates the format tag, hands the bytes over, and stores
//! whatever records come back.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::store::{Block, ContentAddressedStore};
use crate::cancel::{self, CancelSignal};
use crate::error::{Error, Result};

/// Importer collaborator: decodes a model file into an ordered list of
/// byte records (e.g. encoded vertices), each stored as one block.
pub trait ModelDecoder: Send + Sync {
    fn supports(&self, format: &str) -> bool;
    fn decode(&self, format: &str, data: &[u8]) -> Result<Vec<Vec<u8>>>;
}

pub struct BlockService {
    store: Arc<dyn ContentAddressedStore>,
    decoder: Arc<dyn ModelDecoder>,
}

impl BlockService {
    pub fn new(store: Arc<dyn ContentAddressedStore>, decoder: Arc<dyn ModelDecoder>) -> Self {
        Self { store, decoder }
    }

    /// Decode `reader` as `format` and store each record as a block.
    ///
    /// Returns the block hashes in record order. If any store fails, blocks
    /// first written by this call are removed before the error is returned.
    pub async fn process_model_data<R>(
        &self,
        format: &str,
        reader: &mut R,
        cancel: &CancelSignal,
    ) -> Result<Vec<String>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let format = format.to_ascii_lowercase();
        if !self.decoder.supports(&format) {
            return Err(Error::Validation(format!("unsupported format: {}", format)));
        }

        cancel::check(cancel)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let records = self.decoder.decode(&format, &data)?;
        let mut hashes = Vec::with_capacity(records.len());
        let mut created: HashSet<String> = HashSet::new();

        for record in &records {
            let result = match cancel::check(cancel) {
                Ok(()) => self.store_new(record, &mut created).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(hash) => hashes.push(hash),
                Err(e) => {
                    self.rollback(&created).await;
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            "Stored {} records as {} new blocks ({})",
            hashes.len(),
            created.len(),
            format
        );
        Ok(hashes)
    }

    async fn store_new(&self, record: &[u8], created: &mut HashSet<String>) -> Result<String> {
        let hash = super::store::compute_hash(record);
        let existed = self.store.has_block(&hash).await?;
        let stored = self.store.store_block(record).await?;
        if !existed {
            created.insert(stored.clone());
        }
        Ok(stored)
    }

    async fn rollback(&self, created: &HashSet<String>) {
        for hash in created {
            if let Err(e) = self.store.delete_block(hash).await {
                tracing::warn!("Failed to roll back block {}: {}", hash, e);
            }
        }
    }

    /// Fetch blocks in the given order, failing on the first missing one.
    pub async fn get_model_blocks(&self, hashes: &[String]) -> Result<Vec<Block>> {
        let mut blocks = Vec::with_capacity(hashes.len());
        for hash in hashes {
            blocks.push(self.store.get_block(hash).await?);
        }
        Ok(blocks)
    }

    pub async fn delete_block(&self, hash: &str) -> Result<()> {
        self.store.delete_block(hash).await
    }
}
