use std::sync::Arc;

use crate::blocks::BlockStore;
use crate::node::Node;
use crate::p2p::Network;
use crate::storage::ModelStorage;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Chunked model storage
    pub storage: Arc<ModelStorage>,
    /// Content-addressed block store
    pub blocks: Arc<BlockStore>,
    /// Overlay network handle
    pub network: Arc<Network>,
    /// Upload limit for models and blocks, in megabytes
    pub max_upload_size_mb: u32,
}

impl AppState {
    pub fn from_node(node: &Node, max_upload_size_mb: u32) -> Self {
        Self {
            storage: node.storage(),
            blocks: node.blocks(),
            network: node.network(),
            max_upload_size_mb,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_size_mb as usize * 1024 * 1024
    }
}
