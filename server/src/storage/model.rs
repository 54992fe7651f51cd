use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Catalog entry for one stored model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: String,
    pub name: String,
    pub format: String,
    pub size: u64,
    /// Integrity hash over `id + name + format`. Not a content hash.
    pub hash: String,
    /// Chunk identifiers in write order. Position `i` lives in `chunk_<i>`.
    pub chunks: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl ModelMetadata {
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update(self.format.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Aggregate view of the storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatus {
    pub total_models: usize,
    pub total_size: u64,
    pub base_path: String,
    pub models: Vec<ModelSummary>,
}
