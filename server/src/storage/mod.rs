//! Chunked model storage.
//!
//! Each model is split into fixed-size chunks stored under its own directory:
//! `{base_path}/{model_id}/chunk_{index}`. Metadata lives in a [`Catalog`].

pub mod catalog;
pub mod chunks;
pub mod engine;
pub mod model;
pub mod routes;

pub use catalog::{Catalog, FileCatalog, MemoryCatalog};
pub use chunks::{DirChunkStore, SequencedChunkStore};
pub use engine::{ModelStorage, MAX_CHUNK_SIZE};
pub use model::{ModelMetadata, ModelSummary, StorageStatus};
