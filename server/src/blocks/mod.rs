//! Content-addressed block store.
//!
//! Blocks are immutable byte payloads named by their SHA-256 digest.
//! Storage layout: `{data_dir}/blocks/{hex_hash}`, one flat directory.
//! Storing identical content twice is a no-op; deletion is explicit and not
//! reference-counted.

pub mod routes;
pub mod service;
pub mod store;

pub use service::{BlockService, ModelDecoder};
pub use store::{compute_hash, validate_hash, Block, BlockStore, ContentAddressedStore};
