//! Crate-wide error type.
//!
//! Every storage and overlay operation returns [`Result`]. The HTTP layer turns
//! these into tagged `{success: false, error}` responses (see `routes.rs`).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read chunk {index}: {source}")]
    ChunkRead {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write chunk {index}: {source}")]
    ChunkWrite {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stream chunk {index}: {source}")]
    StreamWrite {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to connect to {peer}: {reason}")]
    Connect { peer: String, reason: String },

    #[error("Max backoff reached for {peer}: {last_error}")]
    MaxBackoff { peer: String, last_error: String },

    #[error("Failed to publish: {0}")]
    Publish(String),

    #[error("Protocol init failed: {0}")]
    ProtocolInit(String),

    #[error("Network is not running")]
    NotRunning,

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for the connect-failure class (single attempt or exhausted backoff).
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Connect { .. } | Error::MaxBackoff { .. })
    }
}
