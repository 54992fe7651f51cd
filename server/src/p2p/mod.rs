pub mod backoff;
pub mod behaviour;
pub mod config;
pub mod directory;
pub mod identity;
pub mod messages;
pub mod network;
pub mod protocol;
pub mod routes;
pub mod swarm;

// Re-export key types for convenient access
pub use backoff::Backoff;
pub use config::P2pConfig;
pub use directory::{PeerDirectory, PeerRecord, PeerSource};
pub use messages::{InboundMessage, LoggingHandler, Message, MessageHandler, MessageType};
pub use network::{Network, NetworkState};
