//! 3ds storage node library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod blocks;
pub mod cancel;
pub mod config;
pub mod error;
pub mod node;
pub mod p2p;
pub mod routes;
pub mod state;
pub mod storage;

pub use error::{Error, Result};
