//! Node coordinator: owns model storage, the block store and the overlay, and
//! runs the periodic discovery and maintenance tasks.
//!
//! Startup order is storage, then network, then background tasks. Shutdown
//! runs in reverse: tasks, then network. Storage needs no shutdown step.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::blocks::{BlockService, BlockStore, ModelDecoder};
use crate::cancel::{self, CancelSignal, Canceller};
use crate::config::{Config, StorageConfig};
use crate::error::{Error, Result};
use crate::p2p::{identity, LoggingHandler, MessageHandler, Network};
use crate::storage::ModelStorage;

pub const MODELS_DIR: &str = "models";
pub const BLOCKS_DIR: &str = "blocks";

pub struct Node {
    storage: Arc<ModelStorage>,
    blocks: Arc<BlockStore>,
    network: Arc<Network>,
    storage_config: StorageConfig,
    background: Mutex<Option<Background>>,
}

struct Background {
    canceller: Canceller,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open storage under `config.data_dir` and prepare (but do not start)
    /// the overlay, with the logging message handler installed.
    pub async fn new(config: &Config) -> Result<Self> {
        Self::with_handler(config, Arc::new(LoggingHandler)).await
    }

    pub async fn with_handler(config: &Config, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let data_dir = config.data_dir();
        let storage_config = config.storage_config();
        let p2p_config = config.p2p_config();
        if p2p_config.discovery_interval_secs == 0 {
            return Err(Error::Validation("discovery_interval_secs must be at least 1".to_string()));
        }
        if storage_config.maintenance_interval_secs == 0 {
            return Err(Error::Validation("maintenance_interval_secs must be at least 1".to_string()));
        }

        let storage = ModelStorage::open(data_dir.join(MODELS_DIR), &storage_config).await?;
        let blocks = BlockStore::open(data_dir.join(BLOCKS_DIR)).await?;

        let keypair = identity::load_or_generate_keypair(&data_dir).await?;
        let network = Network::new(keypair, p2p_config, handler);

        Ok(Self {
            storage: Arc::new(storage),
            blocks: Arc::new(blocks),
            network: Arc::new(network),
            storage_config,
            background: Mutex::new(None),
        })
    }

    pub fn storage(&self) -> Arc<ModelStorage> {
        self.storage.clone()
    }

    pub fn blocks(&self) -> Arc<BlockStore> {
        self.blocks.clone()
    }

    pub fn network(&self) -> Arc<Network> {
        self.network.clone()
    }

    /// A block service over this node's block store using `decoder` for imports.
    pub fn block_service(&self, decoder: Arc<dyn ModelDecoder>) -> BlockService {
        BlockService::new(self.blocks.clone(), decoder)
    }

    /// Start the overlay, then the discovery and maintenance tasks.
    /// If the overlay fails to start, no task is spawned.
    pub async fn start(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Ok(());
        }

        let (canceller, signal) = Canceller::new();
        self.network.start(signal.clone()).await?;

        let discovery = spawn_discovery(
            self.network.clone(),
            self.network.config().discovery_interval(),
            signal.clone(),
        );
        let maintenance = spawn_maintenance(
            self.storage.clone(),
            self.network.clone(),
            self.storage_config.maintenance_interval(),
            signal,
        );

        *background = Some(Background {
            canceller,
            tasks: vec![discovery, maintenance],
        });
        tracing::info!("Node started");
        Ok(())
    }

    /// Cancel background tasks and wait for them, then stop the overlay.
    pub async fn stop(&self) -> Result<()> {
        if let Some(background) = self.background.lock().await.take() {
            background.canceller.cancel();
            for task in background.tasks {
                if let Err(e) = task.await {
                    tracing::warn!("Background task ended abnormally: {}", e);
                }
            }
        }
        self.network.stop().await?;
        tracing::info!("Node stopped");
        Ok(())
    }
}

/// Periodically refresh the DHT until cancelled.
fn spawn_discovery(network: Arc<Network>, interval: Duration, mut cancel: CancelSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel::cancelled(&mut cancel) => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match network.refresh_dht().await {
                Ok(()) => tracing::debug!(
                    "Discovery: DHT refresh triggered ({} known peers)",
                    network.peer_count()
                ),
                Err(e) => tracing::error!("Discovery: DHT refresh failed: {}", e),
            }
        }
        tracing::debug!("Discovery task stopped");
    })
}

/// Periodically sweep deletion tombstones and log a status summary until cancelled.
fn spawn_maintenance(
    storage: Arc<ModelStorage>,
    network: Arc<Network>,
    interval: Duration,
    mut cancel: CancelSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel::cancelled(&mut cancel) => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match storage.sweep_tombstones().await {
                Ok(count) if count > 0 => {
                    tracing::info!("Maintenance: removed {} leftover deleted model directories", count)
                }
                Ok(_) => tracing::debug!("Maintenance: no leftover deleted model directories"),
                Err(e) => tracing::error!("Maintenance: tombstone sweep failed: {}", e),
            }

            let status = storage.get_status().await;
            tracing::info!(
                "Maintenance: {} models ({} bytes), {} peers, network {}",
                status.total_models,
                status.total_size,
                network.peer_count(),
                network.state()
            );
        }
        tracing::debug!("Maintenance task stopped");
    })
}
