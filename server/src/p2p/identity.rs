use libp2p::identity;
use libp2p::PeerId;
use std::path::Path;

use crate::error::{Error, Result};

pub const IDENTITY_FILE: &str = "p2p_identity.key";

/// Load or generate the node's libp2p Ed25519 identity keypair.
///
/// The keypair is stored as a 32-byte Ed25519 seed at `{data_dir}/p2p_identity.key`.
/// On first run a new keypair is generated and its seed persisted; later runs
/// derive the same keypair, so the PeerId is stable across restarts.
pub async fn load_or_generate_keypair(data_dir: &Path) -> Result<identity::Keypair> {
    let key_path = data_dir.join(IDENTITY_FILE);

    match tokio::fs::read(&key_path).await {
        Ok(mut seed) => {
            if seed.len() != 32 {
                return Err(Error::ProtocolInit(format!(
                    "{} must be 32 bytes (Ed25519 seed), found {} bytes",
                    key_path.display(),
                    seed.len()
                )));
            }
            let keypair = identity::Keypair::ed25519_from_bytes(&mut seed).map_err(|e| {
                Error::ProtocolInit(format!("invalid Ed25519 seed in {}: {}", key_path.display(), e))
            })?;
            tracing::info!(
                "Node PeerId: {} (loaded from {})",
                PeerId::from(keypair.public()),
                key_path.display()
            );
            Ok(keypair)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = identity::Keypair::generate_ed25519();
            let ed25519 = keypair
                .clone()
                .try_into_ed25519()
                .map_err(|e| Error::ProtocolInit(e.to_string()))?;

            // to_bytes() is seed followed by public key; only the seed is stored.
            let full_bytes = ed25519.to_bytes();
            tokio::fs::create_dir_all(data_dir).await?;
            tokio::fs::write(&key_path, &full_bytes[..32]).await?;

            tracing::info!(
                "Node PeerId: {} (generated, saved to {})",
                PeerId::from(keypair.public()),
                key_path.display()
            );
            Ok(keypair)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate_keypair(dir.path()).await.unwrap();
        let second = load_or_generate_keypair(dir.path()).await.unwrap();
        assert_eq!(
            PeerId::from(first.public()),
            PeerId::from(second.public())
        );
        let seed = std::fs::read(dir.path().join(IDENTITY_FILE)).unwrap();
        assert_eq!(seed.len(), 32);
    }

    #[tokio::test]
    async fn test_malformed_key_file_is_init_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), b"short").unwrap();
        let err = load_or_generate_keypair(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolInit(_)));
    }
}
