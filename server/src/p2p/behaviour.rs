use libp2p::{
    autonat, dcutr, gossipsub, identify, identity, kad, mdns, ping, relay,
    request_response::{self, ProtocolSupport},
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    PeerId,
};
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::config::P2pConfig;
use super::protocol::{self, DirectCodec, DIRECT_PROTOCOL, KAD_PROTOCOL};

pub type BehaviourError = Box<dyn std::error::Error + Send + Sync>;

/// Composed NetworkBehaviour for a 3ds node.
/// Combines gossipsub (shared topic), Kademlia (peer discovery), mDNS (local
/// discovery), relay client and dcutr (NAT traversal), autonat (NAT detection),
/// identify, ping, and a one-shot request-response protocol for direct sends.
#[derive(NetworkBehaviour)]
pub struct ThreedsBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub relay_client: Toggle<relay::client::Behaviour>,
    pub autonat: autonat::Behaviour,
    pub identify: identify::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub ping: ping::Behaviour,
    pub direct: request_response::Behaviour<DirectCodec>,
}

/// Build the composed NetworkBehaviour.
///
/// mDNS is included only when `config.enable_mdns` is set, and the relay
/// client only when bootstrap peers are configured.
pub fn build_behaviour(
    keypair: &identity::Keypair,
    relay_client: relay::client::Behaviour,
    config: &P2pConfig,
) -> Result<ThreedsBehaviour, BehaviourError> {
    let peer_id = PeerId::from(keypair.public());

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(1))
        .max_transmit_size(config.gossipsub_max_transmit_size)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .message_id_fn(|msg| {
            // Dedup by SHA-256 of source + data
            let mut hasher = Sha256::new();
            if let Some(source) = &msg.source {
                hasher.update(source.to_bytes());
            }
            hasher.update(&msg.data);
            gossipsub::MessageId::from(hasher.finalize().to_vec())
        })
        .build()?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )?;

    let mut kad_config = kad::Config::new(KAD_PROTOCOL);
    kad_config.set_query_timeout(Duration::from_secs(60));
    let mut kademlia =
        kad::Behaviour::with_config(peer_id, kad::store::MemoryStore::new(peer_id), kad_config);
    kademlia.set_mode(Some(kad::Mode::Server));

    let mdns = if config.enable_mdns {
        Some(mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?)
    } else {
        None
    };

    let relay_client = if config.bootstrap_peers.is_empty() {
        None
    } else {
        Some(relay_client)
    };

    let direct = request_response::Behaviour::with_codec(
        DirectCodec::new(config.gossipsub_max_transmit_size),
        [(DIRECT_PROTOCOL, ProtocolSupport::Full)],
        request_response::Config::default().with_request_timeout(config.connection_timeout()),
    );

    Ok(ThreedsBehaviour {
        gossipsub,
        kademlia,
        mdns: Toggle::from(mdns),
        relay_client: Toggle::from(relay_client),
        autonat: autonat::Behaviour::new(peer_id, Default::default()),
        identify: identify::Behaviour::new(
            identify::Config::new(protocol::PROTOCOL_ID.to_string(), keypair.public())
                .with_agent_version(protocol::agent_version()),
        ),
        dcutr: dcutr::Behaviour::new(peer_id),
        ping: ping::Behaviour::default(),
        direct,
    })
}
