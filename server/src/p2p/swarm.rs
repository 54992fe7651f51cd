use futures_util::StreamExt;
use libp2p::{
    autonat,
    core::transport::ListenerId,
    gossipsub, identify, identity, kad, mdns, noise, request_response,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        DialError,
    },
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::behaviour::{build_behaviour, ThreedsBehaviour, ThreedsBehaviourEvent};
use super::config::P2pConfig;
use super::directory::PeerDirectory;
use crate::error::{Error, Result};

/// Commands sent from [`super::network::Network`] to the Swarm event loop.
pub enum SwarmCommand {
    /// Dial a peer. Replies once a connection is established or the dial fails.
    Dial {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Publish data to the shared gossipsub topic.
    Publish {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Send data to one peer over a direct stream. Replies when acknowledged.
    SendDirect {
        peer_id: PeerId,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Re-run Kademlia bootstrap and a random closest-peers walk.
    RefreshDht,
    /// Current listen addresses.
    ListenAddrs(oneshot::Sender<Vec<Multiaddr>>),
    /// Leave the topic, drop every connection and listener, then exit the loop.
    Shutdown(oneshot::Sender<()>),
}

/// Events emitted from the Swarm event loop to the receive loop.
#[derive(Debug)]
pub enum SwarmEvent {
    /// Received a gossipsub message on the shared topic.
    GossipMessage {
        source: PeerId,
        author: Option<PeerId>,
        data: Vec<u8>,
    },
    /// Received a direct payload.
    DirectMessage { source: PeerId, data: Vec<u8> },
    /// mDNS found peers on the local network.
    PeersDiscovered(Vec<(PeerId, Multiaddr)>),
}

/// Build the libp2p Swarm: TCP + noise + yamux, with the relay client transport
/// layered in so relayed connections work when bootstrap peers provide them.
pub fn build_swarm(keypair: identity::Keypair, config: &P2pConfig) -> Result<Swarm<ThreedsBehaviour>> {
    let config = config.clone();

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| Error::ProtocolInit(format!("TCP transport: {}", e)))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| Error::ProtocolInit(format!("relay transport: {}", e)))?
        .with_behaviour(|key, relay_client| build_behaviour(key, relay_client, &config))
        .map_err(|e| Error::ProtocolInit(format!("behaviour: {}", e)))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

/// Drive the swarm until the first listen address is bound.
pub async fn wait_for_listen_addr(swarm: &mut Swarm<ThreedsBehaviour>) -> Result<Multiaddr> {
    use libp2p::swarm::SwarmEvent as LibSwarmEvent;

    loop {
        match swarm.select_next_some().await {
            LibSwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("libp2p listening on: {}", address);
                return Ok(address);
            }
            LibSwarmEvent::ListenerError { error, .. } => {
                return Err(Error::ProtocolInit(format!("listener error: {}", error)));
            }
            LibSwarmEvent::ListenerClosed { reason, .. } => {
                return Err(Error::ProtocolInit(format!("listener closed: {:?}", reason)));
            }
            _ => {}
        }
    }
}

/// State owned by the running Swarm event loop.
pub struct SwarmLoop {
    swarm: Swarm<ThreedsBehaviour>,
    topic: gossipsub::IdentTopic,
    listener: ListenerId,
    evt_tx: mpsc::UnboundedSender<SwarmEvent>,
    peer_directory: Arc<PeerDirectory>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
    pending_sends: HashMap<request_response::OutboundRequestId, oneshot::Sender<Result<()>>>,
}

impl SwarmLoop {
    pub fn new(
        swarm: Swarm<ThreedsBehaviour>,
        topic: gossipsub::IdentTopic,
        listener: ListenerId,
        evt_tx: mpsc::UnboundedSender<SwarmEvent>,
        peer_directory: Arc<PeerDirectory>,
    ) -> Self {
        Self {
            swarm,
            topic,
            listener,
            evt_tx,
            peer_directory,
            pending_dials: HashMap::new(),
            pending_sends: HashMap::new(),
        }
    }

    /// Run the Swarm event loop.
    ///
    /// Processes swarm events and commands until a `Shutdown` command arrives
    /// or every command sender is dropped. The swarm is dropped on exit, which
    /// closes the host.
    pub async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<SwarmCommand>) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Shutdown(reply)) => {
                            self.shutdown();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            tracing::info!("Swarm command channel closed, shutting down");
                            self.shutdown();
                            break;
                        }
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        if self.swarm.behaviour_mut().gossipsub.unsubscribe(&self.topic) {
            tracing::info!("Unsubscribed from gossipsub topic: {}", self.topic);
        }

        let connected: Vec<PeerId> = self.swarm.connected_peers().copied().collect();
        for peer_id in connected {
            let _ = self.swarm.disconnect_peer_id(peer_id);
        }
        self.swarm.remove_listener(self.listener);

        for (_, replies) in self.pending_dials.drain() {
            for reply in replies {
                let _ = reply.send(Err(Error::Cancelled));
            }
        }
        for (_, reply) in self.pending_sends.drain() {
            let _ = reply.send(Err(Error::Cancelled));
        }
    }

    fn handle_command(&mut self, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::Dial {
                peer_id,
                addrs,
                reply,
            } => self.dial(peer_id, addrs, reply),
            SwarmCommand::Publish { data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.topic.clone(), data)
                    .map(|msg_id| {
                        tracing::debug!("Published to {}, message_id: {}", self.topic, msg_id);
                    })
                    .map_err(|e| Error::Publish(e.to_string()));
                let _ = reply.send(result);
            }
            SwarmCommand::SendDirect {
                peer_id,
                data,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .direct
                    .send_request(&peer_id, data);
                self.pending_sends.insert(request_id, reply);
            }
            SwarmCommand::RefreshDht => {
                let kademlia = &mut self.swarm.behaviour_mut().kademlia;
                match kademlia.bootstrap() {
                    Ok(query_id) => tracing::debug!("DHT bootstrap started: {:?}", query_id),
                    Err(kad::NoKnownPeers()) => tracing::debug!("DHT refresh skipped: no known peers"),
                }
                kademlia.get_closest_peers(PeerId::random());
            }
            SwarmCommand::ListenAddrs(reply) => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            SwarmCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn dial(&mut self, peer_id: PeerId, addrs: Vec<Multiaddr>, reply: oneshot::Sender<Result<()>>) {
        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }

        for addr in &addrs {
            self.swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr.clone());
        }

        let opts = DialOpts::peer_id(peer_id)
            .addresses(addrs)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();

        match self.swarm.dial(opts) {
            // Already dialing: wait on the dial in flight.
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer_id).or_default().push(reply);
            }
            Err(e) => {
                let _ = reply.send(Err(Error::Connect {
                    peer: peer_id.to_string(),
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn resolve_dials(&mut self, peer_id: &PeerId, result: impl Fn() -> Result<()>) {
        if let Some(replies) = self.pending_dials.remove(peer_id) {
            for reply in replies {
                let _ = reply.send(result());
            }
        }
    }

    /// Handle a SwarmEvent from the libp2p Swarm.
    fn handle_swarm_event(&mut self, event: libp2p::swarm::SwarmEvent<ThreedsBehaviourEvent>) {
        use libp2p::swarm::SwarmEvent as LibSwarmEvent;

        match event {
            LibSwarmEvent::Behaviour(behaviour_event) => {
                self.handle_behaviour_event(behaviour_event);
            }
            LibSwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                tracing::debug!("Connection established: {} via {:?}", peer_id, endpoint);
                self.resolve_dials(&peer_id, || Ok(()));
            }
            LibSwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                tracing::debug!("Outgoing connection to {} failed: {}", peer_id, error);
                let reason = error.to_string();
                self.resolve_dials(&peer_id, || {
                    Err(Error::Connect {
                        peer: peer_id.to_string(),
                        reason: reason.clone(),
                    })
                });
            }
            LibSwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                tracing::debug!("Connection closed: {} ({:?})", peer_id, cause);
            }
            LibSwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("libp2p listening on: {}", address);
            }
            _ => {}
        }
    }

    /// Handle a behaviour-level event.
    fn handle_behaviour_event(&mut self, event: ThreedsBehaviourEvent) {
        match event {
            ThreedsBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                tracing::debug!(
                    "Gossipsub message from {} on topic {}",
                    propagation_source,
                    message.topic
                );
                let _ = self.evt_tx.send(SwarmEvent::GossipMessage {
                    source: propagation_source,
                    author: message.source,
                    data: message.data,
                });
            }
            ThreedsBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
                tracing::debug!("Peer {} subscribed to {}", peer_id, topic);
            }
            ThreedsBehaviourEvent::Direct(request_response::Event::Message { peer, message, .. }) => {
                match message {
                    request_response::Message::Request {
                        request, channel, ..
                    } => {
                        tracing::debug!("Direct message from {} ({} bytes)", peer, request.len());
                        if self
                            .swarm
                            .behaviour_mut()
                            .direct
                            .send_response(channel, ())
                            .is_err()
                        {
                            tracing::debug!("Direct ack to {} dropped", peer);
                        }
                        let _ = self.evt_tx.send(SwarmEvent::DirectMessage {
                            source: peer,
                            data: request,
                        });
                    }
                    request_response::Message::Response { request_id, .. } => {
                        if let Some(reply) = self.pending_sends.remove(&request_id) {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
            }
            ThreedsBehaviourEvent::Direct(request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            }) => {
                tracing::debug!("Direct send to {} failed: {}", peer, error);
                if let Some(reply) = self.pending_sends.remove(&request_id) {
                    let _ = reply.send(Err(Error::Connect {
                        peer: peer.to_string(),
                        reason: error.to_string(),
                    }));
                }
            }
            ThreedsBehaviourEvent::Direct(request_response::Event::InboundFailure {
                peer, error, ..
            }) => {
                tracing::debug!("Inbound direct stream from {} failed: {}", peer, error);
            }
            ThreedsBehaviourEvent::Mdns(mdns::Event::Discovered(list)) => {
                tracing::debug!("mDNS discovered {} address(es)", list.len());
                let _ = self.evt_tx.send(SwarmEvent::PeersDiscovered(list));
            }
            ThreedsBehaviourEvent::Mdns(mdns::Event::Expired(list)) => {
                for (peer_id, addr) in list {
                    tracing::debug!("mDNS record expired: {} at {}", peer_id, addr);
                }
            }
            ThreedsBehaviourEvent::Kademlia(kad::Event::RoutingUpdated { peer, .. }) => {
                tracing::debug!("DHT routing table updated with {}", peer);
            }
            ThreedsBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                result, ..
            }) => match result {
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    tracing::debug!("DHT bootstrap progress: {} remaining", ok.num_remaining);
                }
                kad::QueryResult::Bootstrap(Err(e)) => {
                    tracing::warn!("DHT bootstrap query failed: {:?}", e);
                }
                kad::QueryResult::GetClosestPeers(Ok(ok)) => {
                    tracing::debug!("DHT walk found {} peer(s)", ok.peers.len());
                }
                _ => {}
            },
            ThreedsBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!(
                    "Identify: {} ({}) has {} listen addrs",
                    peer_id,
                    info.agent_version,
                    info.listen_addrs.len()
                );
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                self.peer_directory.update_addrs(&peer_id, info.listen_addrs);
            }
            ThreedsBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                tracing::info!("AutoNAT status changed: {:?} -> {:?}", old, new);
            }
            ThreedsBehaviourEvent::RelayClient(event) => {
                tracing::debug!("Relay client event: {:?}", event);
            }
            ThreedsBehaviourEvent::Dcutr(event) => {
                tracing::debug!("DCUtR event: {:?}", event);
            }
            _ => {}
        }
    }
}
