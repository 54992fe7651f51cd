//! The overlay network: lifecycle, outbound primitives and the receive loop.
//!
//! A [`Network`] owns the node identity and, while running, a Swarm event loop
//! task plus a receive loop task. Everything else talks to the swarm through
//! [`SwarmCommand`]s.

use dashmap::DashSet;
use libp2p::{gossipsub, identity, multiaddr::Protocol, Multiaddr, PeerId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::backoff::{retry_with_backoff, Backoff};
use super::config::P2pConfig;
use super::directory::{PeerDirectory, PeerRecord, PeerSource};
use super::messages::{self, Delivery, InboundMessage, Message, MessageHandler, MessageType};
use super::protocol::{CONNECTION_TIMEOUT, PUBSUB_TOPIC};
use super::swarm::{build_swarm, wait_for_listen_addr, SwarmCommand, SwarmEvent, SwarmLoop};
use crate::cancel::{self, CancelSignal, Canceller};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Split a `/.../p2p/<peer id>` multiaddr into the peer ID and transport address.
pub fn parse_peer_addr(addr: &str) -> Result<(PeerId, Multiaddr)> {
    let mut multiaddr: Multiaddr = addr
        .parse()
        .map_err(|e| Error::Validation(format!("invalid multiaddr {:?}: {}", addr, e)))?;
    match multiaddr.pop() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, multiaddr)),
        _ => Err(Error::Validation(format!(
            "multiaddr {:?} does not end in /p2p/<peer id>",
            addr
        ))),
    }
}

/// Handle to the running swarm.
struct Running {
    cmd_tx: mpsc::UnboundedSender<SwarmCommand>,
    canceller: Canceller,
    swarm_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

/// Dials peers through the swarm loop and records successes in the directory.
#[derive(Clone)]
struct Dialer {
    cmd_tx: mpsc::UnboundedSender<SwarmCommand>,
    peers: Arc<PeerDirectory>,
    /// Peers with a background connect in flight.
    dialing: Arc<DashSet<PeerId>>,
    timeout: Duration,
    backoff: Backoff,
}

impl Dialer {
    /// One connection attempt, bounded by the connection timeout.
    async fn dial_once(&self, peer_id: PeerId, addrs: Vec<Multiaddr>, source: PeerSource) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Dial {
                peer_id,
                addrs: addrs.clone(),
                reply,
            })
            .map_err(|_| Error::NotRunning)?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                self.peers.record_connected(peer_id, addrs, source);
                tracing::info!("Connected to peer {}", peer_id);
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::NotRunning),
            Err(_) => Err(Error::Connect {
                peer: peer_id.to_string(),
                reason: format!("timed out after {:?}", self.timeout),
            }),
        }
    }

    async fn connect_with_backoff(
        &self,
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        source: PeerSource,
        cancel: &mut CancelSignal,
    ) -> Result<()> {
        let label = peer_id.to_string();
        let dialer = self.clone();
        retry_with_backoff(self.backoff, &label, cancel, move || {
            let dialer = dialer.clone();
            let addrs = addrs.clone();
            async move { dialer.dial_once(peer_id, addrs, source).await }
        })
        .await
    }

    /// Connect in the background, logging the outcome. Does nothing if a
    /// background connect to `peer_id` is already running.
    fn spawn_connect(&self, peer_id: PeerId, addrs: Vec<Multiaddr>, source: PeerSource, mut cancel: CancelSignal) {
        if !self.dialing.insert(peer_id) {
            tracing::debug!("Already connecting to {}", peer_id);
            return;
        }
        let dialer = self.clone();
        tokio::spawn(async move {
            let result = dialer.connect_with_backoff(peer_id, addrs, source, &mut cancel).await;
            dialer.dialing.remove(&peer_id);
            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => tracing::debug!("Connection to {} cancelled", peer_id),
                Err(e) => tracing::warn!("Failed to connect to {:?} peer {}: {}", source, peer_id, e),
            }
        });
    }
}

pub struct Network {
    keypair: identity::Keypair,
    local_peer_id: PeerId,
    config: P2pConfig,
    handler: Arc<dyn MessageHandler>,
    peers: Arc<PeerDirectory>,
    state: watch::Sender<NetworkState>,
    running: Mutex<Option<Running>>,
}

impl Network {
    pub fn new(keypair: identity::Keypair, config: P2pConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let local_peer_id = PeerId::from(keypair.public());
        let (state, _) = watch::channel(NetworkState::Created);
        Self {
            keypair,
            local_peer_id,
            config,
            handler,
            peers: Arc::new(PeerDirectory::new()),
            state,
            running: Mutex::new(None),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn state(&self) -> NetworkState {
        *self.state.borrow()
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    /// Bring the overlay up: transport and listener, DHT bootstrap, topic
    /// subscription, then the event and receive loops. Bootstrap peers are
    /// dialled in the background. Any failure leaves the network `Stopped`.
    pub async fn start(&self, cancel: CancelSignal) -> Result<()> {
        let mut running = self.running.lock().await;
        match self.state() {
            NetworkState::Created | NetworkState::Stopped => {}
            state => {
                return Err(Error::Validation(format!("cannot start network while {}", state)));
            }
        }
        self.state.send_replace(NetworkState::Starting);

        match self.bring_up(cancel).await {
            Ok(handle) => {
                *running = Some(handle);
                self.state.send_replace(NetworkState::Running);
                tracing::info!("Overlay network running as {}", self.local_peer_id);
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(NetworkState::Stopped);
                tracing::error!("Overlay network failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn bring_up(&self, cancel: CancelSignal) -> Result<Running> {
        cancel::check(&cancel)?;

        let mut swarm = build_swarm(self.keypair.clone(), &self.config)?;

        let listen_addr: Multiaddr = format!("/ip4/{}/tcp/{}", self.config.listen_address, self.config.port)
            .parse()
            .map_err(|e| Error::ProtocolInit(format!("invalid listen address: {}", e)))?;
        let listener = swarm
            .listen_on(listen_addr.clone())
            .map_err(|e| Error::ProtocolInit(format!("failed to listen on {}: {}", listen_addr, e)))?;

        tokio::time::timeout(CONNECTION_TIMEOUT, wait_for_listen_addr(&mut swarm))
            .await
            .map_err(|_| Error::ProtocolInit(format!("no listen address bound on {}", listen_addr)))??;

        let mut bootstrap = Vec::new();
        for addr in &self.config.bootstrap_peers {
            match parse_peer_addr(addr) {
                Ok((peer_id, multiaddr)) => {
                    swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, multiaddr.clone());
                    bootstrap.push((peer_id, multiaddr));
                }
                Err(e) => tracing::error!("Skipping bootstrap peer: {}", e),
            }
        }

        match swarm.behaviour_mut().kademlia.bootstrap() {
            Ok(_) => tracing::info!("DHT bootstrap started with {} peer(s)", bootstrap.len()),
            Err(_) => tracing::info!("DHT has no known peers yet; waiting for discovery"),
        }

        let topic = gossipsub::IdentTopic::new(PUBSUB_TOPIC);
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| Error::ProtocolInit(format!("failed to subscribe to {}: {:?}", PUBSUB_TOPIC, e)))?;
        tracing::info!("Subscribed to gossipsub topic: {}", PUBSUB_TOPIC);

        cancel::check(&cancel)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let (canceller, signal) = Canceller::linked(cancel);

        self.peers.clear();
        let swarm_loop = SwarmLoop::new(swarm, topic, listener, evt_tx, self.peers.clone());
        let swarm_task = tokio::spawn(swarm_loop.run(cmd_rx));

        let dialer = self.dialer(cmd_tx.clone());
        let recv_task = tokio::spawn(receive_loop(
            self.local_peer_id,
            evt_rx,
            self.handler.clone(),
            dialer.clone(),
            signal.clone(),
        ));

        for (peer_id, addr) in bootstrap {
            dialer.spawn_connect(peer_id, vec![addr], PeerSource::Bootstrap, signal.clone());
        }

        Ok(Running {
            cmd_tx,
            canceller,
            swarm_task,
            recv_task,
        })
    }

    fn dialer(&self, cmd_tx: mpsc::UnboundedSender<SwarmCommand>) -> Dialer {
        Dialer {
            cmd_tx,
            peers: self.peers.clone(),
            dialing: Arc::new(DashSet::new()),
            timeout: self.config.connection_timeout(),
            backoff: self.config.backoff(),
        }
    }

    /// Stop the receive loop, leave the topic, and close the host.
    /// Calling this on a network that is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(handle) = running.take() else {
            if self.state() == NetworkState::Created {
                self.state.send_replace(NetworkState::Stopped);
            }
            return Ok(());
        };
        self.state.send_replace(NetworkState::Stopping);

        handle.canceller.cancel();
        if let Err(e) = handle.recv_task.await {
            tracing::warn!("Receive loop ended abnormally: {}", e);
        }

        let (reply, done) = oneshot::channel();
        if handle.cmd_tx.send(SwarmCommand::Shutdown(reply)).is_ok() {
            let _ = done.await;
        }
        drop(handle.cmd_tx);
        if let Err(e) = handle.swarm_task.await {
            tracing::warn!("Swarm loop ended abnormally: {}", e);
        }

        self.peers.clear();
        self.state.send_replace(NetworkState::Stopped);
        tracing::info!("Overlay network stopped");
        Ok(())
    }

    async fn command_sender(&self) -> Result<mpsc::UnboundedSender<SwarmCommand>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.cmd_tx.clone())
            .ok_or(Error::NotRunning)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand) -> Result<T> {
        let cmd_tx = self.command_sender().await?;
        let (reply, rx) = oneshot::channel();
        cmd_tx.send(build(reply)).map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)
    }

    /// Publish a message to every peer subscribed to the shared topic.
    pub async fn broadcast(&self, message_type: MessageType, payload: Vec<u8>) -> Result<()> {
        let data = Message::new(message_type, payload, self.local_peer_id).encode()?;
        self.request(|reply| SwarmCommand::Publish { data, reply }).await?
    }

    /// Send a message to one peer over a one-shot `/3ds/1.0.0` stream.
    pub async fn send_to_peer(&self, peer_id: PeerId, message_type: MessageType, payload: Vec<u8>) -> Result<()> {
        let data = Message::new(message_type, payload, self.local_peer_id)
            .addressed_to(peer_id)
            .encode()?;
        self.request(|reply| SwarmCommand::SendDirect { peer_id, data, reply })
            .await?
    }

    /// Connect to a peer given as `/.../p2p/<peer id>`, retrying with backoff.
    pub async fn connect_peer(&self, addr: &str, cancel: &mut CancelSignal) -> Result<PeerId> {
        let (peer_id, multiaddr) = parse_peer_addr(addr)?;
        let dialer = self.dialer(self.command_sender().await?);
        dialer
            .connect_with_backoff(peer_id, vec![multiaddr], PeerSource::Manual, cancel)
            .await?;
        Ok(peer_id)
    }

    /// Peers this node has successfully connected to.
    pub fn get_peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Addresses the host is listening on. Empty unless running.
    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.request(SwarmCommand::ListenAddrs)
            .await
            .unwrap_or_default()
    }

    /// Listen addresses with `/p2p/<local peer id>` appended, ready to hand to
    /// another node as a bootstrap peer.
    pub async fn dialable_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs()
            .await
            .into_iter()
            .map(|a| a.with(Protocol::P2p(self.local_peer_id)))
            .collect()
    }

    /// Kick off a DHT bootstrap and a random closest-peers walk.
    pub async fn refresh_dht(&self) -> Result<()> {
        let cmd_tx = self.command_sender().await?;
        cmd_tx
            .send(SwarmCommand::RefreshDht)
            .map_err(|_| Error::NotRunning)
    }
}

/// Pull events from the swarm loop until cancelled.
///
/// Own messages are dropped; everything else is decoded and handed to the
/// handler on its own task. mDNS discoveries are dialled with backoff.
async fn receive_loop(
    local_peer_id: PeerId,
    mut evt_rx: mpsc::UnboundedReceiver<SwarmEvent>,
    handler: Arc<dyn MessageHandler>,
    dialer: Dialer,
    mut cancel: CancelSignal,
) {
    loop {
        let event = tokio::select! {
            _ = cancel::cancelled(&mut cancel) => break,
            event = evt_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            SwarmEvent::GossipMessage {
                source,
                author,
                data,
            } => {
                if messages::is_own_message(&local_peer_id, &source, author.as_ref()) {
                    tracing::debug!("Dropping own gossip message");
                    continue;
                }
                deliver(&local_peer_id, &handler, &data, Delivery::Gossip { source });
            }
            SwarmEvent::DirectMessage { source, data } => {
                deliver(&local_peer_id, &handler, &data, Delivery::Direct { source });
            }
            SwarmEvent::PeersDiscovered(found) => {
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in found {
                    if peer_id != local_peer_id && !dialer.peers.contains(&peer_id) {
                        by_peer.entry(peer_id).or_default().push(addr);
                    }
                }
                for (peer_id, addrs) in by_peer {
                    tracing::info!("Discovered local peer {}", peer_id);
                    dialer.spawn_connect(peer_id, addrs, PeerSource::Mdns, cancel.clone());
                }
            }
        }
    }
    tracing::debug!("Receive loop stopped");
}

fn deliver(local_peer_id: &PeerId, handler: &Arc<dyn MessageHandler>, data: &[u8], delivery: Delivery) {
    let message = match Message::decode(data) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Dropping undecodable message via {:?}: {}", delivery, e);
            return;
        }
    };
    if &message.from == local_peer_id {
        tracing::debug!("Dropping message claiming to be from this node");
        return;
    }
    tokio::spawn(messages::dispatch(
        handler.clone(),
        InboundMessage { message, delivery },
    ));
}
