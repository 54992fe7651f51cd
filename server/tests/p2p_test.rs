//! Integration tests for the overlay network:
//! backoff schedule and cancellation, lifecycle, peer connections,
//! direct sends and gossip broadcast between two local nodes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{identity::Keypair, PeerId};
use tokio::sync::mpsc;
use tokio::time::Instant;

use threeds_server::cancel::{self, Canceller};
use threeds_server::p2p::backoff::retry_with_backoff;
use threeds_server::p2p::messages::Delivery;
use threeds_server::p2p::{
    Backoff, InboundMessage, LoggingHandler, MessageHandler, MessageType, Network, NetworkState,
    P2pConfig,
};
use threeds_server::Error;

fn unreachable() -> Error {
    Error::Connect {
        peer: "test".to_string(),
        reason: "connection refused".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_then_gives_up() {
    let mut times = Vec::new();
    let start = Instant::now();

    let result: threeds_server::Result<()> =
        retry_with_backoff(Backoff::default(), "unreachable-peer", &mut cancel::never(), || {
            times.push(Instant::now());
            async { Err(unreachable()) }
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_connect_failure());
    match err {
        Error::MaxBackoff { peer, last_error } => {
            assert_eq!(peer, "unreachable-peer");
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("expected MaxBackoff, got {:?}", other),
    }

    assert_eq!(times.len(), 7);
    assert_eq!(times[0], start);
    let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
    assert_eq!(gaps, vec![1, 2, 4, 8, 16, 32]);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_returns_first_success() {
    let attempts = AtomicUsize::new(0);
    let result = retry_with_backoff(Backoff::default(), "flaky-peer", &mut cancel::never(), || {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(unreachable())
            } else {
                Ok(n)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_cancellable_between_attempts() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let (canceller, mut signal) = Canceller::new();

    let counter = attempts.clone();
    let handle = tokio::spawn(async move {
        retry_with_backoff(Backoff::default(), "peer", &mut signal, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(unreachable()) }
        })
        .await
    });

    // Attempts at t=0 and t=1s; the loop is then sleeping until t=3s.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    canceller.cancel();

    assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

fn local_config() -> P2pConfig {
    P2pConfig {
        listen_address: "127.0.0.1".to_string(),
        port: 0,
        enable_mdns: false,
        ..Default::default()
    }
}

/// Forwards every inbound message to a channel.
struct Recorder(mpsc::UnboundedSender<InboundMessage>);

#[async_trait]
impl MessageHandler for Recorder {
    async fn on_model_announcement(&self, msg: InboundMessage) {
        let _ = self.0.send(msg);
    }
    async fn on_chunk_request(&self, msg: InboundMessage) {
        let _ = self.0.send(msg);
    }
    async fn on_chunk_response(&self, msg: InboundMessage) {
        let _ = self.0.send(msg);
    }
    async fn on_storage_proof(&self, msg: InboundMessage) {
        let _ = self.0.send(msg);
    }
    async fn on_node_status(&self, msg: InboundMessage) {
        let _ = self.0.send(msg);
    }
}

fn recording_network(config: P2pConfig) -> (Network, mpsc::UnboundedReceiver<InboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let network = Network::new(Keypair::generate_ed25519(), config, Arc::new(Recorder(tx)));
    (network, rx)
}

async fn wait_for_peer(network: &Network, peer_id: PeerId) {
    tokio::time::timeout(Duration::from_secs(15), async {
        while !network.get_peers().iter().any(|p| p.peer_id == peer_id) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("peer should connect");
}

#[tokio::test]
async fn test_start_and_stop_lifecycle() {
    let network = Network::new(Keypair::generate_ed25519(), local_config(), Arc::new(LoggingHandler));
    assert_eq!(network.state(), NetworkState::Created);
    assert!(network.listen_addrs().await.is_empty());

    network.start(cancel::never()).await.unwrap();
    assert_eq!(network.state(), NetworkState::Running);

    let addrs = network.dialable_addrs().await;
    assert!(!addrs.is_empty());
    assert!(addrs[0].to_string().starts_with("/ip4/127.0.0.1/tcp/"));
    assert!(addrs[0].to_string().ends_with(&network.local_peer_id().to_string()));

    assert!(matches!(
        network.start(cancel::never()).await,
        Err(Error::Validation(_))
    ));

    network.stop().await.unwrap();
    assert_eq!(network.state(), NetworkState::Stopped);
    assert!(network.get_peers().is_empty());

    // Idempotent stop; outbound calls fail cleanly once stopped.
    network.stop().await.unwrap();
    assert!(matches!(
        network.broadcast(MessageType::NodeStatus, b"up".to_vec()).await,
        Err(Error::NotRunning)
    ));
}

#[tokio::test]
async fn test_stop_before_start_is_noop() {
    let network = Network::new(Keypair::generate_ed25519(), local_config(), Arc::new(LoggingHandler));
    network.stop().await.unwrap();
    assert_eq!(network.state(), NetworkState::Stopped);
}

#[tokio::test]
async fn test_invalid_listen_address_fails_start() {
    let config = P2pConfig {
        listen_address: "not-an-ip".to_string(),
        ..local_config()
    };
    let network = Network::new(Keypair::generate_ed25519(), config, Arc::new(LoggingHandler));

    assert!(matches!(
        network.start(cancel::never()).await,
        Err(Error::ProtocolInit(_))
    ));
    assert_eq!(network.state(), NetworkState::Stopped);
}

#[tokio::test]
async fn test_start_with_cancelled_signal() {
    let network = Network::new(Keypair::generate_ed25519(), local_config(), Arc::new(LoggingHandler));
    let (canceller, signal) = Canceller::new();
    canceller.cancel();

    assert!(matches!(network.start(signal).await, Err(Error::Cancelled)));
    assert_eq!(network.state(), NetworkState::Stopped);
}

#[tokio::test]
async fn test_bad_bootstrap_entry_does_not_block_others() {
    let (a, _rx_a) = recording_network(local_config());
    a.start(cancel::never()).await.unwrap();
    let a_addr = a.dialable_addrs().await[0].to_string();

    let config = P2pConfig {
        bootstrap_peers: vec!["/ip4/127.0.0.1/tcp/1".to_string(), a_addr],
        ..local_config()
    };
    let (b, _rx_b) = recording_network(config);
    b.start(cancel::never()).await.unwrap();

    wait_for_peer(&b, a.local_peer_id()).await;
    let record = b
        .get_peers()
        .into_iter()
        .find(|p| p.peer_id == a.local_peer_id())
        .unwrap();
    assert_eq!(record.source, threeds_server::p2p::PeerSource::Bootstrap);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_peer_and_send_direct() {
    let (a, mut rx_a) = recording_network(local_config());
    let (b, _rx_b) = recording_network(local_config());
    a.start(cancel::never()).await.unwrap();
    b.start(cancel::never()).await.unwrap();

    let a_addr = a.dialable_addrs().await[0].to_string();
    let connected = b.connect_peer(&a_addr, &mut cancel::never()).await.unwrap();
    assert_eq!(connected, a.local_peer_id());
    assert_eq!(b.peer_count(), 1);

    b.send_to_peer(a.local_peer_id(), MessageType::ChunkRequest, b"chunk 7".to_vec())
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(10), rx_a.recv())
        .await
        .expect("direct message should arrive")
        .unwrap();
    assert_eq!(msg.message.message_type, MessageType::ChunkRequest);
    assert_eq!(msg.message.payload, b"chunk 7");
    assert_eq!(msg.message.from, b.local_peer_id());
    assert_eq!(msg.message.to, Some(a.local_peer_id()));
    assert_eq!(msg.delivery, Delivery::Direct { source: b.local_peer_id() });

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_peer_rejects_address_without_peer_id() {
    let network = Network::new(Keypair::generate_ed25519(), local_config(), Arc::new(LoggingHandler));
    network.start(cancel::never()).await.unwrap();

    assert!(matches!(
        network.connect_peer("/ip4/127.0.0.1/tcp/4001", &mut cancel::never()).await,
        Err(Error::Validation(_))
    ));

    network.stop().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_subscribed_peer() {
    let (a, mut rx_a) = recording_network(local_config());
    a.start(cancel::never()).await.unwrap();
    let config = P2pConfig {
        bootstrap_peers: vec![a.dialable_addrs().await[0].to_string()],
        ..local_config()
    };
    let (b, mut rx_b) = recording_network(config);
    b.start(cancel::never()).await.unwrap();
    wait_for_peer(&b, a.local_peer_id()).await;

    // Publishing fails until the subscription has propagated.
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let payload = format!("announce {}", attempt).into_bytes();
        match b.broadcast(MessageType::ModelAnnouncement, payload).await {
            Ok(()) => break,
            Err(Error::Publish(_)) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => panic!("broadcast failed: {}", e),
        }
    }

    let msg = tokio::time::timeout(Duration::from_secs(10), rx_a.recv())
        .await
        .expect("gossip message should arrive")
        .unwrap();
    assert_eq!(msg.message.message_type, MessageType::ModelAnnouncement);
    assert_eq!(msg.message.from, b.local_peer_id());
    assert_eq!(msg.message.to, None);
    assert_eq!(msg.delivery, Delivery::Gossip { source: b.local_peer_id() });

    // The sender never dispatches its own broadcast.
    assert!(tokio::time::timeout(Duration::from_millis(500), rx_b.recv())
        .await
        .is_err());

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}
