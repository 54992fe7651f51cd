//! Overlay message envelope and dispatch.
//!
//! Wire format is JSON: `{"type": "...", "payload": "<base64>", "from": "<peer id>", "to": "<peer id>"?}`.
//! Inbound messages are routed by type to a [`MessageHandler`]. The handler
//! methods are extension points; the default implementations only log.

use async_trait::async_trait;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ModelAnnouncement,
    ChunkRequest,
    ChunkResponse,
    StorageProof,
    NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
}

impl Message {
    pub fn new(message_type: MessageType, payload: Vec<u8>, from: PeerId) -> Self {
        Self {
            message_type,
            payload,
            from,
            to: None,
        }
    }

    pub fn addressed_to(mut self, to: PeerId) -> Self {
        self.to = Some(to);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// How an inbound message reached this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Via the shared gossipsub topic; `source` is the peer that forwarded it.
    Gossip { source: PeerId },
    /// Via a `/3ds/1.0.0` direct stream from `source`.
    Direct { source: PeerId },
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: Message,
    pub delivery: Delivery,
}

/// True if a gossip message originated from this node: either the forwarding
/// peer or the signed author is the local peer.
pub fn is_own_message(local: &PeerId, source: &PeerId, author: Option<&PeerId>) -> bool {
    source == local || author == Some(local)
}

/// Receives inbound overlay messages, one method per message type.
///
/// Each call runs on its own task, so a slow implementation never holds up
/// the receive loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_model_announcement(&self, msg: InboundMessage) {
        log_unhandled(&msg);
    }

    async fn on_chunk_request(&self, msg: InboundMessage) {
        log_unhandled(&msg);
    }

    async fn on_chunk_response(&self, msg: InboundMessage) {
        log_unhandled(&msg);
    }

    async fn on_storage_proof(&self, msg: InboundMessage) {
        log_unhandled(&msg);
    }

    async fn on_node_status(&self, msg: InboundMessage) {
        log_unhandled(&msg);
    }
}

fn log_unhandled(msg: &InboundMessage) {
    tracing::debug!(
        "Received {:?} from {} ({} bytes payload)",
        msg.message.message_type,
        msg.message.from,
        msg.message.payload.len()
    );
}

/// Handler installed by the node: logs every message and does nothing else.
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn on_node_status(&self, msg: InboundMessage) {
        tracing::info!(
            "Node status from {}: {}",
            msg.message.from,
            String::from_utf8_lossy(&msg.message.payload)
        );
    }
}

/// Route a message to the handler method for its type.
pub async fn dispatch(handler: Arc<dyn MessageHandler>, msg: InboundMessage) {
    match msg.message.message_type {
        MessageType::ModelAnnouncement => handler.on_model_announcement(msg).await,
        MessageType::ChunkRequest => handler.on_chunk_request(msg).await,
        MessageType::ChunkResponse => handler.on_chunk_response(msg).await,
        MessageType::StorageProof => handler.on_storage_proof(msg).await,
        MessageType::NodeStatus => handler.on_node_status(msg).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_envelope_json_shape() {
        let from = PeerId::random();
        let msg = Message::new(MessageType::ChunkRequest, b"abc".to_vec(), from);
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "chunk_request");
        assert_eq!(value["payload"], "YWJj");
        assert_eq!(value["from"], from.to_string());
        assert!(value.get("to").is_none());
    }

    #[test]
    fn test_decode_with_recipient() {
        let from = PeerId::random();
        let to = PeerId::random();
        let raw = format!(
            r#"{{"type":"node_status","payload":"","from":"{}","to":"{}"}}"#,
            from, to
        );
        let msg = Message::decode(raw.as_bytes()).unwrap();
        assert_eq!(msg.message_type, MessageType::NodeStatus);
        assert!(msg.payload.is_empty());
        assert_eq!(msg.to, Some(to));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let raw = format!(
            r#"{{"type":"gossip","payload":"","from":"{}"}}"#,
            PeerId::random()
        );
        assert!(Message::decode(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_own_message_detection() {
        let local = PeerId::random();
        let other = PeerId::random();
        assert!(is_own_message(&local, &local, None));
        assert!(is_own_message(&local, &other, Some(&local)));
        assert!(!is_own_message(&local, &other, Some(&other)));
        assert!(!is_own_message(&local, &other, None));
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MessageType>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_chunk_response(&self, msg: InboundMessage) {
            self.seen.lock().unwrap().push(msg.message.message_type);
        }
        async fn on_storage_proof(&self, msg: InboundMessage) {
            self.seen.lock().unwrap().push(msg.message.message_type);
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_type() {
        let recorder = Arc::new(Recorder::default());
        let source = PeerId::random();
        for message_type in [
            MessageType::ModelAnnouncement,
            MessageType::StorageProof,
            MessageType::ChunkResponse,
        ] {
            let msg = InboundMessage {
                message: Message::new(message_type, Vec::new(), source),
                delivery: Delivery::Gossip { source },
            };
            dispatch(recorder.clone(), msg).await;
        }
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![MessageType::StorageProof, MessageType::ChunkResponse]
        );
    }
}
