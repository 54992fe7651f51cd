//! Protocol identifiers and the one-shot direct message codec.

use async_trait::async_trait;
use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response::Codec, StreamProtocol};
use std::io;
use std::time::Duration;

/// Application protocol. Scopes direct streams, the DHT and identify.
pub const PROTOCOL_ID: &str = "/3ds/1.0.0";

pub const DIRECT_PROTOCOL: StreamProtocol = StreamProtocol::new(PROTOCOL_ID);

pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/3ds/1.0.0/kad/1.0.0");

/// Application namespace, advertised in the identify agent string.
pub const DISCOVERY_NAMESPACE: &str = "3ds-network";

/// Gossipsub topic every node joins.
pub const PUBSUB_TOPIC: &str = "3ds-messages";

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub fn agent_version() -> String {
    format!("{}/{}", DISCOVERY_NAMESPACE, env!("CARGO_PKG_VERSION"))
}

/// Codec for `/3ds/1.0.0` direct messages.
///
/// The request is the raw payload, written in full and followed by closing the
/// write half. The response is an empty acknowledgement.
#[derive(Debug, Clone)]
pub struct DirectCodec {
    max_payload_size: usize,
}

impl DirectCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl Default for DirectCodec {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

#[async_trait]
impl Codec for DirectCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = ();

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.take(self.max_payload_size as u64 + 1)
            .read_to_end(&mut buf)
            .await?;
        if buf.len() > self.max_payload_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("direct payload exceeds {} bytes", self.max_payload_size),
            ));
        }
        Ok(buf)
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.take(64).read_to_end(&mut buf).await?;
        Ok(())
    }

    async fn write_request<T>(&mut self, _: &Self::Protocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&req).await?;
        io.close().await?;
        Ok(())
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, _res: Self::Response) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.close().await?;
        Ok(())
    }
}
