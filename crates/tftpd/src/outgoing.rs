use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::Result;
use crate::safe_packets::{SafeData, SafeError};

/// Datagram send side of the server socket
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> std::io::Result<()>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        UdpSocket::send_to(self, datagram, addr).await.map(|_| ())
    }
}

/// Where a session sends its packets
#[async_trait]
pub trait OutgoingHandler: Send + Sync {
    async fn send_data(&self, data: &SafeData) -> Result<()>;

    async fn send_error(&self, error: &SafeError) -> Result<()>;
}

/// Serializes safe packets and sends them to one peer
#[derive(Clone)]
pub struct Responder {
    transport: Arc<dyn Transport>,
    peer: SocketAddr,
}

impl Responder {
    pub fn new(transport: Arc<dyn Transport>, peer: SocketAddr) -> Self {
        Self { transport, peer }
    }
}

#[async_trait]
impl OutgoingHandler for Responder {
    async fn send_data(&self, data: &SafeData) -> Result<()> {
        self.transport
            .send_to(&data.to_bytes(), self.peer)
            .await?;
        debug!(
            "Sent DATA block {} ({} bytes) to {}",
            data.block_number(),
            data.payload().len(),
            self.peer
        );
        Ok(())
    }

    async fn send_error(&self, error: &SafeError) -> Result<()> {
        self.transport
            .send_to(&error.to_bytes(), self.peer)
            .await?;
        debug!(
            "Sent ERROR packet to {}: code={:?}, msg={}",
            self.peer,
            error.code(),
            error.message()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ErrorCode, Packet};
    use crate::test_support::RecordingTransport;
    use bytes::Bytes;

    #[tokio::test]
    async fn responder_addresses_its_peer() {
        let transport = Arc::new(RecordingTransport::new());
        let peer: SocketAddr = "10.0.0.7:2000".parse().unwrap();
        let responder = Responder::new(transport.clone(), peer);

        responder
            .send_data(&SafeData::new(1, Bytes::from_static(b"fo")))
            .await
            .unwrap();
        responder
            .send_error(&SafeError::access_violation("nope"))
            .await
            .unwrap();

        let sent = transport.sent_to(peer);
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Packet::Data(data) if data.block_number == 1));
        assert!(matches!(
            &sent[1],
            Packet::Error(err) if err.code == ErrorCode::AccessViolation && err.message == "nope"
        ));
    }
}
