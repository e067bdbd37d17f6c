//! UDP front end
//!
//! A single receive loop parses every datagram and dispatches it. Read
//! requests are set up on their own task, and each session then runs on its
//! own controller task and sends through the shared socket.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::config::{SessionSettings, TftpConfig};
use crate::error::Result;
use crate::outgoing::{OutgoingHandler, Responder, Transport};
use crate::packet::{InvalidTransmission, MAX_PACKET_SIZE, Packet, WriteRequest};
use crate::registry::SessionRegistry;
use crate::safe_packets::{SafeAck, SafeError, SafeReadRequest};
use crate::safety_filter::{SafeRequestHandler, SafetyFilter};
use crate::session_creator::SessionCreator;
use crate::session_router::SessionRouter;
use crate::source::{RootDirSource, SourceFactory};

/// Routes each incoming datagram to the component responsible for it
pub struct Dispatcher {
    filter: SafetyFilter,
    creator: Arc<SessionCreator>,
    router: SessionRouter,
    transport: Arc<dyn Transport>,
    audit: AuditLogger,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        sources: Arc<dyn SourceFactory>,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
        audit: AuditLogger,
    ) -> Self {
        Self {
            filter: SafetyFilter::default(),
            creator: Arc::new(SessionCreator::new(
                registry.clone(),
                sources,
                transport.clone(),
                settings,
                audit,
            )),
            router: SessionRouter::new(registry),
            transport,
            audit,
        }
    }

    /// Handle one datagram from `addr`
    ///
    /// NIST 800-53 Controls:
    /// - SI-10: Information Input Validation (parse before anything else)
    /// - SC-5: Denial of Service Protection (faults stay with one client)
    pub async fn dispatch(&self, datagram: &[u8], addr: SocketAddr) {
        let packet = match Packet::parse(datagram) {
            Ok(packet) => packet,
            Err(reason) => {
                let invalid =
                    InvalidTransmission::new(Bytes::copy_from_slice(datagram), reason, addr);
                self.reject_invalid(&invalid);
                return;
            }
        };

        match packet {
            Packet::ReadRequest(request) => {
                self.filter.handle_read_request(addr, &request, self).await
            }
            Packet::Ack(ack) => self.filter.handle_ack(addr, &ack, self).await,
            Packet::WriteRequest(request) => self.deny_write(addr, &request).await,
            Packet::Error(error) => {
                self.router.route_error(addr, &error);
            }
            Packet::Data(data) => {
                debug!(
                    "Dropping DATA block {} from {}: uploads are not supported",
                    data.block_number, addr
                );
            }
        }
    }

    fn reject_invalid(&self, invalid: &InvalidTransmission) {
        debug!(
            "Invalid packet from {} ({} bytes): {}",
            invalid.addr,
            invalid.packet.len(),
            invalid.reason
        );
        self.audit.protocol_violation(
            invalid.addr,
            &invalid.reason.to_string(),
            invalid.packet.len(),
        );
    }

    async fn deny_write(&self, addr: SocketAddr, request: &WriteRequest) {
        warn!("Write request for {} from {} denied", request.filename, addr);
        self.audit
            .write_request_denied(addr, &request.filename, "Write not supported");
        self.send_error(addr, &SafeError::access_violation("Write not supported"))
            .await;
    }

    async fn send_error(&self, addr: SocketAddr, error: &SafeError) {
        let responder = Responder::new(self.transport.clone(), addr);
        if let Err(e) = responder.send_error(error).await {
            warn!("Failed to send error to {}: {}", addr, e);
        }
    }
}

#[async_trait]
impl SafeRequestHandler for Dispatcher {
    async fn handle_safe_ack(&self, addr: SocketAddr, ack: SafeAck) {
        self.router.route_ack(addr, ack);
    }

    async fn handle_safe_read_request(&self, addr: SocketAddr, request: SafeReadRequest) {
        // NIST SC-5: opening the source must not hold up the receive loop
        let creator = self.creator.clone();
        tokio::spawn(async move {
            creator.create(&request, addr).await;
        });
    }

    async fn handle_rejection(&self, addr: SocketAddr, filename: &str, error: SafeError) {
        self.audit
            .request_rejected(addr, filename, error.code(), error.message());
        self.send_error(addr, &error).await;
    }
}

pub struct TftpServer {
    socket: Arc<UdpSocket>,
    dispatcher: Dispatcher,
    registry: Arc<SessionRegistry>,
}

impl TftpServer {
    /// Bind the configured address and serve `root_dir`
    pub async fn bind(config: &TftpConfig, audit: AuditLogger) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let sources = Arc::new(RootDirSource::new(
            config.root_dir.clone(),
            config.max_file_size_bytes,
        ));
        Ok(Self::from_socket(
            socket,
            sources,
            config.session.settings(),
            audit,
        ))
    }

    pub fn from_socket(
        socket: UdpSocket,
        sources: Arc<dyn SourceFactory>,
        settings: SessionSettings,
        audit: AuditLogger,
    ) -> Self {
        let socket = Arc::new(socket);
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            sources,
            socket.clone(),
            settings,
            audit,
        );

        Self {
            socket,
            dispatcher,
            registry,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the receive loop forever
    ///
    /// STIG V-222563: Applications must produce audit records
    pub async fn run(&self) -> Result<()> {
        info!("TFTP server listening on {}", self.local_addr()?);

        // NIST SC-5: Allocate fixed-size buffer to prevent memory exhaustion
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((size, client_addr)) => {
                    self.dispatcher.dispatch(&buf[..size], client_addr).await;
                }
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms
                    error!("Error receiving TFTP packet: {}", e);
                }
            }
        }
    }

    /// Run until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            () = shutdown => {
                info!(
                    "Shutting down with {} active session(s)",
                    self.registry.len()
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Ack, Data, ErrorCode, ErrorPacket};
    use crate::source::{DataSource, SourceError};
    use crate::test_support::{MemorySourceFactory, RecordingTransport};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Serves "slow.bin" only once the test opens the gate
    struct GatedSourceFactory {
        inner: MemorySourceFactory,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl SourceFactory for GatedSourceFactory {
        async fn open(&self, filename: &str) -> std::result::Result<DataSource, SourceError> {
            if filename == "slow.bin" {
                self.gate.notified().await;
            }
            self.inner.open(filename).await
        }
    }

    fn client() -> SocketAddr {
        "192.0.2.77:6100".parse().unwrap()
    }

    fn dispatcher() -> (Dispatcher, Arc<RecordingTransport>, Arc<SessionRegistry>) {
        let transport = Arc::new(RecordingTransport::new());
        let registry = Arc::new(SessionRegistry::new());
        let sources = MemorySourceFactory::new().with_file("hello.txt", &b"hello"[..]);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(sources),
            transport.clone(),
            SessionSettings {
                block_size: 512,
                timeout: Duration::from_secs(1),
                try_limit: 3,
            },
            AuditLogger::disabled(),
        );
        (dispatcher, transport, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_datagrams_get_no_reply() {
        let (dispatcher, transport, registry) = dispatcher();

        dispatcher.dispatch(&[0, 4], client()).await;
        dispatcher.dispatch(&[0, 9, 0, 0], client()).await;
        dispatcher.dispatch(b"\x00\x01hello.txt", client()).await;

        assert!(transport.sent().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn write_request_is_refused() {
        let (dispatcher, transport, registry) = dispatcher();

        dispatcher
            .dispatch(b"\x00\x02upload.bin\x00octet\x00", client())
            .await;

        assert!(registry.is_empty());
        assert_eq!(
            transport.sent_to(client()),
            vec![Packet::Error(ErrorPacket {
                code: ErrorCode::AccessViolation,
                message: "Write not supported".to_string(),
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bad_mode_is_answered_and_not_registered() {
        let (dispatcher, transport, registry) = dispatcher();

        dispatcher
            .dispatch(b"\x00\x01hello.txt\x00bogus\x00", client())
            .await;

        assert!(registry.is_empty());
        assert_eq!(
            transport.sent_to(client()),
            vec![Packet::Error(ErrorPacket {
                code: ErrorCode::Undefined,
                message: "Invalid mode string".to_string(),
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn read_then_ack_completes() {
        let (dispatcher, transport, registry) = dispatcher();

        dispatcher
            .dispatch(b"\x00\x01hello.txt\x00OCTET\x00", client())
            .await;
        let sent = transport.wait_for(client(), 1).await;
        assert_eq!(
            sent[0],
            Packet::Data(Data {
                block_number: 1,
                payload: Bytes::from_static(b"hello"),
            })
        );

        dispatcher
            .dispatch(&Ack { block_number: 1 }.to_bytes(), client())
            .await;
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.sent_to(client()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_tears_session_down_silently() {
        let (dispatcher, transport, registry) = dispatcher();

        dispatcher
            .dispatch(b"\x00\x01hello.txt\x00octet\x00", client())
            .await;
        transport.wait_for(client(), 1).await;
        assert_eq!(registry.len(), 1);

        dispatcher
            .dispatch(b"\x00\x05\x00\x00disk full\x00", client())
            .await;
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.sent_to(client()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stray_ack_and_data_are_dropped() {
        let (dispatcher, transport, _registry) = dispatcher();

        dispatcher
            .dispatch(&Ack { block_number: 9 }.to_bytes(), client())
            .await;
        dispatcher.dispatch(b"\x00\x03\x00\x01abc", client()).await;

        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_open_does_not_stall_other_clients() {
        let transport = Arc::new(RecordingTransport::new());
        let registry = Arc::new(SessionRegistry::new());
        let gate = Arc::new(Notify::new());
        let sources = GatedSourceFactory {
            inner: MemorySourceFactory::new()
                .with_file("fast.bin", &b"abcdef"[..])
                .with_file("slow.bin", &b"xyz"[..]),
            gate: gate.clone(),
        };
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(sources),
            transport.clone(),
            SessionSettings {
                block_size: 4,
                timeout: Duration::from_secs(1),
                try_limit: 3,
            },
            AuditLogger::disabled(),
        );
        let fast: SocketAddr = "192.0.2.80:6200".parse().unwrap();
        let slow: SocketAddr = "192.0.2.81:6201".parse().unwrap();

        dispatcher
            .dispatch(b"\x00\x01fast.bin\x00octet\x00", fast)
            .await;
        transport.wait_for(fast, 1).await;

        // Returns while the slow open is still parked on the gate
        tokio::time::timeout(
            Duration::from_millis(100),
            dispatcher.dispatch(b"\x00\x01slow.bin\x00octet\x00", slow),
        )
        .await
        .expect("read request blocked the dispatcher");

        dispatcher
            .dispatch(&Ack { block_number: 1 }.to_bytes(), fast)
            .await;
        let sent = tokio::time::timeout(Duration::from_millis(100), transport.wait_for(fast, 2))
            .await
            .expect("ack was not answered while another open was pending");
        assert_eq!(
            sent[1],
            Packet::Data(Data {
                block_number: 2,
                payload: Bytes::from_static(b"ef"),
            })
        );
        assert!(transport.sent_to(slow).is_empty());

        gate.notify_one();
        let sent = transport.wait_for(slow, 1).await;
        assert_eq!(
            sent[0],
            Packet::Data(Data {
                block_number: 1,
                payload: Bytes::from_static(b"xyz"),
            })
        );
    }
}
