//! Boundary between parsed packets and session logic
//!
//! Everything past this filter receives only safe packet types. Rejections
//! are handed back to the caller so that an error can be sent to the client.
//!
//! NIST 800-53 SI-10: Information Input Validation

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::packet::{Ack, ReadRequest};
use crate::safe_packets::{Converter, PacketConverter, SafeAck, SafeError, SafeReadRequest};

/// Receives the outcome of filtering one packet
#[async_trait]
pub trait SafeRequestHandler: Send + Sync {
    async fn handle_safe_ack(&self, addr: SocketAddr, ack: SafeAck);

    async fn handle_safe_read_request(&self, addr: SocketAddr, request: SafeReadRequest);

    /// A request failed validation; `error` should go back to `addr`
    async fn handle_rejection(&self, addr: SocketAddr, filename: &str, error: SafeError);
}

#[derive(Clone)]
pub struct SafetyFilter {
    converter: Arc<dyn Converter>,
}

impl Default for SafetyFilter {
    fn default() -> Self {
        Self::new(Arc::new(PacketConverter))
    }
}

impl SafetyFilter {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }

    pub async fn handle_ack(&self, addr: SocketAddr, ack: &Ack, handler: &dyn SafeRequestHandler) {
        let safe = self.converter.from_ack(ack);
        handler.handle_safe_ack(addr, safe).await;
    }

    pub async fn handle_read_request(
        &self,
        addr: SocketAddr,
        request: &ReadRequest,
        handler: &dyn SafeRequestHandler,
    ) {
        match self.converter.from_read_request(request) {
            Ok(safe) => handler.handle_safe_read_request(addr, safe).await,
            Err(rejection) => {
                warn!(
                    "Rejected read request for {} from {}: {} (mode {:?})",
                    request.filename, addr, rejection, request.mode
                );
                handler
                    .handle_rejection(addr, &request.filename, rejection.into())
                    .await;
            }
        }
    }
}
