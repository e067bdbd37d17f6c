//! Delivers client packets to the session registered for their address

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::packet::ErrorPacket;
use crate::registry::SessionRegistry;
use crate::safe_packets::SafeAck;

#[derive(Clone)]
pub struct SessionRouter {
    registry: Arc<SessionRegistry>,
}

impl SessionRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward an ack to its session
    ///
    /// An ack for a finished, expired or unknown session is dropped. Late and
    /// duplicate acks are ordinary on UDP. Returns whether a session took it.
    pub fn route_ack(&self, addr: SocketAddr, ack: SafeAck) -> bool {
        let Some(session) = self.registry.fetch(addr) else {
            debug!("Dropping ACK {} from {}: no active session", ack.block_number(), addr);
            return false;
        };

        match session.handle().handle_ack(ack) {
            Ok(()) => true,
            Err(_) => {
                // Expired between fetch and send; deregistration is in flight
                debug!("Dropping ACK {} from {}: session closed", ack.block_number(), addr);
                false
            }
        }
    }

    /// RFC 1350: an ERROR packet terminates the transfer without a reply
    pub fn route_error(&self, addr: SocketAddr, error: &ErrorPacket) -> bool {
        let Some(session) = self.registry.fetch(addr) else {
            debug!("Dropping ERROR from {}: no active session", addr);
            return false;
        };

        debug!(
            "Client {} aborted transfer: code={:?}, msg={}",
            addr, error.code, error.message
        );
        session.handle().expire().is_ok()
    }
}
