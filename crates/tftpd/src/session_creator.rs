//! Turns validated read requests into running sessions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::config::SessionSettings;
use crate::outgoing::{OutgoingHandler, Responder, Transport};
use crate::read_session::BlockReadSession;
use crate::registry::{RegisteredSession, SessionRegistry};
use crate::safe_packets::{SafeError, SafeReadRequest};
use crate::source::SourceFactory;
use crate::timeout_controller::{ExpiryCallback, ExpiryReason, TimeoutController};
use crate::timer::BackoffTimer;

/// What became of a read request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A session was registered and started
    Started(Uuid),
    /// The address already has a session; the request was ignored
    AlreadyActive,
    /// The source could not be opened; an AccessViolation was sent
    Denied,
}

pub struct SessionCreator {
    registry: Arc<SessionRegistry>,
    sources: Arc<dyn SourceFactory>,
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    audit: AuditLogger,
}

impl SessionCreator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        sources: Arc<dyn SourceFactory>,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
        audit: AuditLogger,
    ) -> Self {
        Self {
            registry,
            sources,
            transport,
            settings,
            audit,
        }
    }

    /// Open the requested source and start a session for `addr`
    ///
    /// Every failure is answered to the client; nothing is returned as an
    /// error because nothing here concerns any other client.
    pub async fn create(&self, request: &SafeReadRequest, addr: SocketAddr) -> CreateOutcome {
        // Clients retransmit their RRQ when the first DATA is slow to arrive
        if self.registry.contains(addr) {
            debug!(
                "Ignoring read request for {} from {}: session already active",
                request.filename(),
                addr
            );
            return CreateOutcome::AlreadyActive;
        }

        self.audit.read_request(
            addr,
            request.filename(),
            request.mode().as_str(),
            request.options(),
        );
        if !request.options().is_empty() {
            debug!(
                "Ignoring {} option(s) from {}; negotiation is not supported",
                request.options().len(),
                addr
            );
        }

        let responder = Arc::new(Responder::new(self.transport.clone(), addr));

        let source = match self.sources.open(request.filename()).await {
            Ok(source) => source,
            Err(e) => {
                warn!("Read of {} denied for {}: {}", request.filename(), addr, e);
                self.audit.read_denied(addr, request.filename(), &e.to_string());

                // NIST AC-3: the reason goes back to the client as an access violation
                let reply = SafeError::access_violation(e.to_string());
                if let Err(send_err) = responder.send_error(&reply).await {
                    warn!("Failed to send error to {}: {}", addr, send_err);
                }
                return CreateOutcome::Denied;
            }
        };

        let id = Uuid::new_v4();
        let session = BlockReadSession::new(source, responder, addr, self.settings.block_size);
        let on_expire = self.expiry_callback(id, addr, request.filename());

        let timeout = self.settings.timeout;
        let (controller, handle) = TimeoutController::new(
            session,
            self.settings.try_limit,
            addr,
            |events| BackoffTimer::spawn(timeout, events),
            on_expire,
        );

        if !self.registry.add(addr, RegisteredSession::new(id, handle.clone())) {
            // Never started: dropping the controller stops its idle timer
            // without running the expiry callback
            debug!("Session for {} registered concurrently, dropping duplicate", addr);
            drop(controller);
            return CreateOutcome::AlreadyActive;
        }
        tokio::spawn(controller.run());

        info!(
            "Starting transfer of {} to {} ({}, block size {})",
            request.filename(),
            addr,
            request.mode(),
            self.settings.block_size
        );
        self.audit.transfer_started(
            id,
            addr,
            request.filename(),
            request.mode().as_str(),
            self.settings.block_size,
        );

        if let Err(e) = handle.begin_session() {
            warn!("Session for {} closed before it began: {}", addr, e);
        }
        CreateOutcome::Started(id)
    }

    /// Deregisters the session and records how it ended
    fn expiry_callback(
        &self,
        id: Uuid,
        addr: SocketAddr,
        filename: &str,
    ) -> ExpiryCallback {
        let registry = self.registry.clone();
        let audit = self.audit;
        let try_limit = self.settings.try_limit;
        let filename = filename.to_string();
        let started = Instant::now();

        Box::new(move |reason| {
            registry.remove_if(addr, id);

            match reason {
                ExpiryReason::Completed => {
                    info!("Transfer of {} to {} completed", filename, addr)
                }
                ExpiryReason::TriesExhausted => {
                    warn!("Transfer of {} to {} timed out", filename, addr)
                }
                ExpiryReason::Failed | ExpiryReason::Cancelled => {
                    warn!("Transfer of {} to {} aborted ({:?})", filename, addr, reason)
                }
            }
            audit.transfer_ended(id, addr, &filename, reason, try_limit, started.elapsed());
        })
    }
}
