//! Per-session retry controller
//!
//! Each read session is owned by one [`TimeoutController`] running on its own
//! task. Acks, timer elapses and expiry requests all arrive as
//! [`SessionEvent`]s on a single queue and are handled strictly in arrival
//! order, so the session itself needs no locking.
//!
//! NIST 800-53 Controls:
//! - SC-5: Denial of Service Protection (bounded retries per client)
//! - SC-10: Network Disconnect (silent clients are torn down)

use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::read_session::{AckOutcome, ReadSession};
use crate::safe_packets::SafeAck;
use crate::timer::{Elapsed, Timer};

/// Input to a controller's event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Begin,
    Ack(SafeAck),
    TimerElapsed(Elapsed),
    Expire,
}

impl From<Elapsed> for SessionEvent {
    fn from(elapsed: Elapsed) -> Self {
        SessionEvent::TimerElapsed(elapsed)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// The client acknowledged the final block
    Completed,
    /// No acceptable ack arrived within the try limit
    TriesExhausted,
    /// Reading the source or sending to the client failed
    Failed,
    /// Expiry was requested from outside, e.g. the client sent an Error
    Cancelled,
}

/// Called once when the session ends
pub type ExpiryCallback = Box<dyn FnOnce(ExpiryReason) + Send>;

/// Send attempts left for the current block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryCounter {
    tries_remaining: u32,
    try_limit: u32,
}

impl TryCounter {
    pub fn new(try_limit: u32) -> Self {
        Self {
            tries_remaining: try_limit,
            try_limit,
        }
    }

    pub fn reset(&mut self) {
        self.tries_remaining = self.try_limit;
    }

    pub fn consume(&mut self) {
        self.tries_remaining = self.tries_remaining.saturating_sub(1);
    }

    pub fn is_exhausted(&self) -> bool {
        self.tries_remaining == 0
    }

    pub fn remaining(&self) -> u32 {
        self.tries_remaining
    }

    pub fn limit(&self) -> u32 {
        self.try_limit
    }
}

/// Cloneable way into a running controller
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ControllerHandle {
    /// A handle bound to no controller; its events land on the returned
    /// receiver
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    pub fn begin_session(&self) -> Result<()> {
        self.submit(SessionEvent::Begin)
    }

    pub fn handle_ack(&self, ack: SafeAck) -> Result<()> {
        self.submit(SessionEvent::Ack(ack))
    }

    pub fn expire(&self) -> Result<()> {
        self.submit(SessionEvent::Expire)
    }

    /// Fails with [`TftpError::SessionClosed`] once the controller expired
    fn submit(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| TftpError::SessionClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Running,
    Expired,
}

pub struct TimeoutController<S, T> {
    session: S,
    timer: T,
    tries: TryCounter,
    peer: SocketAddr,
    state: ControllerState,
    begun: bool,
    on_expire: Option<ExpiryCallback>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<S, T> TimeoutController<S, T>
where
    S: ReadSession + 'static,
    T: Timer,
{
    /// Build a controller and the handle that feeds it
    ///
    /// `make_timer` receives the controller's own event sender so the timer
    /// can deliver its elapses onto the same queue as acks.
    pub fn new<F>(
        session: S,
        try_limit: u32,
        peer: SocketAddr,
        make_timer: F,
        on_expire: ExpiryCallback,
    ) -> (Self, ControllerHandle)
    where
        F: FnOnce(mpsc::UnboundedSender<SessionEvent>) -> T,
    {
        let (tx, events) = mpsc::unbounded_channel();
        let timer = make_timer(tx.clone());

        let controller = Self {
            session,
            timer,
            tries: TryCounter::new(try_limit),
            peer,
            state: ControllerState::Running,
            begun: false,
            on_expire: Some(on_expire),
            events,
        };

        (controller, ControllerHandle { events: tx })
    }

    /// Process events until the session expires; spawn this on its own task
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle_event(event).await;
            if self.is_expired() {
                break;
            }
        }
        // Dropping the receiver here makes every later submit fail
    }

    pub fn is_expired(&self) -> bool {
        self.state == ControllerState::Expired
    }

    pub fn tries(&self) -> TryCounter {
        self.tries
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        if self.is_expired() {
            return;
        }

        match event {
            SessionEvent::Begin => self.begin_session().await,
            SessionEvent::Ack(ack) => self.handle_ack(ack).await,
            SessionEvent::TimerElapsed(elapsed) => self.handle_elapsed(elapsed).await,
            SessionEvent::Expire => self.expire(ExpiryReason::Cancelled),
        }
    }

    async fn begin_session(&mut self) {
        if self.begun {
            debug!("Session for {} already begun", self.peer);
            return;
        }
        self.begun = true;

        if let Err(e) = self.session.begin().await {
            warn!("Failed to begin transfer to {}: {}", self.peer, e);
            self.expire(ExpiryReason::Failed);
            return;
        }

        self.tries.consume();
        if self.tries.is_exhausted() {
            self.expire(ExpiryReason::TriesExhausted);
        } else {
            self.timer.restart();
        }
    }

    async fn handle_ack(&mut self, ack: SafeAck) {
        match self.session.handle_ack(&ack).await {
            Ok(AckOutcome::Finished) => self.expire(ExpiryReason::Completed),
            Ok(outcome) if outcome.is_accepted() => {
                // The client is alive: a full budget for the block just sent
                self.tries.reset();
                self.tries.consume();
                self.timer.restart();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Transfer to {} failed: {}", self.peer, e);
                self.expire(ExpiryReason::Failed);
            }
        }
    }

    async fn handle_elapsed(&mut self, elapsed: Elapsed) {
        if !self.timer.is_current(&elapsed) {
            debug!("Dropping stale timeout for {}", self.peer);
            return;
        }

        if self.tries.is_exhausted() {
            debug!(
                "No tries left for {} after {} attempts",
                self.peer,
                self.tries.limit()
            );
            self.expire(ExpiryReason::TriesExhausted);
            return;
        }

        debug!(
            "Timeout for {} after {:?}, resending ({} tries left)",
            self.peer,
            elapsed.waited(),
            self.tries.remaining()
        );
        if let Err(e) = self.session.resend().await {
            warn!("Resend to {} failed: {}", self.peer, e);
            self.expire(ExpiryReason::Failed);
            return;
        }
        // The timer already re-armed itself at double the wait
        self.tries.consume();
    }

    fn expire(&mut self, reason: ExpiryReason) {
        if self.is_expired() {
            return;
        }
        self.state = ControllerState::Expired;

        if let Some(on_expire) = self.on_expire.take() {
            on_expire(reason);
        }
        self.timer.destroy();
    }
}
