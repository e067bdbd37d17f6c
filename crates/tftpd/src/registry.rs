//! Active sessions keyed by client address
//!
//! NIST 800-53: AC-10 (Concurrent Session Control)
//!
//! The map sits behind a std `RwLock`: lookups per incoming ack share the
//! lock, while add/remove (once per session lifetime) take it exclusively.
//! Critical sections never await, which also lets the synchronous expiry
//! callback deregister its own session.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use crate::timeout_controller::ControllerHandle;

/// String form of a client address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl From<SocketAddr> for SessionKey {
    fn from(addr: SocketAddr) -> Self {
        SessionKey(addr.to_string())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered session: its controller plus a per-session identity
#[derive(Debug, Clone)]
pub struct RegisteredSession {
    id: Uuid,
    handle: ControllerHandle,
}

impl RegisteredSession {
    pub fn new(id: Uuid, handle: ControllerHandle) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> &ControllerHandle {
        &self.handle
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, RegisteredSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` for `addr`
    ///
    /// Returns `false` and keeps the existing entry when the address already
    /// has a session.
    pub fn add(&self, addr: SocketAddr, session: RegisteredSession) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.entry(SessionKey::from(addr)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn fetch(&self, addr: SocketAddr) -> Option<RegisteredSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&SessionKey::from(addr))
            .cloned()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&SessionKey::from(addr))
    }

    pub fn remove(&self, addr: SocketAddr) -> Option<RegisteredSession> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&SessionKey::from(addr))
    }

    /// Remove the entry for `addr` only if it is still session `id`
    ///
    /// A session that expires late must not take a newer session for the
    /// same address down with it.
    pub fn remove_if(&self, addr: SocketAddr, id: Uuid) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let key = SessionKey::from(addr);
        match sessions.get(&key) {
            Some(entry) if entry.id == id => {
                sessions.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
