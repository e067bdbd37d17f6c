//! In-memory collaborators for tests
//!
//! Both implement the production traits, so tests exercise the same code
//! paths as the UDP server.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

use crate::outgoing::Transport;
use crate::packet::Packet;
use crate::source::{DataSource, SourceError, SourceFactory};

/// [`Transport`] that keeps every datagram instead of sending it
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
    notify: Notify,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw datagrams in send order
    pub fn sent(&self) -> Vec<(SocketAddr, Bytes)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Parsed packets sent to `addr`, in send order
    pub fn sent_to(&self, addr: SocketAddr) -> Vec<Packet> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| *to == addr)
            .filter_map(|(_, datagram)| Packet::parse(&datagram).ok())
            .collect()
    }

    /// Wait until at least `count` packets went to `addr`
    pub async fn wait_for(&self, addr: SocketAddr, count: usize) -> Vec<Packet> {
        loop {
            let notified = self.notify.notified();
            let packets = self.sent_to(addr);
            if packets.len() >= count {
                return packets;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((addr, Bytes::copy_from_slice(datagram)));
        self.notify.notify_waiters();
        Ok(())
    }
}

/// [`SourceFactory`] serving fixed contents by exact filename
#[derive(Debug, Default, Clone)]
pub struct MemorySourceFactory {
    files: HashMap<String, Bytes>,
}

impl MemorySourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, filename: &str, contents: impl Into<Bytes>) -> Self {
        self.files.insert(filename.to_string(), contents.into());
        self
    }
}

#[async_trait]
impl SourceFactory for MemorySourceFactory {
    async fn open(&self, filename: &str) -> std::result::Result<DataSource, SourceError> {
        self.files
            .get(filename)
            .map(|contents| Box::new(Cursor::new(contents.clone())) as DataSource)
            .ok_or(SourceError::NotFound)
    }
}
