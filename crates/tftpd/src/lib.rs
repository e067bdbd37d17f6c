//! # tftpd
//!
//! Read-only TFTP server.
//!
//! This crate implements the protocol as defined in:
//! - RFC 1350: The TFTP Protocol (Revision 2)
//! - RFC 2347: TFTP Option Extension (parsed, not negotiated)
//!
//! ## Layers
//!
//! - `packet`: wire codec
//! - `safety_filter` / `safe_packets`: validation boundary
//! - `read_session`: block-by-block transfer state machine
//! - `timer` / `timeout_controller`: retransmission with exponential backoff
//! - `registry`, `session_creator`, `session_router`: per-client session lifecycle
//! - `server`: UDP receive loop

pub mod audit;
pub mod config;
pub mod error;
pub mod outgoing;
pub mod packet;
pub mod read_session;
pub mod registry;
pub mod safe_packets;
pub mod safety_filter;
pub mod server;
pub mod session_creator;
pub mod session_router;
pub mod source;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod timeout_controller;
pub mod timer;

pub use audit::AuditLogger;
pub use config::{SessionSettings, TftpConfig};
pub use error::{Result, TftpError};
pub use server::{Dispatcher, TftpServer};
pub use source::{RootDirSource, SourceFactory};
