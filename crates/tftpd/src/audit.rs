use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{Level, event};
use uuid::Uuid;

use crate::packet::{ErrorCode, RequestOptions};
use crate::timeout_controller::ExpiryReason;

/// Security audit event types for SIEM integration
///
/// NIST 800-53 Controls:
/// - AU-2: Audit Events (comprehensive event catalog)
/// - AU-3: Content of Audit Records (structured event data)
/// - AU-12: Audit Generation (automatic event generation)
///
/// STIG V-222563: Applications must produce audit records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
        block_size: usize,
        try_limit: u32,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    /// The requested file could not be opened
    ReadDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    /// A well-formed request failed validation
    RequestRejected {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error_code: u16,
        reason: String,
    },

    WriteRequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    /// A datagram that could not be parsed
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
        packet_len: usize,
    },

    TransferStarted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        block_size: usize,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        duration_ms: u64,
    },

    /// The client stopped acknowledging
    TransferExpired {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        try_limit: u32,
        duration_ms: u64,
    },

    /// Client error, read failure or send failure
    TransferAborted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
        duration_ms: u64,
    },

    ConfigurationLoaded {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
    },
}

/// Common fields present in all audit events
///
/// NIST 800-53 AU-3: Content of Audit Records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    /// Session id shared by every event of one transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "tftpd".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, session_id: Uuid) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = Some(session_id.to_string());
        fields
    }
}

impl AuditEvent {
    /// Emit this event as one structured tracing event
    ///
    /// NIST 800-53 AU-12: Audit Generation
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    pub fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::ReadDenied { common, .. }
            | AuditEvent::RequestRejected { common, .. }
            | AuditEvent::WriteRequestDenied { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::TransferStarted { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferExpired { common, .. }
            | AuditEvent::TransferAborted { common, .. }
            | AuditEvent::ConfigurationLoaded { common, .. } => common,
        }
    }
}

/// Option pairs as a JSON object
pub fn options_json(options: &RequestOptions) -> serde_json::Value {
    options
        .iter()
        .map(|(key, value)| (key.to_string(), serde_json::Value::from(value)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

/// Audit logger for TFTP operations
///
/// A disabled logger drops every event; protocol behavior never depends on
/// whether auditing is on.
///
/// NIST 800-53 Controls:
/// - AU-2: Audit Events
/// - AU-9: Protection of Audit Information
#[derive(Debug, Clone, Copy)]
pub struct AuditLogger {
    enabled: bool,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AuditLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn emit(&self, event: impl FnOnce() -> AuditEvent) {
        if self.enabled {
            event().log();
        }
    }

    pub fn server_started(
        &self,
        bind_addr: SocketAddr,
        root_dir: &Path,
        block_size: usize,
        try_limit: u32,
    ) {
        self.emit(|| AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.display().to_string(),
            block_size,
            try_limit,
        });
    }

    pub fn read_request(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        options: &RequestOptions,
    ) {
        self.emit(|| AuditEvent::ReadRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: options_json(options),
        });
    }

    pub fn read_denied(&self, client_addr: SocketAddr, filename: &str, reason: &str) {
        self.emit(|| AuditEvent::ReadDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn request_rejected(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        code: ErrorCode,
        reason: &str,
    ) {
        self.emit(|| AuditEvent::RequestRejected {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error_code: code.into(),
            reason: reason.to_string(),
        });
    }

    pub fn write_request_denied(&self, client_addr: SocketAddr, filename: &str, reason: &str) {
        self.emit(|| AuditEvent::WriteRequestDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn protocol_violation(&self, client_addr: SocketAddr, violation: &str, packet_len: usize) {
        self.emit(|| AuditEvent::ProtocolViolation {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
            packet_len,
        });
    }

    pub fn transfer_started(
        &self,
        session_id: Uuid,
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        block_size: usize,
    ) {
        self.emit(|| AuditEvent::TransferStarted {
            common: CommonFields::with_correlation("info", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            block_size,
        });
    }

    /// Record how a transfer ended
    pub fn transfer_ended(
        &self,
        session_id: Uuid,
        client_addr: SocketAddr,
        filename: &str,
        reason: ExpiryReason,
        try_limit: u32,
        duration: Duration,
    ) {
        self.emit(|| {
            transfer_ended_event(session_id, client_addr, filename, reason, try_limit, duration)
        });
    }

    pub fn configuration_loaded(&self, config_file: &Path) {
        self.emit(|| AuditEvent::ConfigurationLoaded {
            common: CommonFields::new("info"),
            config_file: config_file.display().to_string(),
        });
    }
}

fn transfer_ended_event(
    session_id: Uuid,
    client_addr: SocketAddr,
    filename: &str,
    reason: ExpiryReason,
    try_limit: u32,
    duration: Duration,
) -> AuditEvent {
    let client_addr = client_addr.to_string();
    let filename = filename.to_string();
    let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

    match reason {
        ExpiryReason::Completed => AuditEvent::TransferCompleted {
            common: CommonFields::with_correlation("info", session_id),
            client_addr,
            filename,
            duration_ms,
        },
        ExpiryReason::TriesExhausted => AuditEvent::TransferExpired {
            common: CommonFields::with_correlation("warn", session_id),
            client_addr,
            filename,
            try_limit,
            duration_ms,
        },
        ExpiryReason::Failed | ExpiryReason::Cancelled => AuditEvent::TransferAborted {
            common: CommonFields::with_correlation("error", session_id),
            client_addr,
            filename,
            reason: match reason {
                ExpiryReason::Cancelled => "cancelled by client".to_string(),
                _ => "transfer failed".to_string(),
            },
            duration_ms,
        },
    }
}
