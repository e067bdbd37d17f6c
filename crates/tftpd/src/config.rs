use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TftpError};

/// Smallest block size accepted from configuration
pub const MIN_BLOCK_SIZE: usize = 8;

/// RFC 2348: largest block size that fits a UDP datagram
pub const MAX_BLOCK_SIZE: usize = 65464;

/// RFC 2349: the timeout option tops out at 255 seconds
pub const MAX_TIMEOUT_MS: u64 = 255_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Maximum file size in bytes that can be served (default: 100MB)
    /// Set to 0 for unlimited
    pub max_file_size_bytes: u64,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/tftpd"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 69),
            max_file_size_bytes: 104_857_600, // 100 MB default
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Per-transfer retry behavior
///
/// NIST 800-53 SC-5: bounded retries keep an unresponsive client from
/// holding a session open indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Payload bytes per DATA packet (RFC 1350 uses 512)
    pub block_size: usize,
    /// Base retransmission timeout; doubles on each unanswered resend
    pub timeout_ms: u64,
    /// Send attempts per block, the first send included
    pub try_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            timeout_ms: 1000,
            try_limit: 5,
        }
    }
}

/// What a session creator needs to know about every transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub block_size: usize,
    pub timeout: Duration,
    pub try_limit: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionConfig::default().settings()
    }
}

impl SessionConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            block_size: self.block_size,
            timeout: Duration::from_millis(self.timeout_ms),
            try_limit: self.try_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Enable structured audit logging for SIEM integration
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for SIEM integration
    Json,
}

pub fn load_config(path: &Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate TFTP configuration for security and correctness
///
/// NIST 800-53 Controls:
/// - CM-6: Configuration Settings (validate all configuration parameters)
/// - AC-3: Access Enforcement (validate directory permissions)
/// - SC-7: Boundary Protection (validate network bindings)
/// - SC-5: Denial of Service Protection (validate resource limits)
///
/// STIG V-222566: Applications must validate configuration parameters
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    // NIST CM-6: Validate root directory is absolute path
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    // NIST AC-3: Validate directory exists and is accessible
    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Config(format!("root_dir is not readable: {}", e)));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Config(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    validate_session_config(&config.session)?;

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::Config(format!("logging.file parent error: {}", e)));
            }
        }
    }

    Ok(())
}

pub fn validate_session_config(config: &SessionConfig) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&config.block_size) {
        return Err(TftpError::Config(format!(
            "session.block_size must be in range {}-{}",
            MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }

    if config.timeout_ms == 0 {
        return Err(TftpError::Config(
            "session.timeout_ms must be non-zero".to_string(),
        ));
    }

    if config.timeout_ms > MAX_TIMEOUT_MS {
        return Err(TftpError::Config(format!(
            "session.timeout_ms must be at most {}",
            MAX_TIMEOUT_MS
        )));
    }

    Ok(())
}
