use thiserror::Error;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The session's controller has already expired and accepts no more input
    #[error("Session closed")]
    SessionClosed,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
