//! Validated packet types
//!
//! Values in this module can only be obtained through their constructors or
//! a [`Converter`], and expose no mutators. Session code past the safety
//! filter relies on that.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

use crate::packet::{Ack, Data, ErrorCode, ErrorPacket, ReadRequest, RequestOptions};

/// RFC 1350 - Transfer modes
///
/// Both modes are served byte-for-byte; netascii translation is not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    NetAscii,
    Octet,
}

impl TransferMode {
    /// Case-insensitive match against the RFC 1350 mode names
    pub fn parse(mode: &str) -> Option<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "netascii" => Some(TransferMode::NetAscii),
            "octet" => Some(TransferMode::Octet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::NetAscii => "netascii",
            TransferMode::Octet => "octet",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeAck {
    block_number: u16,
}

impl SafeAck {
    pub fn new(block_number: u16) -> Self {
        Self { block_number }
    }

    pub fn block_number(&self) -> u16 {
        self.block_number
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeData {
    block_number: u16,
    payload: Bytes,
}

impl SafeData {
    pub fn new(block_number: u16, payload: Bytes) -> Self {
        Self {
            block_number,
            payload,
        }
    }

    pub fn block_number(&self) -> u16 {
        self.block_number
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn to_bytes(&self) -> Bytes {
        Data {
            block_number: self.block_number,
            payload: self.payload.clone(),
        }
        .to_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeError {
    code: ErrorCode,
    message: String,
}

impl SafeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn access_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccessViolation, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn to_bytes(&self) -> Bytes {
        ErrorPacket {
            code: self.code,
            message: self.message.clone(),
        }
        .to_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeReadRequest {
    filename: String,
    mode: TransferMode,
    options: RequestOptions,
}

impl SafeReadRequest {
    pub fn new(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self::with_options(filename, mode, RequestOptions::new())
    }

    pub fn with_options(
        filename: impl Into<String>,
        mode: TransferMode,
        options: RequestOptions,
    ) -> Self {
        Self {
            filename: filename.into(),
            mode,
            options,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Options are carried through untouched; none are negotiated
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }
}

/// A well-formed packet that failed semantic validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ConversionError {
    code: ErrorCode,
    message: String,
}

impl ConversionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ConversionError> for SafeError {
    fn from(err: ConversionError) -> Self {
        SafeError::new(err.code, err.message)
    }
}

/// Turns parsed packets into their validated counterparts
pub trait Converter: Send + Sync {
    fn from_ack(&self, ack: &Ack) -> SafeAck;

    fn from_read_request(
        &self,
        read: &ReadRequest,
    ) -> std::result::Result<SafeReadRequest, ConversionError>;
}

/// The production [`Converter`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketConverter;

impl Converter for PacketConverter {
    fn from_ack(&self, ack: &Ack) -> SafeAck {
        SafeAck::new(ack.block_number)
    }

    /// NIST SI-10: the mode string is the only field validated here;
    /// filename and options pass through unchanged.
    fn from_read_request(
        &self,
        read: &ReadRequest,
    ) -> std::result::Result<SafeReadRequest, ConversionError> {
        let mode = TransferMode::parse(&read.mode)
            .ok_or_else(|| ConversionError::new(ErrorCode::Undefined, "Invalid mode string"))?;

        Ok(SafeReadRequest::with_options(
            read.filename.clone(),
            mode,
            read.options.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_request(filename: &str, mode: &str) -> ReadRequest {
        ReadRequest {
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: RequestOptions::new(),
        }
    }

    #[test]
    fn ack_conversion_keeps_block_number() {
        let safe = PacketConverter.from_ack(&Ack { block_number: 16 });
        assert_eq!(safe.block_number(), 16);
    }

    #[test]
    fn mode_matching_ignores_case() {
        let cases = [
            ("netascii", TransferMode::NetAscii),
            ("NetAscii", TransferMode::NetAscii),
            ("octet", TransferMode::Octet),
            ("OCTET", TransferMode::Octet),
        ];

        for (mode, expected) in cases {
            let safe = PacketConverter
                .from_read_request(&read_request("foo", mode))
                .unwrap();
            assert_eq!(safe.filename(), "foo");
            assert_eq!(safe.mode(), expected);
        }
    }

    #[test]
    fn unknown_mode_is_rejected_as_undefined() {
        let err = PacketConverter
            .from_read_request(&read_request("foo", "mail"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Undefined);
        assert_eq!(err.to_string(), "Invalid mode string");

        let safe: SafeError = err.into();
        assert_eq!(&safe.to_bytes()[..], b"\x00\x05\x00\x00Invalid mode string\x00");
    }

    #[test]
    fn options_pass_through() {
        let mut request = read_request("pxelinux.0", "octet");
        request
            .options
            .insert("blksize".to_string(), "1468".to_string());

        let safe = PacketConverter.from_read_request(&request).unwrap();
        assert_eq!(
            safe.options().iter().collect::<Vec<_>>(),
            vec![("blksize", "1468")]
        );
    }

    #[test]
    fn data_equality_covers_block_and_payload() {
        let data = SafeData::new(1, Bytes::from_static(b"Hello"));
        assert_eq!(data, SafeData::new(1, Bytes::from_static(b"Hello")));
        assert_ne!(data, SafeData::new(2, Bytes::from_static(b"Hello")));
        assert_ne!(data, SafeData::new(1, Bytes::from_static(b"Hello!")));
    }
}
