//! RFC 1350 wire codec
//!
//! Parses raw datagrams into [`Packet`] values or classifies them as an
//! [`InvalidReason`], and serializes outgoing packets. Nothing in here is
//! trusted yet: the safety filter sits between this module and the sessions.
//!
//! NIST 800-53 Controls:
//! - SI-10: Information Input Validation (length and terminator checks)
//! - SC-5: Denial of Service Protection (malformed input never reaches sessions)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

/// Largest datagram the server will read (max block size + 4 byte header)
pub const MAX_PACKET_SIZE: usize = 65468;

/// Opcode (2 bytes) plus at least one byte of payload
const MIN_PACKET_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
}

impl TryFrom<u16> for Opcode {
    type Error = InvalidReason;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            _ => Err(InvalidReason::InvalidOpcode),
        }
    }
}

/// TFTP error codes carried in Error packets
///
/// Values outside the enumerated set survive a parse/serialize cycle as
/// `Unrecognized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Undefined,                    // 0 - Not defined, see error message
    FileNotFound,                 // 1
    AccessViolation,              // 2
    DiskFullOrAllocationExceeded, // 3
    IllegalTftpOperation,         // 5
    FileAlreadyExists,            // 6
    NoSuchUser,                   // 7
    Unrecognized(u16),
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFullOrAllocationExceeded,
            5 => ErrorCode::IllegalTftpOperation,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            other => ErrorCode::Unrecognized(other),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFullOrAllocationExceeded => 3,
            ErrorCode::IllegalTftpOperation => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Unrecognized(other) => other,
        }
    }
}

/// Why a datagram could not be turned into a [`Packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    PacketTooShort,
    InvalidOpcode,
    MissingField,
    PacketTooLong,
    OptionsMalformed,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidReason::PacketTooShort => "Packet too short",
            InvalidReason::InvalidOpcode => "Invalid opcode",
            InvalidReason::MissingField => "Missing field",
            InvalidReason::PacketTooLong => "Packet too long",
            InvalidReason::OptionsMalformed => "Options malformed",
        };
        f.write_str(text)
    }
}

/// A datagram rejected by the codec, kept only for logging and auditing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransmission {
    pub packet: Bytes,
    pub reason: InvalidReason,
    pub addr: SocketAddr,
}

impl InvalidTransmission {
    pub fn new(packet: Bytes, reason: InvalidReason, addr: SocketAddr) -> Self {
        Self {
            packet,
            reason,
            addr,
        }
    }
}

/// RFC 2347 option pairs in the order the client sent them
///
/// A repeated key replaces the earlier value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions(Vec<(String, String)>);

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub block_number: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub block_number: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: ErrorCode,
    pub message: String,
}

/// Shared layout of read and write requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWriteRequest {
    pub filename: String,
    pub mode: String,
    pub options: RequestOptions,
}

pub type ReadRequest = ReadWriteRequest;
pub type WriteRequest = ReadWriteRequest;

/// A syntactically valid but otherwise untrusted TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(ReadRequest),
    WriteRequest(WriteRequest),
    Data(Data),
    Ack(Ack),
    Error(ErrorPacket),
}

impl Packet {
    /// Parse a raw datagram
    ///
    /// NIST SI-10: every length and terminator is checked before a field is
    /// read; nothing here panics on hostile input.
    pub fn parse(datagram: &[u8]) -> std::result::Result<Packet, InvalidReason> {
        // The opcode is not inspected at all below the minimum size
        if datagram.len() < MIN_PACKET_SIZE {
            return Err(InvalidReason::PacketTooShort);
        }

        let mut buf = datagram;
        let opcode = Opcode::try_from(buf.get_u16())?;

        match opcode {
            Opcode::Ack => parse_ack(buf).map(Packet::Ack),
            Opcode::Data => parse_data(buf).map(Packet::Data),
            Opcode::Error => parse_error(buf).map(Packet::Error),
            Opcode::Rrq => parse_request(buf).map(Packet::ReadRequest),
            Opcode::Wrq => parse_request(buf).map(Packet::WriteRequest),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Packet::ReadRequest(request) => request.to_bytes(Opcode::Rrq),
            Packet::WriteRequest(request) => request.to_bytes(Opcode::Wrq),
            Packet::Data(data) => data.to_bytes(),
            Packet::Ack(ack) => ack.to_bytes(),
            Packet::Error(error) => error.to_bytes(),
        }
    }
}

impl Ack {
    pub fn to_bytes(&self) -> Bytes {
        let mut packet = BytesMut::with_capacity(4);
        packet.put_u16(Opcode::Ack as u16);
        packet.put_u16(self.block_number);
        packet.freeze()
    }
}

impl Data {
    pub fn to_bytes(&self) -> Bytes {
        // RFC 1350: DATA packet format
        // 2 bytes: opcode (03)
        // 2 bytes: block number
        // n bytes: data, framed by the datagram boundary
        let mut packet = BytesMut::with_capacity(4 + self.payload.len());
        packet.put_u16(Opcode::Data as u16);
        packet.put_u16(self.block_number);
        packet.put_slice(&self.payload);
        packet.freeze()
    }
}

impl ErrorPacket {
    pub fn to_bytes(&self) -> Bytes {
        // RFC 1350: ERROR packet format
        // 2 bytes: opcode (05)
        // 2 bytes: error code
        // string: error message (null-terminated)
        let mut packet = BytesMut::with_capacity(5 + self.message.len());
        packet.put_u16(Opcode::Error as u16);
        packet.put_u16(self.code.into());
        packet.put_slice(self.message.as_bytes());
        packet.put_u8(0);
        packet.freeze()
    }
}

impl ReadWriteRequest {
    fn to_bytes(&self, opcode: Opcode) -> Bytes {
        let mut packet = BytesMut::new();
        packet.put_u16(opcode as u16);
        put_cstring(&mut packet, &self.filename);
        put_cstring(&mut packet, &self.mode);
        for (key, value) in self.options.iter() {
            put_cstring(&mut packet, key);
            put_cstring(&mut packet, value);
        }
        packet.freeze()
    }
}

fn parse_ack(mut body: &[u8]) -> std::result::Result<Ack, InvalidReason> {
    if body.len() < 2 {
        return Err(InvalidReason::PacketTooShort);
    }
    if body.len() > 2 {
        return Err(InvalidReason::PacketTooLong);
    }

    Ok(Ack {
        block_number: body.get_u16(),
    })
}

fn parse_data(mut body: &[u8]) -> std::result::Result<Data, InvalidReason> {
    if body.len() < 2 {
        return Err(InvalidReason::PacketTooShort);
    }

    let block_number = body.get_u16();
    Ok(Data {
        block_number,
        payload: Bytes::copy_from_slice(body),
    })
}

fn parse_error(mut body: &[u8]) -> std::result::Result<ErrorPacket, InvalidReason> {
    if body.len() < 2 {
        return Err(InvalidReason::PacketTooShort);
    }

    let code = ErrorCode::from(body.get_u16());
    let message = take_cstring(&mut body).ok_or(InvalidReason::MissingField)?;
    if body.has_remaining() {
        return Err(InvalidReason::PacketTooLong);
    }

    Ok(ErrorPacket { code, message })
}

fn parse_request(mut body: &[u8]) -> std::result::Result<ReadWriteRequest, InvalidReason> {
    // RFC 1350: RRQ/WRQ packet format
    // string: filename (null-terminated)
    // string: mode (null-terminated)
    // RFC 2347: followed by optional option/value pairs
    let filename = take_cstring(&mut body).ok_or(InvalidReason::MissingField)?;
    let mode = take_cstring(&mut body).ok_or(InvalidReason::MissingField)?;

    let mut options = RequestOptions::new();
    while body.has_remaining() {
        let key = take_cstring(&mut body).ok_or(InvalidReason::OptionsMalformed)?;
        let value = take_cstring(&mut body).ok_or(InvalidReason::OptionsMalformed)?;
        options.insert(key, value);
    }

    Ok(ReadWriteRequest {
        filename,
        mode,
        options,
    })
}

/// Split a NUL-terminated string off the front of `buf`
///
/// Returns `None` (leaving `buf` untouched) when no terminator is present.
fn take_cstring(buf: &mut &[u8]) -> Option<String> {
    let null_pos = buf.iter().position(|&b| b == 0)?;
    let text = String::from_utf8_lossy(&buf[..null_pos]).into_owned();
    buf.advance(null_pos + 1); // Skip the null terminator
    Some(text)
}

fn put_cstring(packet: &mut BytesMut, text: &str) {
    packet.put_slice(text.as_bytes());
    packet.put_u8(0);
}
