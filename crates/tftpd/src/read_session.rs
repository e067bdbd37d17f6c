//! Block-transfer state machine for one read request
//!
//! A session walks its data source one block at a time, sending each block
//! only after the client acknowledged the previous one. It never runs on its
//! own: every call comes from the owning timeout controller's event loop.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::outgoing::OutgoingHandler;
use crate::packet::ErrorCode;
use crate::safe_packets::{SafeAck, SafeData, SafeError};

/// What a session did with an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack matched; the next block was read and sent
    Advanced,
    /// The ack was for the previous block; the current block was sent again
    Resent,
    /// The final block was acknowledged; the transfer is over
    Finished,
    /// The ack matched neither the current nor the previous block
    Ignored,
}

impl AckOutcome {
    /// Whether the ack proves the client is alive and following the transfer
    pub fn is_accepted(&self) -> bool {
        !matches!(self, AckOutcome::Ignored)
    }
}

#[async_trait]
pub trait ReadSession: Send {
    /// Read and send the first block
    async fn begin(&mut self) -> Result<()>;

    async fn handle_ack(&mut self, ack: &SafeAck) -> Result<AckOutcome>;

    /// Send the current block again without changing state
    async fn resend(&mut self) -> Result<()>;
}

/// [`ReadSession`] over any async byte source
///
/// RFC 1350: a transfer ends with the first block shorter than the block
/// size. When the source length is an exact multiple of the block size the
/// last block is empty.
pub struct BlockReadSession<R> {
    source: R,
    outgoing: Arc<dyn OutgoingHandler>,
    peer: SocketAddr,
    block_size: usize,
    current: Option<SafeData>,
    exhausted: bool,
}

impl<R> BlockReadSession<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(
        source: R,
        outgoing: Arc<dyn OutgoingHandler>,
        peer: SocketAddr,
        block_size: usize,
    ) -> Self {
        Self {
            source,
            outgoing,
            peer,
            block_size,
            current: None,
            exhausted: false,
        }
    }

    /// Block number of the most recent send, 0 before `begin`
    pub fn block_number(&self) -> u16 {
        self.current.as_ref().map_or(0, SafeData::block_number)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fill one block, looping over short reads until the source ends
    async fn read_block(&mut self) -> std::io::Result<Bytes> {
        let mut block = BytesMut::zeroed(self.block_size);
        let mut filled = 0;

        while filled < self.block_size {
            let n = self.source.read(&mut block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        block.truncate(filled);
        Ok(block.freeze())
    }

    /// Read the block numbered `block_number` and send it
    async fn send_next(&mut self, block_number: u16) -> Result<()> {
        let payload = match self.read_block().await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Read error for {} at block {}: {}", self.peer, block_number, e);
                let reply = SafeError::new(ErrorCode::Undefined, "Read error");
                if let Err(send_err) = self.outgoing.send_error(&reply).await {
                    debug!("Failed to report read error to {}: {}", self.peer, send_err);
                }
                return Err(TftpError::Io(e));
            }
        };

        if payload.len() < self.block_size {
            self.exhausted = true;
        }

        let data = SafeData::new(block_number, payload);
        self.outgoing.send_data(&data).await?;
        self.current = Some(data);
        Ok(())
    }
}

#[async_trait]
impl<R> ReadSession for BlockReadSession<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn begin(&mut self) -> Result<()> {
        // Block 0 belongs to the request itself; data starts at 1
        self.send_next(1).await
    }

    async fn handle_ack(&mut self, ack: &SafeAck) -> Result<AckOutcome> {
        let Some(current) = self.current.as_ref() else {
            warn!("ACK {} from {} before transfer began", ack.block_number(), self.peer);
            return Ok(AckOutcome::Ignored);
        };
        let current_block = current.block_number();

        if ack.block_number() == current_block {
            if self.exhausted {
                return Ok(AckOutcome::Finished);
            }
            self.send_next(current_block.wrapping_add(1)).await?;
            Ok(AckOutcome::Advanced)
        } else if ack.block_number() == current_block.wrapping_sub(1) {
            debug!(
                "Duplicate ACK {} from {}, resending block {}",
                ack.block_number(),
                self.peer,
                current_block
            );
            self.resend().await?;
            Ok(AckOutcome::Resent)
        } else {
            warn!(
                "Ignoring out-of-sequence ACK {} from {} (current block {})",
                ack.block_number(),
                self.peer,
                current_block
            );
            Ok(AckOutcome::Ignored)
        }
    }

    async fn resend(&mut self) -> Result<()> {
        match self.current.as_ref() {
            Some(data) => self.outgoing.send_data(data).await,
            None => Err(TftpError::Tftp("resend before transfer began".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outgoing::Responder;
    use crate::packet::{Data, ErrorPacket, Packet};
    use crate::test_support::RecordingTransport;
    use std::io::{self, Cursor};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn peer() -> SocketAddr {
        "192.0.2.10:3001".parse().unwrap()
    }

    fn session<R>(
        source: R,
        block_size: usize,
    ) -> (BlockReadSession<R>, Arc<RecordingTransport>)
    where
        R: AsyncRead + Unpin + Send,
    {
        let transport = Arc::new(RecordingTransport::new());
        let responder = Arc::new(Responder::new(transport.clone(), peer()));
        (
            BlockReadSession::new(source, responder, peer(), block_size),
            transport,
        )
    }

    fn data(block_number: u16, payload: &'static [u8]) -> Packet {
        Packet::Data(Data {
            block_number,
            payload: Bytes::from_static(payload),
        })
    }

    /// Yields at most one byte per read
    struct Trickle(Cursor<Vec<u8>>);

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let mut byte = [0u8; 1];
            let mut one = ReadBuf::new(&mut byte);
            match Pin::new(&mut self.0).poll_read(cx, &mut one) {
                Poll::Ready(Ok(())) => {
                    buf.put_slice(one.filled());
                    Poll::Ready(Ok(()))
                }
                other => other,
            }
        }
    }

    /// Serves `good` bytes, then fails
    struct FailAfter {
        good: usize,
    }

    impl AsyncRead for FailAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.good == 0 {
                return Poll::Ready(Err(io::Error::other("disk gone")));
            }
            let n = self.good.min(buf.remaining());
            buf.put_slice(&vec![b'x'; n]);
            self.good -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn foobar_with_block_size_two() {
        let (mut session, transport) = session(Cursor::new(b"foobar".to_vec()), 2);

        session.begin().await.unwrap();
        assert_eq!(session.handle_ack(&SafeAck::new(1)).await.unwrap(), AckOutcome::Advanced);
        assert_eq!(session.handle_ack(&SafeAck::new(1)).await.unwrap(), AckOutcome::Resent);
        assert_eq!(session.handle_ack(&SafeAck::new(2)).await.unwrap(), AckOutcome::Advanced);
        assert_eq!(session.handle_ack(&SafeAck::new(2)).await.unwrap(), AckOutcome::Resent);
        assert_eq!(session.handle_ack(&SafeAck::new(3)).await.unwrap(), AckOutcome::Advanced);
        assert!(session.is_exhausted());
        assert_eq!(session.handle_ack(&SafeAck::new(4)).await.unwrap(), AckOutcome::Finished);

        assert_eq!(
            transport.sent_to(peer()),
            vec![
                data(1, b"fo"),
                data(2, b"ob"),
                data(2, b"ob"),
                data(3, b"ar"),
                data(3, b"ar"),
                data(4, b""),
            ]
        );
    }

    #[tokio::test]
    async fn short_final_block_finishes_without_empty_block() {
        let (mut session, transport) = session(Cursor::new(b"hello".to_vec()), 2);

        session.begin().await.unwrap();
        session.handle_ack(&SafeAck::new(1)).await.unwrap();
        session.handle_ack(&SafeAck::new(2)).await.unwrap();
        assert!(session.is_exhausted());
        assert_eq!(session.handle_ack(&SafeAck::new(3)).await.unwrap(), AckOutcome::Finished);

        let sent = transport.sent_to(peer());
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], data(3, b"o"));
    }

    #[tokio::test]
    async fn empty_source_sends_one_empty_block() {
        let (mut session, transport) = session(Cursor::new(Vec::new()), 512);

        session.begin().await.unwrap();
        assert!(session.is_exhausted());
        assert_eq!(session.block_number(), 1);
        assert_eq!(transport.sent_to(peer()), vec![data(1, b"")]);
        assert_eq!(session.handle_ack(&SafeAck::new(1)).await.unwrap(), AckOutcome::Finished);
    }

    #[tokio::test]
    async fn ack_zero_resends_first_block() {
        let (mut session, transport) = session(Cursor::new(b"abc".to_vec()), 2);

        session.begin().await.unwrap();
        assert_eq!(session.handle_ack(&SafeAck::new(0)).await.unwrap(), AckOutcome::Resent);
        assert_eq!(transport.sent_to(peer()), vec![data(1, b"ab"), data(1, b"ab")]);
    }

    #[tokio::test]
    async fn out_of_sequence_acks_change_nothing() {
        let (mut session, transport) = session(Cursor::new(b"abcdef".to_vec()), 2);

        session.begin().await.unwrap();
        session.handle_ack(&SafeAck::new(1)).await.unwrap();
        session.handle_ack(&SafeAck::new(2)).await.unwrap();

        for stale in [1, 7, 65535] {
            assert_eq!(
                session.handle_ack(&SafeAck::new(stale)).await.unwrap(),
                AckOutcome::Ignored
            );
        }
        assert_eq!(session.block_number(), 3);
        assert_eq!(transport.sent_to(peer()).len(), 3);
    }

    #[tokio::test]
    async fn resend_repeats_exact_bytes() {
        let (mut session, transport) = session(Cursor::new(b"abcdef".to_vec()), 4);

        session.begin().await.unwrap();
        session.resend().await.unwrap();
        session.resend().await.unwrap();

        let raw = transport.sent();
        assert_eq!(raw.len(), 3);
        assert!(raw.iter().all(|(_, bytes)| *bytes == raw[0].1));
        assert_eq!(session.block_number(), 1);
    }

    #[tokio::test]
    async fn short_reads_still_fill_whole_blocks() {
        let source = Trickle(Cursor::new(b"abcdefg".to_vec()));
        let (mut session, transport) = session(source, 4);

        session.begin().await.unwrap();
        assert!(!session.is_exhausted());
        session.handle_ack(&SafeAck::new(1)).await.unwrap();
        assert!(session.is_exhausted());

        assert_eq!(
            transport.sent_to(peer()),
            vec![data(1, b"abcd"), data(2, b"efg")]
        );
    }

    #[tokio::test]
    async fn read_error_reports_undefined_and_fails() {
        let (mut session, transport) = session(FailAfter { good: 2 }, 2);

        session.begin().await.unwrap();
        let err = session.handle_ack(&SafeAck::new(1)).await.unwrap_err();
        assert!(matches!(err, TftpError::Io(_)));

        let sent = transport.sent_to(peer());
        assert_eq!(
            sent.last(),
            Some(&Packet::Error(ErrorPacket {
                code: ErrorCode::Undefined,
                message: "Read error".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn block_numbers_wrap() {
        let (mut session, transport) = session(Cursor::new(vec![7u8; 24]), 8);
        session.begin().await.unwrap();
        session.current = Some(SafeData::new(u16::MAX, Bytes::from_static(b"xxxxxxxx")));

        assert_eq!(
            session.handle_ack(&SafeAck::new(u16::MAX)).await.unwrap(),
            AckOutcome::Advanced
        );
        assert_eq!(session.block_number(), 0);
        assert_eq!(
            session.handle_ack(&SafeAck::new(u16::MAX)).await.unwrap(),
            AckOutcome::Resent
        );
        assert_eq!(transport.sent_to(peer()).len(), 3);
    }

    #[tokio::test]
    async fn ack_before_begin_is_ignored() {
        let (mut session, transport) = session(Cursor::new(b"abc".to_vec()), 2);
        assert_eq!(session.handle_ack(&SafeAck::new(0)).await.unwrap(), AckOutcome::Ignored);
        assert!(session.resend().await.is_err());
        assert!(transport.sent().is_empty());
    }
}
