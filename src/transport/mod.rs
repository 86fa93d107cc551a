//! Pluggable frame transports.
//!
//! The protocol layer holds only the [`Transport`] trait: a TCP socket and a
//! WebRTC data channel satisfy the same contract. Implementations guarantee
//! that `send_frame` either transmits the whole frame or fails fatally, and
//! that `recv_frame` yields complete frames only.

pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;

use crate::config::Timeouts;
use crate::framing::{self, BufferPool, FrameError, Packet};

/// Cap on a single write syscall; larger frames go out in chunks.
pub const WRITE_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Eof,
    #[error("i/o timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport already closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The capability surface the protocol layer depends on.
#[async_trait]
pub trait Transport: Send {
    async fn send_frame(&mut self, packet: &Packet) -> Result<(), TransportError>;
    async fn recv_frame(&mut self) -> Result<Packet, TransportError>;
    fn is_connected(&self) -> bool;
    /// Human-readable peer label for logging.
    fn peer_label(&self) -> String;
}

/// Reads complete frames from any byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    pool: BufferPool,
    io_timeout: Duration,
    connected: bool,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(reader: R, io_timeout: Duration) -> Self {
        Self {
            reader,
            pool: BufferPool::new(),
            io_timeout,
            connected: true,
        }
    }

    /// Reads one full frame, honoring the per-call timeout.
    pub async fn read_packet(&mut self) -> Result<Packet, TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        let result = timeout(self.io_timeout, framing::read_packet(&mut self.reader, &self.pool))
            .await
            .map_err(|_| {
                self.connected = false;
                TransportError::Timeout(self.io_timeout)
            })?;
        match result {
            Ok(packet) => Ok(packet),
            Err(FrameError::ShortRead) => {
                self.connected = false;
                Err(TransportError::Eof)
            }
            Err(err) => {
                self.connected = false;
                Err(err.into())
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Writes whole frames to any byte stream, chunked at [`WRITE_CHUNK`].
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
    io_timeout: Duration,
    connected: bool,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W, io_timeout: Duration) -> Self {
        Self {
            writer,
            io_timeout,
            connected: true,
        }
    }

    /// Sends the entire frame or fails fatally; partial writes are retried
    /// inside `write_all` under the per-chunk timeout.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        let wire = packet.encode();
        for chunk in wire.chunks(WRITE_CHUNK) {
            match timeout(self.io_timeout, self.writer.write_all(chunk)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.connected = false;
                    return Err(err.into());
                }
                Err(_) => {
                    self.connected = false;
                    return Err(TransportError::Timeout(self.io_timeout));
                }
            }
        }
        match timeout(self.io_timeout, self.writer.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.connected = false;
                Err(err.into())
            }
            Err(_) => {
                self.connected = false;
                Err(TransportError::Timeout(self.io_timeout))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Drops the writer, closing the underlying half if it owns one.
    pub async fn shutdown(&mut self) {
        self.connected = false;
        let _ = self.writer.shutdown().await;
    }
}

/// A [`Transport`] over any full-duplex byte stream.
#[derive(Debug)]
pub struct StreamTransport<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    label: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamTransport<S> {
    pub fn new(stream: S, timeouts: &Timeouts, label: impl Into<String>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read, timeouts.io),
            writer: FrameWriter::new(write, timeouts.io),
            label: label.into(),
        }
    }

    /// Splits into the worker-pair halves: the receive worker owns the
    /// reader, the send worker owns the writer.
    pub fn into_split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for StreamTransport<S> {
    async fn send_frame(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.writer.write_packet(packet).await
    }

    async fn recv_frame(&mut self) -> Result<Packet, TransportError> {
        self.reader.read_packet().await
    }

    fn is_connected(&self) -> bool {
        self.reader.is_connected() && self.writer.is_connected()
    }

    fn peer_label(&self) -> String {
        self.label.clone()
    }
}

/// In-memory transport pair for tests and loopback runs.
pub fn duplex_pair(
    timeouts: &Timeouts,
) -> (
    StreamTransport<tokio::io::DuplexStream>,
    StreamTransport<tokio::io::DuplexStream>,
) {
    let (a, b) = tokio::io::duplex(framing::MAX_PAYLOAD + framing::HEADER_LEN);
    (
        StreamTransport::new(a, timeouts, "duplex:a"),
        StreamTransport::new(b, timeouts, "duplex:b"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn timeouts() -> Timeouts {
        Timeouts::testing()
    }

    #[tokio::test]
    async fn frames_cross_a_duplex_pair() {
        let (mut a, mut b) = duplex_pair(&timeouts());
        let packet = Packet::new(18, 4, Bytes::from_static(b"ping-nonce"));
        a.send_frame(&packet).await.unwrap();
        let got = b.recv_frame().await.unwrap();
        assert_eq!(got, packet);
    }

    #[tokio::test]
    async fn large_frames_survive_chunked_writes() {
        let (mut a, mut b) = duplex_pair(&timeouts());
        let payload = Bytes::from(vec![0xAB; WRITE_CHUNK * 3 + 17]);
        let packet = Packet::new(15, 1, payload.clone());
        let send = tokio::spawn(async move {
            a.send_frame(&packet).await.unwrap();
            a
        });
        let got = b.recv_frame().await.unwrap();
        send.await.unwrap();
        assert_eq!(got.payload, payload);
    }

    #[tokio::test]
    async fn recv_times_out_on_silence() {
        let (_a, mut b) = duplex_pair(&timeouts());
        let err = b.recv_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(!b.is_connected());
    }

    #[tokio::test]
    async fn recv_reports_eof_when_peer_drops() {
        let (a, mut b) = duplex_pair(&timeouts());
        drop(a);
        let err = b.recv_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::Eof));
    }
}
