//! ACIP frame codec: length-prefixed packets carrying a magic, type tag,
//! payload CRC32 and the originating client id.
//!
//! Decoding is streaming: the header is read first, then exactly `length`
//! payload bytes, and the CRC is verified before the packet is handed to any
//! handler. The decoder never peeks beyond the declared frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Leading magic of every ACIP frame.
pub const MAGIC: [u8; 8] = *b"ASCIICHT";
/// Fixed header size: magic (8) + type (2) + length (4) + CRC32 (4) + client id (4).
pub const HEADER_LEN: usize = 22;
/// Hard cap on a single payload.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Payloads at or above this size have their CRC computed on the blocking pool.
const CRC_OFFLOAD_THRESHOLD: usize = 256 * 1024;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad magic")]
    BadMagic,
    #[error("payload length {0} exceeds the 16 MiB frame cap")]
    LengthExceeded(u64),
    #[error("checksum mismatch: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("short read inside a frame")]
    ShortRead,
    #[error("io: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ShortRead
        } else {
            FrameError::Io(err)
        }
    }
}

/// A decoded ACIP frame. The payload is reference-counted so fan-out clones
/// are cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u16,
    pub client_id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: u16, client_id: u32, payload: Bytes) -> Self {
        Self {
            packet_type,
            client_id,
            payload,
        }
    }

    /// Serializes the packet into a single wire buffer.
    pub fn encode(&self) -> Bytes {
        encode(self.packet_type, &self.payload, self.client_id)
    }
}

/// Encodes one frame: header followed by the payload.
pub fn encode(packet_type: u16, payload: &[u8], client_id: u32) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u16(packet_type);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32fast::hash(payload));
    buf.put_u32(client_id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Parsed header fields, prior to payload arrival.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub packet_type: u16,
    pub length: u32,
    pub checksum: u32,
    pub client_id: u32,
}

/// Validates and splits a raw 22-byte header.
pub fn parse_header(raw: &[u8; HEADER_LEN]) -> Result<Header, FrameError> {
    let mut buf = &raw[..];
    let mut magic = [0u8; 8];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(FrameError::BadMagic);
    }
    let packet_type = buf.get_u16();
    let length = buf.get_u32();
    if length as usize > MAX_PAYLOAD {
        return Err(FrameError::LengthExceeded(length as u64));
    }
    Ok(Header {
        packet_type,
        length,
        checksum: buf.get_u32(),
        client_id: buf.get_u32(),
    })
}

/// Verifies the payload against the header checksum, offloading large
/// payloads to the blocking pool so receive workers stay responsive.
pub async fn verify_checksum(header: &Header, payload: &Bytes) -> Result<(), FrameError> {
    let actual = if payload.len() >= CRC_OFFLOAD_THRESHOLD {
        let shared = payload.clone();
        tokio::task::spawn_blocking(move || crc32fast::hash(&shared))
            .await
            .map_err(|e| FrameError::Io(std::io::Error::other(e)))?
    } else {
        crc32fast::hash(payload)
    };
    if actual != header.checksum {
        return Err(FrameError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    Ok(())
}

/// Reads exactly one frame from the stream.
pub async fn read_packet<R>(reader: &mut R, pool: &BufferPool) -> Result<Packet, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    let header = parse_header(&raw)?;

    let mut payload = pool.take(header.length as usize);
    payload.resize(header.length as usize, 0);
    reader.read_exact(&mut payload[..]).await?;
    let payload = payload.freeze();

    verify_checksum(&header, &payload).await?;
    Ok(Packet {
        packet_type: header.packet_type,
        client_id: header.client_id,
        payload,
    })
}

/// Small freelist of payload buffers. Media frames arrive at a steady rate,
/// so recycling buffers keeps the allocator out of the hot path.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

const POOL_MAX_BUFFERS: usize = 32;
const POOL_MAX_CAPACITY: usize = 4 * 1024 * 1024;

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a cleared buffer with at least `capacity` bytes reserved.
    pub fn take(&self, capacity: usize) -> BytesMut {
        let mut free = self.free.lock();
        if let Some(pos) = free.iter().position(|b| b.capacity() >= capacity) {
            let mut buf = free.swap_remove(pos);
            buf.clear();
            return buf;
        }
        drop(free);
        BytesMut::with_capacity(capacity)
    }

    /// Returns a buffer to the pool once its refcount-backed views are gone.
    pub fn recycle(&self, buf: BytesMut) {
        if buf.capacity() == 0 || buf.capacity() > POOL_MAX_CAPACITY {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < POOL_MAX_BUFFERS {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet_type: u16, client_id: u32, payload: &[u8]) -> Packet {
        let wire = encode(packet_type, payload, client_id);
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&wire[..HEADER_LEN]);
        let header = parse_header(&raw).unwrap();
        assert_eq!(header.length as usize, payload.len());
        Packet {
            packet_type: header.packet_type,
            client_id: header.client_id,
            payload: wire.slice(HEADER_LEN..),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let packet = roundtrip(15, 7, b"pixels");
        assert_eq!(packet.packet_type, 15);
        assert_eq!(packet.client_id, 7);
        assert_eq!(&packet.payload[..], b"pixels");
    }

    #[test]
    fn zero_length_payload_roundtrips() {
        let packet = roundtrip(18, 0, b"");
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn crc_field_matches_payload_hash() {
        let wire = encode(15, b"frame-data", 3);
        let crc = u32::from_be_bytes(wire[14..18].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(b"frame-data"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let wire = encode(18, b"", 0);
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&wire[..HEADER_LEN]);
        raw[0] = b'X';
        assert!(matches!(parse_header(&raw), Err(FrameError::BadMagic)));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut raw = [0u8; HEADER_LEN];
        raw[..8].copy_from_slice(&MAGIC);
        raw[10..14].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
        assert!(matches!(
            parse_header(&raw),
            Err(FrameError::LengthExceeded(_))
        ));
    }

    #[test]
    fn max_length_is_accepted() {
        let mut raw = [0u8; HEADER_LEN];
        raw[..8].copy_from_slice(&MAGIC);
        raw[10..14].copy_from_slice(&(MAX_PAYLOAD as u32).to_be_bytes());
        let header = parse_header(&raw).unwrap();
        assert_eq!(header.length as usize, MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn streaming_decode_detects_corruption() {
        let mut wire = encode(15, b"some image bits", 1).to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let pool = BufferPool::new();
        let err = read_packet(&mut wire.as_slice(), &pool).await.unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn streaming_decode_detects_truncation() {
        let wire = encode(15, b"some image bits", 1);
        let truncated = &wire[..wire.len() - 4];
        let pool = BufferPool::new();
        let err = read_packet(&mut &truncated[..], &pool).await.unwrap_err();
        assert!(matches!(err, FrameError::ShortRead));
    }

    #[test]
    fn pool_recycles_buffers() {
        let pool = BufferPool::new();
        let mut buf = pool.take(1024);
        buf.put_slice(&[1, 2, 3]);
        let cap = buf.capacity();
        pool.recycle(buf);
        let again = pool.take(512);
        assert!(again.capacity() >= 512);
        assert_eq!(again.capacity(), cap);
        assert!(again.is_empty());
    }
}
