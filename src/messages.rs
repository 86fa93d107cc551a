//! ACIP packet catalog and fixed-layout payload codecs.
//!
//! Every multi-byte integer is big-endian on the wire. Payload structs
//! round-trip through `encode`/`decode`; decoding is strict and rejects
//! truncated or malformed input with [`WireError`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Types at or above this value are reserved for forward-compatible
/// extensions and are silently ignored when unknown.
pub const EXTENSION_TYPE_FLOOR: u16 = 0x8000;

/// Capability bits advertised in CLIENT_HELLO and CLIENT_JOIN.
pub const CAP_VIDEO: u32 = 1 << 0;
pub const CAP_AUDIO: u32 = 1 << 1;
pub const CAP_VIDEO_ENCODING: u32 = 1 << 2;

/// Subscription bits used by STREAM_START / STREAM_STOP.
pub const SUB_VIDEO: u32 = 1 << 0;
pub const SUB_AUDIO: u32 = 1 << 1;

/// Hello flag: the client asks for an encrypted session. Servers that
/// enforce encryption reject hellos without it.
pub const HELLO_FLAG_ENCRYPT: u8 = 1 << 0;

/// Key-exchange flags.
pub const KEX_FLAG_IDENTITY_REQUESTED: u8 = 1 << 0;
pub const KEX_FLAG_IDENTITY_PRESENT: u8 = 1 << 1;

/// Typed packet catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    ProtocolVersion = 1,
    ClientHello = 2,
    KeyExchangeInit = 3,
    KeyExchangeResp = 4,
    AuthChallenge = 5,
    AuthResponse = 6,
    HandshakeComplete = 7,
    RekeyRequest = 8,
    RekeyResponse = 9,
    ClientJoin = 10,
    ClientLeave = 11,
    ClientCapabilities = 12,
    StreamStart = 13,
    StreamStop = 14,
    ImageFrame = 15,
    AudioBatch = 16,
    AudioOpusBatch = 17,
    Ping = 18,
    Pong = 19,
    Error = 20,
    SessionCreate = 21,
    SessionCreated = 22,
    SessionJoin = 23,
    SessionJoined = 24,
}

impl PacketType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        use PacketType::*;
        Some(match raw {
            1 => ProtocolVersion,
            2 => ClientHello,
            3 => KeyExchangeInit,
            4 => KeyExchangeResp,
            5 => AuthChallenge,
            6 => AuthResponse,
            7 => HandshakeComplete,
            8 => RekeyRequest,
            9 => RekeyResponse,
            10 => ClientJoin,
            11 => ClientLeave,
            12 => ClientCapabilities,
            13 => StreamStart,
            14 => StreamStop,
            15 => ImageFrame,
            16 => AudioBatch,
            17 => AudioOpusBatch,
            18 => Ping,
            19 => Pong,
            20 => Error,
            21 => SessionCreate,
            22 => SessionCreated,
            23 => SessionJoin,
            24 => SessionJoined,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Media packets are the fan-out payloads.
    pub fn is_media(self) -> bool {
        matches!(
            self,
            PacketType::ImageFrame | PacketType::AudioBatch | PacketType::AudioOpusBatch
        )
    }

    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::ProtocolVersion
                | PacketType::ClientHello
                | PacketType::KeyExchangeInit
                | PacketType::KeyExchangeResp
                | PacketType::AuthChallenge
                | PacketType::AuthResponse
                | PacketType::HandshakeComplete
        )
    }

    /// The stream kind a media packet belongs to.
    pub fn stream_kind(self) -> Option<StreamKind> {
        match self {
            PacketType::ImageFrame => Some(StreamKind::Video),
            PacketType::AudioBatch | PacketType::AudioOpusBatch => Some(StreamKind::Audio),
            _ => None,
        }
    }
}

/// Kinds of media streams a client can publish or subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn subscription_bit(self) -> u32 {
        match self {
            StreamKind::Video => SUB_VIDEO,
            StreamKind::Audio => SUB_AUDIO,
        }
    }
}

/// Wire-level error codes carried by ERROR packets and discovery replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0,
    InvalidParam = 1,
    Network = 2,
    NetworkTimeout = 3,
    ProtocolViolation = 4,
    BadMagic = 5,
    ChecksumMismatch = 6,
    CryptoHandshakeFailed = 7,
    CryptoAuthFailed = 8,
    EncryptionPolicyViolation = 9,
    RateLimited = 10,
    InvalidPassword = 11,
    SessionNotFound = 12,
    SessionFull = 13,
    ResourceExhausted = 14,
    IncompatibleVersion = 15,
    Internal = 16,
    IpWithheld = 17,
}

impl ErrorCode {
    pub fn from_u16(raw: u16) -> Self {
        use ErrorCode::*;
        match raw {
            0 => None,
            1 => InvalidParam,
            2 => Network,
            3 => NetworkTimeout,
            4 => ProtocolViolation,
            5 => BadMagic,
            6 => ChecksumMismatch,
            7 => CryptoHandshakeFailed,
            8 => CryptoAuthFailed,
            9 => EncryptionPolicyViolation,
            10 => RateLimited,
            11 => InvalidPassword,
            12 => SessionNotFound,
            13 => SessionFull,
            14 => ResourceExhausted,
            15 => IncompatibleVersion,
            17 => IpWithheld,
            _ => Internal,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::None => "NONE",
            ErrorCode::InvalidParam => "INVALID_PARAM",
            ErrorCode::Network => "NETWORK",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::BadMagic => "BAD_MAGIC",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::CryptoHandshakeFailed => "CRYPTO_HANDSHAKE_FAILED",
            ErrorCode::CryptoAuthFailed => "CRYPTO_AUTH_FAILED",
            ErrorCode::EncryptionPolicyViolation => "ENCRYPTION_POLICY_VIOLATION",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidPassword => "INVALID_PASSWORD",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionFull => "SESSION_FULL",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::IncompatibleVersion => "INCOMPATIBLE_VERSION",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::IpWithheld => "IP_WITHHELD",
        };
        f.write_str(name)
    }
}

/// Errors raised while decoding payload layouts.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("trailing garbage after payload")]
    TrailingBytes,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),
    #[error("unknown tag {value} for {field}")]
    UnknownTag { field: &'static str, value: u32 },
}

fn need(buf: &Bytes, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn take_array<const N: usize>(buf: &mut Bytes) -> Result<[u8; N], WireError> {
    need(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn put_short_str(buf: &mut BytesMut, value: &str) {
    debug_assert!(value.len() <= u8::MAX as usize);
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
}

fn get_short_str(buf: &mut Bytes) -> Result<String, WireError> {
    let len = get_u8(buf)? as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

fn put_wide_bytes(buf: &mut BytesMut, value: &[u8]) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn get_wide_bytes(buf: &mut Bytes) -> Result<Bytes, WireError> {
    let len = get_u16(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn finish(buf: Bytes) -> Result<(), WireError> {
    if buf.has_remaining() {
        Err(WireError::TrailingBytes)
    } else {
        Ok(())
    }
}

/// Standalone version probe and the version echo inside CLIENT_HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersionPayload {
    pub version: u16,
}

impl ProtocolVersionPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u16(self.version);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let version = get_u16(&mut buf)?;
        finish(buf)?;
        Ok(Self { version })
    }
}

/// First packet of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub protocol_version: u16,
    pub capabilities: u32,
    pub flags: u8,
    pub display_name: String,
}

impl ClientHello {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.display_name.len());
        buf.put_u16(self.protocol_version);
        buf.put_u32(self.capabilities);
        buf.put_u8(self.flags);
        put_short_str(&mut buf, &self.display_name);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let protocol_version = get_u16(&mut buf)?;
        let capabilities = get_u32(&mut buf)?;
        let flags = get_u8(&mut buf)?;
        let display_name = get_short_str(&mut buf)?;
        finish(buf)?;
        Ok(Self {
            protocol_version,
            capabilities,
            flags,
            display_name,
        })
    }

    pub fn wants_encryption(&self) -> bool {
        self.flags & HELLO_FLAG_ENCRYPT != 0
    }
}

/// Server half of the key exchange. Identity fields are zeroed when the
/// server runs anonymously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeInit {
    pub flags: u8,
    pub server_ephemeral: [u8; 32],
    pub server_identity: [u8; 32],
    pub challenge_nonce: [u8; 32],
    pub server_signature: [u8; 64],
}

impl KeyExchangeInit {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 32 * 3 + 64);
        buf.put_u8(self.flags);
        buf.put_slice(&self.server_ephemeral);
        buf.put_slice(&self.server_identity);
        buf.put_slice(&self.challenge_nonce);
        buf.put_slice(&self.server_signature);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let flags = get_u8(&mut buf)?;
        let server_ephemeral = take_array(&mut buf)?;
        let server_identity = take_array(&mut buf)?;
        let challenge_nonce = take_array(&mut buf)?;
        let server_signature = take_array(&mut buf)?;
        finish(buf)?;
        Ok(Self {
            flags,
            server_ephemeral,
            server_identity,
            challenge_nonce,
            server_signature,
        })
    }
}

/// Client half of the key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeResp {
    pub flags: u8,
    pub client_ephemeral: [u8; 32],
    pub client_identity: [u8; 32],
    pub signature: [u8; 64],
}

impl KeyExchangeResp {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 32 * 2 + 64);
        buf.put_u8(self.flags);
        buf.put_slice(&self.client_ephemeral);
        buf.put_slice(&self.client_identity);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let flags = get_u8(&mut buf)?;
        let client_ephemeral = take_array(&mut buf)?;
        let client_identity = take_array(&mut buf)?;
        let signature = take_array(&mut buf)?;
        finish(buf)?;
        Ok(Self {
            flags,
            client_ephemeral,
            client_identity,
            signature,
        })
    }
}

/// Authentication methods for AUTH_CHALLENGE / AUTH_RESPONSE.
pub const AUTH_METHOD_PASSWORD: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub method: u8,
    pub nonce: [u8; 32],
}

impl AuthChallenge {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(33);
        buf.put_u8(self.method);
        buf.put_slice(&self.nonce);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let method = get_u8(&mut buf)?;
        let nonce = take_array(&mut buf)?;
        finish(buf)?;
        Ok(Self { method, nonce })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub method: u8,
    pub proof: Bytes,
}

impl AuthResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.proof.len());
        buf.put_u8(self.method);
        put_wide_bytes(&mut buf, &self.proof);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let method = get_u8(&mut buf)?;
        let proof = get_wide_bytes(&mut buf)?;
        finish(buf)?;
        Ok(Self { method, proof })
    }
}

/// Terminates the handshake and assigns the joining client its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeComplete {
    pub client_id: u32,
}

impl HandshakeComplete {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(self.client_id);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let client_id = get_u32(&mut buf)?;
        finish(buf)?;
        Ok(Self { client_id })
    }
}

/// Fresh ephemeral public key for an in-channel rekey. The same layout
/// serves REKEY_REQUEST and REKEY_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyExchange {
    pub ephemeral: [u8; 32],
}

impl RekeyExchange {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.ephemeral)
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let ephemeral = take_array(&mut buf)?;
        finish(buf)?;
        Ok(Self { ephemeral })
    }
}

/// Server-broadcast announcement of a joined peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientJoin {
    pub client_id: u32,
    pub capabilities: u32,
    pub display_name: String,
}

impl ClientJoin {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.display_name.len());
        buf.put_u32(self.client_id);
        buf.put_u32(self.capabilities);
        put_short_str(&mut buf, &self.display_name);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let client_id = get_u32(&mut buf)?;
        let capabilities = get_u32(&mut buf)?;
        let display_name = get_short_str(&mut buf)?;
        finish(buf)?;
        Ok(Self {
            client_id,
            capabilities,
            display_name,
        })
    }
}

/// Departure notice, client-sent (graceful) or server-synthesized (timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLeave {
    pub client_id: u32,
    pub reason: ErrorCode,
}

impl ClientLeave {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u32(self.client_id);
        buf.put_u16(self.reason.as_u16());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let client_id = get_u32(&mut buf)?;
        let reason = ErrorCode::from_u16(get_u16(&mut buf)?);
        finish(buf)?;
        Ok(Self { client_id, reason })
    }
}

/// Capability update after join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub client_id: u32,
    pub capabilities: u32,
}

impl ClientCapabilities {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.client_id);
        buf.put_u32(self.capabilities);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let client_id = get_u32(&mut buf)?;
        let capabilities = get_u32(&mut buf)?;
        finish(buf)?;
        Ok(Self {
            client_id,
            capabilities,
        })
    }
}

/// Subscription change: which stream kinds the sender wants delivered.
/// The same layout serves STREAM_START (subscribe) and STREAM_STOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSubscription {
    pub kinds: u32,
}

impl StreamSubscription {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(self.kinds);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let kinds = get_u32(&mut buf)?;
        finish(buf)?;
        Ok(Self { kinds })
    }
}

/// Pixel encodings negotiated via capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PixelFormat {
    Rgb24 = 1,
    Yuv420 = 2,
    /// Opaque codec-encoded blob (e.g. H.264 NAL units).
    Encoded = 3,
}

impl PixelFormat {
    pub fn from_u32(raw: u32) -> Result<Self, WireError> {
        Ok(match raw {
            1 => PixelFormat::Rgb24,
            2 => PixelFormat::Yuv420,
            3 => PixelFormat::Encoded,
            other => {
                return Err(WireError::UnknownTag {
                    field: "pixel_format",
                    value: other,
                })
            }
        })
    }
}

/// One video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub compressed_size: u32,
    pub timestamp: u64,
    pub checksum: u32,
    pub pixels: Bytes,
}

impl ImageFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(28 + self.pixels.len());
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(self.pixel_format as u32);
        buf.put_u32(self.compressed_size);
        buf.put_u64(self.timestamp);
        buf.put_u32(self.checksum);
        buf.put_slice(&self.pixels);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let width = get_u32(&mut buf)?;
        let height = get_u32(&mut buf)?;
        let pixel_format = PixelFormat::from_u32(get_u32(&mut buf)?)?;
        let compressed_size = get_u32(&mut buf)?;
        let timestamp = get_u64(&mut buf)?;
        let checksum = get_u32(&mut buf)?;
        let pixels = buf;
        Ok(Self {
            width,
            height,
            pixel_format,
            compressed_size,
            timestamp,
            checksum,
            pixels,
        })
    }
}

/// Raw PCM audio batch: interleaved big-endian i16 samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBatch {
    pub sample_rate: u32,
    pub channels: u8,
    pub samples: Vec<i16>,
}

impl AudioBatch {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.samples.len() * 2);
        buf.put_u32(self.sample_rate);
        buf.put_u8(self.channels);
        buf.put_u32(self.samples.len() as u32);
        for sample in &self.samples {
            buf.put_i16(*sample);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let sample_rate = get_u32(&mut buf)?;
        let channels = get_u8(&mut buf)?;
        let count = get_u32(&mut buf)? as usize;
        need(&buf, count * 2)?;
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            samples.push(buf.get_i16());
        }
        finish(buf)?;
        Ok(Self {
            sample_rate,
            channels,
            samples,
        })
    }
}

/// Batch of length-prefixed Opus packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioOpusBatch {
    pub sample_rate: u32,
    pub channels: u8,
    pub packets: Vec<Bytes>,
}

impl AudioOpusBatch {
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.packets.len() <= u16::MAX as usize);
        let body: usize = self.packets.iter().map(|p| 2 + p.len()).sum();
        let mut buf = BytesMut::with_capacity(7 + body);
        buf.put_u32(self.sample_rate);
        buf.put_u8(self.channels);
        buf.put_u16(self.packets.len() as u16);
        for packet in &self.packets {
            put_wide_bytes(&mut buf, packet);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let sample_rate = get_u32(&mut buf)?;
        let channels = get_u8(&mut buf)?;
        let count = get_u16(&mut buf)? as usize;
        let mut packets = Vec::with_capacity(count);
        for _ in 0..count {
            packets.push(get_wide_bytes(&mut buf)?);
        }
        finish(buf)?;
        Ok(Self {
            sample_rate,
            channels,
            packets,
        })
    }
}

/// Heartbeat probe; PONG echoes the nonce back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

impl Ping {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.nonce);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let nonce = get_u64(&mut buf)?;
        finish(buf)?;
        Ok(Self { nonce })
    }
}

/// Maximum UTF-8 message length inside an ERROR payload.
pub const ERROR_MESSAGE_MAX: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code, self.message)
    }
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > ERROR_MESSAGE_MAX {
            message.truncate(ERROR_MESSAGE_MAX);
            while !message.is_char_boundary(message.len()) {
                message.pop();
            }
        }
        Self { code, message }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.message.len());
        buf.put_u16(self.code.as_u16());
        put_short_str(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let code = ErrorCode::from_u16(get_u16(&mut buf)?);
        let message = get_short_str(&mut buf)?;
        finish(buf)?;
        Ok(Self { code, message })
    }
}

/// Discovery session kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum SessionType {
    DirectTcp = 1,
    WebRtc = 2,
}

impl SessionType {
    pub fn from_u8(raw: u8) -> Result<Self, WireError> {
        Ok(match raw {
            1 => SessionType::DirectTcp,
            2 => SessionType::WebRtc,
            other => {
                return Err(WireError::UnknownTag {
                    field: "session_type",
                    value: other as u32,
                })
            }
        })
    }
}

/// Host request to register a session with the discovery registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreate {
    pub session_type: SessionType,
    pub capabilities: u32,
    pub max_participants: u16,
    pub server_addr: String,
    pub server_port: u16,
    pub expose_ip: bool,
    /// Argon2id PHC string; empty when the session has no password.
    pub password_hash: String,
}

impl SessionCreate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            12 + self.server_addr.len() + self.password_hash.len(),
        );
        buf.put_u8(self.session_type as u8);
        buf.put_u32(self.capabilities);
        buf.put_u16(self.max_participants);
        put_short_str(&mut buf, &self.server_addr);
        buf.put_u16(self.server_port);
        buf.put_u8(self.expose_ip as u8);
        put_wide_bytes(&mut buf, self.password_hash.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let session_type = SessionType::from_u8(get_u8(&mut buf)?)?;
        let capabilities = get_u32(&mut buf)?;
        let max_participants = get_u16(&mut buf)?;
        let server_addr = get_short_str(&mut buf)?;
        let server_port = get_u16(&mut buf)?;
        let expose_ip = get_u8(&mut buf)? != 0;
        let password_hash = String::from_utf8(get_wide_bytes(&mut buf)?.to_vec())
            .map_err(|_| WireError::InvalidUtf8)?;
        finish(buf)?;
        Ok(Self {
            session_type,
            capabilities,
            max_participants,
            server_addr,
            server_port,
            expose_ip,
            password_hash,
        })
    }
}

/// Registry reply to SESSION_CREATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreated {
    pub error: ErrorCode,
    pub session_string: String,
    pub ttl_secs: u32,
}

impl SessionCreated {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(7 + self.session_string.len());
        buf.put_u16(self.error.as_u16());
        put_short_str(&mut buf, &self.session_string);
        buf.put_u32(self.ttl_secs);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let error = ErrorCode::from_u16(get_u16(&mut buf)?);
        let session_string = get_short_str(&mut buf)?;
        let ttl_secs = get_u32(&mut buf)?;
        finish(buf)?;
        Ok(Self {
            error,
            session_string,
            ttl_secs,
        })
    }
}

/// Joiner request to resolve a session string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionJoin {
    pub session_string: String,
    pub password: String,
}

impl SessionJoin {
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(3 + self.session_string.len() + self.password.len());
        put_short_str(&mut buf, &self.session_string);
        put_wide_bytes(&mut buf, self.password.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let session_string = get_short_str(&mut buf)?;
        let password = String::from_utf8(get_wide_bytes(&mut buf)?.to_vec())
            .map_err(|_| WireError::InvalidUtf8)?;
        finish(buf)?;
        Ok(Self {
            session_string,
            password,
        })
    }
}

/// Registry reply to SESSION_JOIN. Contact fields are zeroed whenever the
/// disclosure rule withholds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionJoined {
    pub success: bool,
    pub error: ErrorCode,
    pub session_type: SessionType,
    pub server_addr: String,
    pub server_port: u16,
    pub turn_username: String,
    pub turn_password: String,
}

impl SessionJoined {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            11 + self.server_addr.len() + self.turn_username.len() + self.turn_password.len(),
        );
        buf.put_u8(self.success as u8);
        buf.put_u16(self.error.as_u16());
        buf.put_u8(self.session_type as u8);
        put_short_str(&mut buf, &self.server_addr);
        buf.put_u16(self.server_port);
        put_wide_bytes(&mut buf, self.turn_username.as_bytes());
        put_wide_bytes(&mut buf, self.turn_password.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let success = get_u8(&mut buf)? != 0;
        let error = ErrorCode::from_u16(get_u16(&mut buf)?);
        let session_type = SessionType::from_u8(get_u8(&mut buf)?)?;
        let server_addr = get_short_str(&mut buf)?;
        let server_port = get_u16(&mut buf)?;
        let turn_username = String::from_utf8(get_wide_bytes(&mut buf)?.to_vec())
            .map_err(|_| WireError::InvalidUtf8)?;
        let turn_password = String::from_utf8(get_wide_bytes(&mut buf)?.to_vec())
            .map_err(|_| WireError::InvalidUtf8)?;
        finish(buf)?;
        Ok(Self {
            success,
            error,
            session_type,
            server_addr,
            server_port,
            turn_username,
            turn_password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_roundtrip() {
        for raw in 1u16..=24 {
            let ty = PacketType::from_u16(raw).unwrap();
            assert_eq!(ty.as_u16(), raw);
        }
        assert!(PacketType::from_u16(0).is_none());
        assert!(PacketType::from_u16(25).is_none());
        assert!(PacketType::from_u16(0x8001).is_none());
    }

    #[test]
    fn media_types_map_to_stream_kinds() {
        assert_eq!(
            PacketType::ImageFrame.stream_kind(),
            Some(StreamKind::Video)
        );
        assert_eq!(
            PacketType::AudioOpusBatch.stream_kind(),
            Some(StreamKind::Audio)
        );
        assert_eq!(PacketType::Ping.stream_kind(), None);
    }

    #[test]
    fn client_hello_roundtrip() {
        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            capabilities: CAP_VIDEO | CAP_AUDIO,
            flags: HELLO_FLAG_ENCRYPT,
            display_name: "zfogg".into(),
        };
        let decoded = ClientHello::decode(hello.encode()).unwrap();
        assert_eq!(decoded, hello);
        assert!(decoded.wants_encryption());
    }

    #[test]
    fn key_exchange_roundtrip() {
        let init = KeyExchangeInit {
            flags: KEX_FLAG_IDENTITY_REQUESTED,
            server_ephemeral: [1; 32],
            server_identity: [2; 32],
            challenge_nonce: [3; 32],
            server_signature: [4; 64],
        };
        assert_eq!(KeyExchangeInit::decode(init.encode()).unwrap(), init);

        let resp = KeyExchangeResp {
            flags: KEX_FLAG_IDENTITY_PRESENT,
            client_ephemeral: [5; 32],
            client_identity: [6; 32],
            signature: [7; 64],
        };
        assert_eq!(KeyExchangeResp::decode(resp.encode()).unwrap(), resp);
    }

    #[test]
    fn image_frame_roundtrip() {
        let frame = ImageFrame {
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::Rgb24,
            compressed_size: 6,
            timestamp: 123_456_789,
            checksum: 0xDEADBEEF,
            pixels: Bytes::from_static(b"pixels"),
        };
        assert_eq!(ImageFrame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn image_frame_rejects_unknown_format() {
        let mut frame = ImageFrame {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgb24,
            compressed_size: 0,
            timestamp: 0,
            checksum: 0,
            pixels: Bytes::new(),
        }
        .encode()
        .to_vec();
        frame[8..12].copy_from_slice(&9u32.to_be_bytes());
        assert!(matches!(
            ImageFrame::decode(Bytes::from(frame)),
            Err(WireError::UnknownTag { .. })
        ));
    }

    #[test]
    fn audio_batches_roundtrip() {
        let pcm = AudioBatch {
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0, -1, 32_000, -32_000],
        };
        assert_eq!(AudioBatch::decode(pcm.encode()).unwrap(), pcm);

        let opus = AudioOpusBatch {
            sample_rate: 48_000,
            channels: 1,
            packets: vec![Bytes::from_static(b"opus0"), Bytes::from_static(b"opus1")],
        };
        assert_eq!(AudioOpusBatch::decode(opus.encode()).unwrap(), opus);
    }

    #[test]
    fn error_payload_truncates_long_messages() {
        let long = "x".repeat(400);
        let payload = ErrorPayload::new(ErrorCode::RateLimited, long);
        assert_eq!(payload.message.len(), ERROR_MESSAGE_MAX);
        let decoded = ErrorPayload::decode(payload.encode()).unwrap();
        assert_eq!(decoded.code, ErrorCode::RateLimited);
    }

    #[test]
    fn session_messages_roundtrip() {
        let create = SessionCreate {
            session_type: SessionType::WebRtc,
            capabilities: CAP_VIDEO,
            max_participants: 8,
            server_addr: "192.168.1.100".into(),
            server_port: 27224,
            expose_ip: true,
            password_hash: String::new(),
        };
        assert_eq!(SessionCreate::decode(create.encode()).unwrap(), create);

        let joined = SessionJoined {
            success: true,
            error: ErrorCode::None,
            session_type: SessionType::DirectTcp,
            server_addr: String::new(),
            server_port: 0,
            turn_username: String::new(),
            turn_password: String::new(),
        };
        assert_eq!(SessionJoined::decode(joined.encode()).unwrap(), joined);
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        let hello = ClientHello {
            protocol_version: 1,
            capabilities: 0,
            flags: 0,
            display_name: "abc".into(),
        }
        .encode();
        let cut = hello.slice(..hello.len() - 2);
        assert!(matches!(
            ClientHello::decode(cut),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut raw = Ping { nonce: 1 }.encode().to_vec();
        raw.push(0);
        assert!(matches!(
            Ping::decode(Bytes::from(raw)),
            Err(WireError::TrailingBytes)
        ));
    }
}
