//! ACIP handshake: an explicit state machine driving the X25519 key
//! exchange, optional identity and password authentication, and the
//! transition into the encrypted channel.
//!
//! Both drivers fail closed: any parse failure, signature failure or
//! incompatible version moves to [`HandshakeState::Failed`] and the
//! connection is torn down without retry.

pub mod client;
pub mod server;

use bytes::Bytes;
use thiserror::Error;

use crate::crypto::{CryptoError, DirectionCipher};
use crate::framing::Packet;
use crate::messages::{ErrorCode, ErrorPayload, PacketType, WireError};
use crate::transport::{Transport, TransportError};

pub use client::ClientHandshake;
pub use server::ServerHandshake;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed handshake payload: {0}")]
    Wire(#[from] WireError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("incompatible protocol version {remote}")]
    IncompatibleVersion { remote: u16 },
    #[error("peer identity rejected: {0}")]
    IdentityRejected(String),
    #[error("host key mismatch for {host}:{port}")]
    HostKeyMismatch { host: String, port: u16 },
    #[error("password rejected")]
    PasswordRejected,
    #[error("encryption policy violation: {0}")]
    Policy(String),
    #[error("handshake deadline exceeded")]
    Timeout,
    #[error("peer reported: {0}")]
    Remote(ErrorPayload),
}

impl HandshakeError {
    /// Wire error code reported to the peer when the channel allows it.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HandshakeError::Transport(TransportError::Timeout(_)) | HandshakeError::Timeout => {
                ErrorCode::NetworkTimeout
            }
            HandshakeError::Transport(_) => ErrorCode::Network,
            HandshakeError::Wire(_) | HandshakeError::Protocol(_) => ErrorCode::ProtocolViolation,
            HandshakeError::Crypto(CryptoError::AuthFail) => ErrorCode::CryptoAuthFailed,
            HandshakeError::Crypto(_) => ErrorCode::CryptoHandshakeFailed,
            HandshakeError::IncompatibleVersion { .. } => ErrorCode::IncompatibleVersion,
            HandshakeError::IdentityRejected(_) | HandshakeError::HostKeyMismatch { .. } => {
                ErrorCode::CryptoAuthFailed
            }
            HandshakeError::PasswordRejected => ErrorCode::InvalidPassword,
            HandshakeError::Policy(_) => ErrorCode::EncryptionPolicyViolation,
            HandshakeError::Remote(payload) => payload.code,
        }
    }
}

/// Handshake progress. Transitions not listed in [`HandshakeState::transition`]
/// are protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AwaitKeyExchange,
    AwaitAuth,
    Authenticating,
    Ready,
    Failed,
}

impl HandshakeState {
    pub fn transition(self, next: HandshakeState) -> Result<HandshakeState, HandshakeError> {
        use HandshakeState::*;
        let legal = matches!(
            (self, next),
            (Init, AwaitKeyExchange)
                | (AwaitKeyExchange, AwaitAuth)
                | (AwaitAuth, Authenticating)
                | (AwaitAuth, Ready)
                | (Authenticating, Ready)
                | (_, Failed)
        );
        if legal {
            Ok(next)
        } else {
            Err(HandshakeError::Protocol(format!(
                "illegal handshake transition {self:?} -> {next:?}"
            )))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Ready | HandshakeState::Failed)
    }
}

/// Established per-connection cipher state.
///
/// The channel is owned by a single worker pair: nonces advance strictly
/// in send/receive order, so counters can never race.
pub struct SecureChannel {
    send: DirectionCipher,
    recv: DirectionCipher,
    encrypt: bool,
}

impl SecureChannel {
    pub fn new(send: DirectionCipher, recv: DirectionCipher, encrypt: bool) -> Self {
        Self {
            send,
            recv,
            encrypt,
        }
    }

    /// Plaintext mode for sessions negotiated without encryption.
    pub fn plaintext(send: DirectionCipher, recv: DirectionCipher) -> Self {
        Self::new(send, recv, false)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    /// Seals a payload into a wire packet.
    pub fn seal_packet(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        client_id: u32,
    ) -> Result<Packet, CryptoError> {
        let body = if self.encrypt {
            Bytes::from(self.send.seal(payload)?)
        } else {
            Bytes::copy_from_slice(payload)
        };
        Ok(Packet::new(packet_type.as_u16(), client_id, body))
    }

    /// Opens a received packet's payload.
    pub fn open_packet(&mut self, packet: &Packet) -> Result<Bytes, CryptoError> {
        if self.encrypt {
            Ok(Bytes::from(self.recv.open(&packet.payload)?))
        } else {
            Ok(packet.payload.clone())
        }
    }

    /// True when the send direction has crossed its rekey high-water mark.
    pub fn needs_rekey(&self) -> bool {
        self.encrypt && self.send.needs_rekey()
    }

    /// Splits into the per-worker halves.
    pub fn into_halves(self) -> (DirectionCipher, DirectionCipher, bool) {
        (self.send, self.recv, self.encrypt)
    }

    pub fn install_send(&mut self, cipher: DirectionCipher) {
        self.send = cipher;
    }

    pub fn install_recv(&mut self, cipher: DirectionCipher) {
        self.recv = cipher;
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("encrypt", &self.encrypt)
            .finish_non_exhaustive()
    }
}

/// What a completed handshake yields to the session layer.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub channel: SecureChannel,
    pub client_id: u32,
    pub peer_name: String,
    pub peer_capabilities: u32,
    pub peer_identity: Option<crate::crypto::identity::IdentityKey>,
}

/// Reads the next frame and rejects anything but the expected type,
/// surfacing peer-reported errors.
pub(crate) async fn expect_frame<T: Transport + ?Sized>(
    transport: &mut T,
    expected: PacketType,
) -> Result<Packet, HandshakeError> {
    let packet = transport.recv_frame().await?;
    if packet.packet_type == PacketType::Error.as_u16() {
        let payload = ErrorPayload::decode(packet.payload.clone())?;
        return Err(HandshakeError::Remote(payload));
    }
    if packet.packet_type != expected.as_u16() {
        return Err(HandshakeError::Protocol(format!(
            "expected {:?}, got packet type {}",
            expected, packet.packet_type
        )));
    }
    Ok(packet)
}

/// Best-effort error notification before teardown. Encrypted once the
/// channel exists, plaintext before key agreement, skipped on failure.
pub(crate) async fn send_error<T: Transport + ?Sized>(
    transport: &mut T,
    channel: Option<&mut SecureChannel>,
    code: ErrorCode,
    message: &str,
) {
    let payload = ErrorPayload::new(code, message).encode();
    let packet = match channel {
        Some(channel) => match channel.seal_packet(PacketType::Error, &payload, 0) {
            Ok(packet) => packet,
            Err(_) => return,
        },
        None => Packet::new(PacketType::Error.as_u16(), 0, payload),
    };
    let _ = transport.send_frame(&packet).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_path_reaches_ready() {
        let state = HandshakeState::Init;
        let state = state.transition(HandshakeState::AwaitKeyExchange).unwrap();
        let state = state.transition(HandshakeState::AwaitAuth).unwrap();
        let state = state.transition(HandshakeState::Authenticating).unwrap();
        let state = state.transition(HandshakeState::Ready).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn auth_may_be_skipped() {
        let state = HandshakeState::AwaitAuth;
        assert!(state.transition(HandshakeState::Ready).is_ok());
    }

    #[test]
    fn illegal_transitions_are_violations() {
        assert!(HandshakeState::Init
            .transition(HandshakeState::Ready)
            .is_err());
        assert!(HandshakeState::Ready
            .transition(HandshakeState::AwaitAuth)
            .is_err());
        assert!(HandshakeState::Authenticating
            .transition(HandshakeState::AwaitKeyExchange)
            .is_err());
    }

    #[test]
    fn any_state_may_fail() {
        for state in [
            HandshakeState::Init,
            HandshakeState::AwaitKeyExchange,
            HandshakeState::AwaitAuth,
            HandshakeState::Authenticating,
            HandshakeState::Ready,
        ] {
            assert_eq!(
                state.transition(HandshakeState::Failed).unwrap(),
                HandshakeState::Failed
            );
        }
    }
}
