//! Client side of the ACIP handshake.

use tokio::time::timeout;
use tracing::debug;

use super::{expect_frame, HandshakeError, HandshakeOutcome, HandshakeState, SecureChannel};
use crate::config::Timeouts;
use crate::crypto::identity::{HostCheck, IdentityKey, KnownHosts, NodeCredentials};
use crate::crypto::{derive_session_keys, Role, X25519KeyExchange};
use crate::messages::{
    AuthResponse, ClientHello, HandshakeComplete, KeyExchangeInit, KeyExchangeResp, PacketType,
    AUTH_METHOD_PASSWORD, HELLO_FLAG_ENCRYPT, KEX_FLAG_IDENTITY_PRESENT,
    KEX_FLAG_IDENTITY_REQUESTED, PROTOCOL_VERSION,
};
use crate::transport::Transport;

/// Drives the connecting side of the handshake.
pub struct ClientHandshake {
    pub display_name: String,
    pub capabilities: u32,
    /// Ask the server for an encrypted session. Servers that enforce
    /// encryption reject hellos without it.
    pub encrypt: bool,
    /// Identity credentials, required when the server demands a signature.
    pub credentials: Option<NodeCredentials>,
    /// Password offered if the server issues an AUTH_CHALLENGE.
    pub password: Option<String>,
    /// Trust store for the server's identity key.
    pub known_hosts: Option<KnownHosts>,
    /// Host/port under which the server key is recorded.
    pub server_host: String,
    pub server_port: u16,
    pub timeouts: Timeouts,
}

impl ClientHandshake {
    /// Runs the handshake to READY under the configured deadline.
    pub async fn run<T: Transport + ?Sized>(
        mut self,
        transport: &mut T,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        match timeout(self.timeouts.handshake, self.drive(transport)).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Timeout),
        }
    }

    async fn drive<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let mut state = HandshakeState::Init;

        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            capabilities: self.capabilities,
            flags: if self.encrypt { HELLO_FLAG_ENCRYPT } else { 0 },
            display_name: self.display_name.clone(),
        };
        transport
            .send_frame(&crate::framing::Packet::new(
                PacketType::ClientHello.as_u16(),
                0,
                hello.encode(),
            ))
            .await?;
        state = state.transition(HandshakeState::AwaitKeyExchange)?;

        let packet = expect_frame(transport, PacketType::KeyExchangeInit).await?;
        let kex = KeyExchangeInit::decode(packet.payload)?;

        let server_identity = self.verify_server_identity(&kex)?;

        let exchange = X25519KeyExchange::new();
        let client_ephemeral = exchange.public_bytes();
        let identity_requested = kex.flags & KEX_FLAG_IDENTITY_REQUESTED != 0;

        let mut resp = KeyExchangeResp {
            flags: 0,
            client_ephemeral,
            client_identity: [0; 32],
            signature: [0; 64],
        };
        if identity_requested {
            let creds = self.credentials.as_ref().ok_or_else(|| {
                HandshakeError::Policy("server requires an identity key".into())
            })?;
            let mut message = Vec::with_capacity(96);
            message.extend_from_slice(&client_ephemeral);
            message.extend_from_slice(&kex.server_ephemeral);
            message.extend_from_slice(&kex.challenge_nonce);
            resp.flags |= KEX_FLAG_IDENTITY_PRESENT;
            resp.client_identity = creds.public_bytes();
            resp.signature = creds.sign(&message).to_bytes();
        }
        transport
            .send_frame(&crate::framing::Packet::new(
                PacketType::KeyExchangeResp.as_u16(),
                0,
                resp.encode(),
            ))
            .await?;

        let shared = exchange.derive_shared(&kex.server_ephemeral);
        let keys = derive_session_keys(&shared, &client_ephemeral, &kex.server_ephemeral);
        let (send, recv) = keys.into_ciphers(Role::Client);
        let mut channel = SecureChannel::new(send, recv, self.encrypt);
        state = state.transition(HandshakeState::AwaitAuth)?;

        // The server now speaks through the channel: either completion or
        // an authentication challenge.
        let packet = transport.recv_frame().await?;
        let packet_type = packet.packet_type;
        let payload = channel.open_packet(&packet)?;

        let complete = if packet_type == PacketType::AuthChallenge.as_u16() {
            state = state.transition(HandshakeState::Authenticating)?;
            let challenge = crate::messages::AuthChallenge::decode(payload)?;
            if challenge.method != AUTH_METHOD_PASSWORD {
                return Err(HandshakeError::Protocol(format!(
                    "unsupported auth method {}",
                    challenge.method
                )));
            }
            let password = self
                .password
                .as_ref()
                .ok_or(HandshakeError::PasswordRejected)?;
            let response = AuthResponse {
                method: AUTH_METHOD_PASSWORD,
                proof: bytes::Bytes::copy_from_slice(password.as_bytes()),
            };
            let sealed = channel.seal_packet(PacketType::AuthResponse, &response.encode(), 0)?;
            transport.send_frame(&sealed).await?;

            let packet = transport.recv_frame().await?;
            let packet_type = packet.packet_type;
            let payload = channel.open_packet(&packet)?;
            self.expect_complete(packet_type, payload)?
        } else {
            self.expect_complete(packet_type, payload)?
        };

        state.transition(HandshakeState::Ready)?;
        debug!(
            client_id = complete.client_id,
            encrypted = channel.is_encrypted(),
            "handshake ready"
        );
        Ok(HandshakeOutcome {
            channel,
            client_id: complete.client_id,
            peer_name: String::new(),
            peer_capabilities: 0,
            peer_identity: server_identity,
        })
    }

    fn expect_complete(
        &self,
        packet_type: u16,
        payload: bytes::Bytes,
    ) -> Result<HandshakeComplete, HandshakeError> {
        if packet_type == PacketType::Error.as_u16() {
            let err = crate::messages::ErrorPayload::decode(payload)?;
            return Err(HandshakeError::Remote(err));
        }
        if packet_type != PacketType::HandshakeComplete.as_u16() {
            return Err(HandshakeError::Protocol(format!(
                "expected HANDSHAKE_COMPLETE, got packet type {packet_type}"
            )));
        }
        Ok(HandshakeComplete::decode(payload)?)
    }

    /// Verifies the server's signature and checks its key against the
    /// known-hosts store; first contact records the key.
    fn verify_server_identity(
        &mut self,
        kex: &KeyExchangeInit,
    ) -> Result<Option<IdentityKey>, HandshakeError> {
        if kex.flags & KEX_FLAG_IDENTITY_PRESENT == 0 {
            return Ok(None);
        }
        let key = IdentityKey(kex.server_identity);
        let mut message = Vec::with_capacity(64);
        message.extend_from_slice(&kex.server_ephemeral);
        message.extend_from_slice(&kex.challenge_nonce);
        if !key.verify(&message, &kex.server_signature) {
            return Err(HandshakeError::IdentityRejected(
                "server signature invalid".into(),
            ));
        }

        if KnownHosts::enforcement_disabled() {
            return Ok(Some(key));
        }
        if let Some(hosts) = self.known_hosts.as_mut() {
            match hosts.check(&self.server_host, self.server_port, &key) {
                HostCheck::Known => {}
                HostCheck::Unknown => {
                    // Trust on first use.
                    hosts
                        .record(&self.server_host, self.server_port, key)
                        .map_err(|e| HandshakeError::IdentityRejected(e.to_string()))?;
                }
                HostCheck::Mismatch => {
                    return Err(HandshakeError::HostKeyMismatch {
                        host: self.server_host.clone(),
                        port: self.server_port,
                    });
                }
            }
        }
        Ok(Some(key))
    }
}
