//! Server side of the ACIP handshake.

use rand::RngCore;
use tokio::time::timeout;
use tracing::debug;

use super::{
    expect_frame, send_error, HandshakeError, HandshakeOutcome, HandshakeState, SecureChannel,
};
use crate::config::Timeouts;
use crate::crypto::identity::{IdentityKey, NodeCredentials};
use crate::crypto::{derive_session_keys, verify_password, Role, X25519KeyExchange};
use crate::framing::Packet;
use crate::messages::{
    AuthChallenge, AuthResponse, ClientHello, HandshakeComplete, KeyExchangeInit, KeyExchangeResp,
    PacketType, AUTH_METHOD_PASSWORD, KEX_FLAG_IDENTITY_PRESENT, KEX_FLAG_IDENTITY_REQUESTED,
    PROTOCOL_VERSION,
};
use crate::transport::Transport;

/// Drives the accepting side of the handshake.
pub struct ServerHandshake {
    /// Server identity for host authentication; anonymous when absent.
    pub credentials: Option<NodeCredentials>,
    /// Demand a signed client identity.
    pub require_client_identity: bool,
    /// Identity keys accepted when client identity is required. Empty
    /// means any key with a valid signature is admitted.
    pub authorized_keys: Vec<IdentityKey>,
    /// Argon2id PHC string gating the session, if password-protected.
    pub password_hash: Option<String>,
    /// Refuse clients that do not request encryption.
    pub require_encryption: bool,
    /// Id assigned to this client on completion.
    pub assigned_id: u32,
    pub timeouts: Timeouts,
}

impl ServerHandshake {
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

        let packet = expect_frame(transport, PacketType::ClientHello).await?;
        let hello = ClientHello::decode(packet.payload)?;
        if hello.protocol_version != PROTOCOL_VERSION {
            let err = HandshakeError::IncompatibleVersion {
                remote: hello.protocol_version,
            };
            send_error(transport, None, err.error_code(), "unsupported version").await;
            return Err(err);
        }
        let encrypt = hello.wants_encryption();
        if self.require_encryption && !encrypt {
            let err = HandshakeError::Policy("server requires encryption".into());
            send_error(transport, None, err.error_code(), "encryption required").await;
            return Err(err);
        }
        state = state.transition(HandshakeState::AwaitKeyExchange)?;

        let exchange = X25519KeyExchange::new();
        let server_ephemeral = exchange.public_bytes();
        let mut challenge_nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut challenge_nonce);

        let mut init = KeyExchangeInit {
            flags: 0,
            server_ephemeral,
            server_identity: [0; 32],
            challenge_nonce,
            server_signature: [0; 64],
        };
        if self.require_client_identity {
            init.flags |= KEX_FLAG_IDENTITY_REQUESTED;
        }
        if let Some(creds) = &self.credentials {
            let mut message = Vec::with_capacity(64);
            message.extend_from_slice(&server_ephemeral);
            message.extend_from_slice(&challenge_nonce);
            init.flags |= KEX_FLAG_IDENTITY_PRESENT;
            init.server_identity = creds.public_bytes();
            init.server_signature = creds.sign(&message).to_bytes();
        }
        transport
            .send_frame(&Packet::new(
                PacketType::KeyExchangeInit.as_u16(),
                0,
                init.encode(),
            ))
            .await?;

        let packet = expect_frame(transport, PacketType::KeyExchangeResp).await?;
        let resp = KeyExchangeResp::decode(packet.payload)?;
        let peer_identity = self.verify_client_identity(&resp, &server_ephemeral, &challenge_nonce)?;

        let shared = exchange.derive_shared(&resp.client_ephemeral);
        let keys = derive_session_keys(&shared, &resp.client_ephemeral, &server_ephemeral);
        let (send, recv) = keys.into_ciphers(Role::Server);
        let mut channel = SecureChannel::new(send, recv, encrypt);
        state = state.transition(HandshakeState::AwaitAuth)?;

        if let Some(stored) = self.password_hash.clone() {
            state = state.transition(HandshakeState::Authenticating)?;
            if let Err(err) = self.password_gate(transport, &mut channel, &stored).await {
                send_error(
                    transport,
                    Some(&mut channel),
                    err.error_code(),
                    "authentication failed",
                )
                .await;
                return Err(err);
            }
        }

        let complete = HandshakeComplete {
            client_id: self.assigned_id,
        };
        let sealed = channel.seal_packet(PacketType::HandshakeComplete, &complete.encode(), 0)?;
        transport.send_frame(&sealed).await?;
        state.transition(HandshakeState::Ready)?;

        debug!(
            client_id = self.assigned_id,
            name = %hello.display_name,
            encrypted = channel.is_encrypted(),
            "handshake ready"
        );
        Ok(HandshakeOutcome {
            channel,
            client_id: self.assigned_id,
            peer_name: hello.display_name,
            peer_capabilities: hello.capabilities,
            peer_identity,
        })
    }

    async fn password_gate<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        channel: &mut SecureChannel,
        stored: &str,
    ) -> Result<(), HandshakeError> {
        let mut nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let challenge = AuthChallenge {
            method: AUTH_METHOD_PASSWORD,
            nonce,
        };
        let sealed = channel.seal_packet(PacketType::AuthChallenge, &challenge.encode(), 0)?;
        transport.send_frame(&sealed).await?;

        let packet = transport.recv_frame().await?;
        if packet.packet_type != PacketType::AuthResponse.as_u16() {
            return Err(HandshakeError::Protocol(format!(
                "expected AUTH_RESPONSE, got packet type {}",
                packet.packet_type
            )));
        }
        let payload = channel.open_packet(&packet)?;
        let response = AuthResponse::decode(payload)?;
        if response.method != AUTH_METHOD_PASSWORD {
            return Err(HandshakeError::Protocol("auth method mismatch".into()));
        }
        let offered = std::str::from_utf8(&response.proof)
            .map_err(|_| HandshakeError::PasswordRejected)?;
        if !verify_password(offered, stored) {
            return Err(HandshakeError::PasswordRejected);
        }
        Ok(())
    }

    fn verify_client_identity(
        &self,
        resp: &KeyExchangeResp,
        server_ephemeral: &[u8; 32],
        challenge_nonce: &[u8; 32],
    ) -> Result<Option<IdentityKey>, HandshakeError> {
        if !self.require_client_identity {
            return Ok(None);
        }
        if resp.flags & KEX_FLAG_IDENTITY_PRESENT == 0 {
            return Err(HandshakeError::IdentityRejected(
                "client identity required but absent".into(),
            ));
        }
        let key = IdentityKey(resp.client_identity);
        let mut message = Vec::with_capacity(96);
        message.extend_from_slice(&resp.client_ephemeral);
        message.extend_from_slice(server_ephemeral);
        message.extend_from_slice(challenge_nonce);
        if !key.verify(&message, &resp.signature) {
            return Err(HandshakeError::IdentityRejected(
                "client signature invalid".into(),
            ));
        }
        if !self.authorized_keys.is_empty() && !self.authorized_keys.contains(&key) {
            return Err(HandshakeError::IdentityRejected(
                "client key not in trust store".into(),
            ));
        }
        Ok(Some(key))
    }
}
