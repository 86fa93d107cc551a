//! Client helper for the ACDS discovery service.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::Timeouts;
use crate::crypto::hash_password;
use crate::framing::Packet;
use crate::messages::{
    ErrorCode, PacketType, SessionCreate, SessionCreated, SessionJoin, SessionJoined, SessionType,
    WireError,
};
use crate::transport::{tcp, Transport, TransportError};

#[derive(Debug, Error)]
pub enum DiscoveryClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed reply: {0}")]
    Wire(#[from] WireError),
    #[error("registry refused: {0}")]
    Refused(ErrorCode),
    #[error("unexpected reply packet type {0}")]
    UnexpectedReply(u16),
}

/// Parameters for registering a hosted session.
#[derive(Debug, Clone)]
pub struct HostAnnouncement {
    pub session_type: SessionType,
    pub capabilities: u32,
    pub max_participants: u16,
    pub server_addr: String,
    pub server_port: u16,
    pub expose_ip: bool,
    /// Hashed client-side; the registry only ever sees the PHC string.
    pub password: Option<String>,
}

/// Stateless client for SESSION_CREATE / SESSION_JOIN exchanges.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    service_addr: SocketAddr,
    timeouts: Timeouts,
}

impl DiscoveryClient {
    pub fn new(service_addr: SocketAddr, timeouts: Timeouts) -> Self {
        Self {
            service_addr,
            timeouts,
        }
    }

    /// Registers a session and returns the reply with its session string.
    pub async fn create(
        &self,
        announcement: HostAnnouncement,
    ) -> Result<SessionCreated, DiscoveryClientError> {
        let request = SessionCreate {
            session_type: announcement.session_type,
            capabilities: announcement.capabilities,
            max_participants: announcement.max_participants,
            server_addr: announcement.server_addr,
            server_port: announcement.server_port,
            expose_ip: announcement.expose_ip,
            password_hash: announcement
                .password
                .as_deref()
                .map(hash_password)
                .unwrap_or_default(),
        };
        let reply = self
            .round_trip(PacketType::SessionCreate, request.encode())
            .await?;
        if reply.packet_type != PacketType::SessionCreated.as_u16() {
            return Err(DiscoveryClientError::UnexpectedReply(reply.packet_type));
        }
        let created = SessionCreated::decode(reply.payload)?;
        if created.error != ErrorCode::None {
            return Err(DiscoveryClientError::Refused(created.error));
        }
        Ok(created)
    }

    /// Resolves a session string, offering a password when one is needed.
    pub async fn join(
        &self,
        session_string: &str,
        password: Option<&str>,
    ) -> Result<SessionJoined, DiscoveryClientError> {
        let request = SessionJoin {
            session_string: session_string.to_string(),
            password: password.unwrap_or_default().to_string(),
        };
        let reply = self
            .round_trip(PacketType::SessionJoin, request.encode())
            .await?;
        if reply.packet_type != PacketType::SessionJoined.as_u16() {
            return Err(DiscoveryClientError::UnexpectedReply(reply.packet_type));
        }
        let joined = SessionJoined::decode(reply.payload)?;
        if !joined.success {
            return Err(DiscoveryClientError::Refused(joined.error));
        }
        Ok(joined)
    }

    async fn round_trip(
        &self,
        packet_type: PacketType,
        payload: bytes::Bytes,
    ) -> Result<Packet, DiscoveryClientError> {
        let mut transport = tcp::connect(self.service_addr, &self.timeouts).await?;
        transport
            .send_frame(&Packet::new(packet_type.as_u16(), 0, payload))
            .await?;
        Ok(transport.recv_frame().await?)
    }
}
