//! The ACDS daemon: a TCP accept loop speaking SESSION_* ACIP packets
//! against the shared registry, with per-IP rate limiting.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::framing::Packet;
use crate::messages::{
    ErrorCode, ErrorPayload, PacketType, SessionCreate, SessionCreated, SessionJoin,
    SessionJoined, SessionType, EXTENSION_TYPE_FLOOR,
};
use crate::session::{Decision, EventKind, RateConfig, RateLimiter, Subject};
use crate::transport::{tcp, Transport, TransportError};

use super::{CreateRequest, Registry};

/// How often expired records are swept.
const EXPIRY_SWEEP_DIVISOR: u32 = 10;

pub struct DiscoveryService {
    registry: Arc<Registry>,
    limiter: Arc<RateLimiter>,
    timeouts: Timeouts,
    cancel: CancellationToken,
}

impl DiscoveryService {
    pub fn new(registry: Arc<Registry>, timeouts: Timeouts) -> Arc<Self> {
        Arc::new(Self {
            registry,
            limiter: Arc::new(RateLimiter::new(RateConfig::default())),
            timeouts,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Serves discovery requests until cancelled.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let sweeper = tokio::spawn(self.clone().sweep_expired());
        info!(
            target: "asciichat::discovery",
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "discovery service listening"
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(target: "asciichat::discovery", error = %err, "accept failed");
                            continue;
                        }
                    };
                    tokio::spawn(self.clone().handle_connection(stream, addr));
                }
            }
        }
        sweeper.abort();
        Ok(())
    }

    async fn sweep_expired(self: Arc<Self>) {
        let period = super::DEFAULT_TTL / EXPIRY_SWEEP_DIVISOR;
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.registry.expire_sessions();
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut transport = match tcp::from_stream(stream, &self.timeouts) {
            Ok(transport) => transport,
            Err(_) => return,
        };
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = transport.recv_frame() => match result {
                    Ok(packet) => packet,
                    Err(TransportError::Eof) | Err(TransportError::Timeout(_)) => break,
                    Err(_) => break,
                }
            };

            let raw_type = packet.packet_type;
            let reply = match PacketType::from_u16(raw_type) {
                Some(PacketType::SessionCreate) => {
                    match self.limiter.check(Subject::Ip(addr.ip()), EventKind::ClientJoin) {
                        Decision::Allowed => self.handle_create(packet),
                        Decision::Limited { .. } => rate_limited_reply(PacketType::SessionCreated),
                    }
                }
                Some(PacketType::SessionJoin) => {
                    match self.limiter.check(Subject::Ip(addr.ip()), EventKind::ClientJoin) {
                        Decision::Allowed => self.handle_join(packet),
                        Decision::Limited { .. } => rate_limited_reply(PacketType::SessionJoined),
                    }
                }
                Some(PacketType::Ping) => {
                    Packet::new(PacketType::Pong.as_u16(), 0, packet.payload)
                }
                _ if raw_type >= EXTENSION_TYPE_FLOOR => continue,
                _ => {
                    let payload =
                        ErrorPayload::new(ErrorCode::ProtocolViolation, "unexpected packet")
                            .encode();
                    let reply = Packet::new(PacketType::Error.as_u16(), 0, payload);
                    let _ = transport.send_frame(&reply).await;
                    break;
                }
            };
            if transport.send_frame(&reply).await.is_err() {
                break;
            }
        }
        debug!(target: "asciichat::discovery", %addr, "discovery connection closed");
    }

    fn handle_create(&self, packet: Packet) -> Packet {
        let reply = match SessionCreate::decode(packet.payload) {
            Ok(create) => match self.registry.create_session(CreateRequest {
                session_type: create.session_type,
                capabilities: create.capabilities,
                max_participants: create.max_participants,
                server_addr: create.server_addr,
                server_port: create.server_port,
                expose_ip: create.expose_ip,
                password_hash: if create.password_hash.is_empty() {
                    None
                } else {
                    Some(create.password_hash)
                },
            }) {
                Ok(created) => SessionCreated {
                    error: ErrorCode::None,
                    session_string: created.session_string,
                    ttl_secs: created.ttl.as_secs() as u32,
                },
                Err(err) => SessionCreated {
                    error: err.error_code(),
                    session_string: String::new(),
                    ttl_secs: 0,
                },
            },
            Err(_) => SessionCreated {
                error: ErrorCode::ProtocolViolation,
                session_string: String::new(),
                ttl_secs: 0,
            },
        };
        Packet::new(PacketType::SessionCreated.as_u16(), 0, reply.encode())
    }

    fn handle_join(&self, packet: Packet) -> Packet {
        let reply = match SessionJoin::decode(packet.payload) {
            Ok(join) => {
                let password = if join.password.is_empty() {
                    None
                } else {
                    Some(join.password.as_str())
                };
                match self.registry.join_session(&join.session_string, password) {
                    Ok(grant) => SessionJoined {
                        success: true,
                        error: if grant.ip_withheld {
                            ErrorCode::IpWithheld
                        } else {
                            ErrorCode::None
                        },
                        session_type: grant.session_type,
                        server_addr: grant.server_addr,
                        server_port: grant.server_port,
                        turn_username: grant.turn_username,
                        turn_password: grant.turn_password,
                    },
                    Err(err) => failed_join(err.error_code()),
                }
            }
            Err(_) => failed_join(ErrorCode::ProtocolViolation),
        };
        Packet::new(PacketType::SessionJoined.as_u16(), 0, reply.encode())
    }
}

fn failed_join(error: ErrorCode) -> SessionJoined {
    SessionJoined {
        success: false,
        error,
        session_type: SessionType::DirectTcp,
        server_addr: String::new(),
        server_port: 0,
        turn_username: String::new(),
        turn_password: String::new(),
    }
}

fn rate_limited_reply(kind: PacketType) -> Packet {
    match kind {
        PacketType::SessionCreated => {
            let reply = SessionCreated {
                error: ErrorCode::RateLimited,
                session_string: String::new(),
                ttl_secs: 0,
            };
            Packet::new(PacketType::SessionCreated.as_u16(), 0, reply.encode())
        }
        _ => {
            let reply = failed_join(ErrorCode::RateLimited);
            Packet::new(PacketType::SessionJoined.as_u16(), 0, reply.encode())
        }
    }
}
