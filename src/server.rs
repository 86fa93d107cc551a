//! The media distribution server: accept loop, per-client worker pairs,
//! heartbeat reaping and the post-handshake packet dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::crypto::identity::{IdentityKey, NodeCredentials};
use crate::crypto::{rekey_ciphers, CryptoError, DirectionCipher, Role, X25519KeyExchange};
use crate::fanout::Hub;
use crate::framing::{FrameError, Packet};
use crate::handshake::ServerHandshake;
use crate::messages::{
    ClientCapabilities, ErrorCode, ErrorPayload, PacketType, Ping, ProtocolVersionPayload,
    RekeyExchange, StreamSubscription, EXTENSION_TYPE_FLOOR, PROTOCOL_VERSION,
};
use crate::session::{
    ClientSession, CloseReason, Decision, Envelope, EventKind, RateConfig, RateLimiter, Subject,
};
use crate::transport::tcp;
use crate::transport::{FrameReader, FrameWriter, TransportError};

/// Server policy and tunables.
pub struct ServerConfig {
    /// Server identity for host authentication; anonymous when absent.
    pub credentials: Option<NodeCredentials>,
    pub require_client_identity: bool,
    pub authorized_keys: Vec<IdentityKey>,
    /// Argon2id PHC string gating joins, if set.
    pub password_hash: Option<String>,
    pub require_encryption: bool,
    pub timeouts: Timeouts,
    pub rate: RateConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            require_client_identity: false,
            authorized_keys: Vec::new(),
            password_hash: None,
            require_encryption: true,
            timeouts: Timeouts::from_env(),
            rate: RateConfig::default(),
        }
    }
}

/// One running server instance.
pub struct Server {
    config: ServerConfig,
    hub: Arc<Hub>,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate.clone()));
        Arc::new(Self {
            config,
            hub: Arc::new(Hub::new()),
            limiter,
            cancel: CancellationToken::new(),
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Token that stops the accept loop and every worker.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the accept loop until cancelled.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let reaper = tokio::spawn(Self::reaper(self.clone()));
        info!(
            target: "asciichat::server",
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "server listening"
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(target: "asciichat::server", error = %err, "accept failed");
                            continue;
                        }
                    };
                    // Pre-join limiting is per source IP.
                    match self.limiter.check(Subject::Ip(addr.ip()), EventKind::ClientJoin) {
                        Decision::Allowed => {}
                        Decision::Limited { .. } => {
                            debug!(target: "asciichat::server", %addr, "join rate limited");
                            tokio::spawn(Self::reject_rate_limited(stream, self.config.timeouts));
                            continue;
                        }
                    }
                    tokio::spawn(self.clone().handle_connection(stream, addr));
                }
            }
        }
        for session in self.hub.sessions() {
            session.force_close(CloseReason::ServerShutdown);
        }
        reaper.abort();
        Ok(())
    }

    async fn reject_rate_limited(stream: TcpStream, timeouts: Timeouts) {
        let Ok(mut transport) = tcp::from_stream(stream, &timeouts) else {
            return;
        };
        let payload = ErrorPayload::new(ErrorCode::RateLimited, "join rate exceeded").encode();
        let _ = crate::transport::Transport::send_frame(
            &mut transport,
            &Packet::new(PacketType::Error.as_u16(), 0, payload),
        )
        .await;
    }

    /// Pings every live session and reaps the ones that stopped answering.
    async fn reaper(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.timeouts.ping_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            for session in self.hub.sessions() {
                if session.since_last_pong() > self.config.timeouts.pong_death {
                    warn!(
                        target: "asciichat::server",
                        client_id = session.id,
                        "no pong within deadline; reaping session"
                    );
                    session.force_close(CloseReason::Timeout);
                    continue;
                }
                let ping = Ping {
                    nonce: rand::thread_rng().gen(),
                };
                let _ = session
                    .queue
                    .push_control(PacketType::Ping, 0, ping.encode());
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let assigned_id = self.hub.allocate_id();
        let mut transport = match tcp::from_stream(stream, &self.config.timeouts) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(target: "asciichat::server", %addr, error = %err, "socket setup failed");
                return;
            }
        };

        let handshake = ServerHandshake {
            credentials: self.config.credentials.clone(),
            require_client_identity: self.config.require_client_identity,
            authorized_keys: self.config.authorized_keys.clone(),
            password_hash: self.config.password_hash.clone(),
            require_encryption: self.config.require_encryption,
            assigned_id,
            timeouts: self.config.timeouts,
        };
        let outcome = match handshake.run(&mut transport).await {
            Ok(outcome) => outcome,
            Err(err) => {
                info!(
                    target: "asciichat::server",
                    %addr,
                    reason = %err.error_code(),
                    "handshake failed"
                );
                return;
            }
        };
        let (reader, writer) = transport.into_split();
        let (send_cipher, recv_cipher, encrypted) = outcome.channel.into_halves();

        let cancel = self.cancel.child_token();
        let session = self.hub.register(
            assigned_id,
            outcome.peer_name,
            addr.ip(),
            outcome.peer_capabilities,
            cancel.clone(),
        );
        self.hub.announce_join(&session);

        let mut send_handle = tokio::spawn(send_worker(
            session.queue.clone(),
            writer,
            send_cipher,
            encrypted,
            cancel.clone(),
        ));

        let reason = self
            .recv_loop(&session, reader, recv_cipher, encrypted)
            .await;

        self.hub.unregister(session.id);
        self.limiter.forget_client(session.id);

        match reason {
            // Give queued packets (including any final ERROR) a bounded
            // chance to flush before the socket drops.
            CloseReason::Graceful
            | CloseReason::ProtocolViolation
            | CloseReason::CryptoFailure
            | CloseReason::RateLimited => {
                session.queue.push_shutdown();
                if timeout(self.config.timeouts.leave_flush, &mut send_handle)
                    .await
                    .is_err()
                {
                    send_handle.abort();
                }
            }
            _ => {
                session.queue.close();
                cancel.cancel();
                let _ = send_handle.await;
            }
        }

        self.hub.announce_leave(session.id, close_code(reason));
        info!(
            target: "asciichat::server",
            client_id = session.id,
            %addr,
            reason = ?reason,
            dropped_frames = session.dropped_frames(),
            uptime_secs = session.connected_at.elapsed().as_secs(),
            "connection closed"
        );
    }

    async fn recv_loop<R>(
        &self,
        session: &Arc<ClientSession>,
        mut reader: FrameReader<R>,
        mut recv_cipher: DirectionCipher,
        encrypted: bool,
    ) -> CloseReason
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        loop {
            let packet = tokio::select! {
                _ = session.cancel.cancelled() => {
                    return session.forced_reason().unwrap_or(CloseReason::ServerShutdown);
                }
                result = reader.read_packet() => match result {
                    Ok(packet) => packet,
                    Err(TransportError::Eof) => return CloseReason::TransportError,
                    Err(TransportError::Timeout(_)) => return CloseReason::Timeout,
                    Err(TransportError::Frame(FrameError::ChecksumMismatch { .. })) => {
                        self.report(session, ErrorCode::ChecksumMismatch, "frame checksum");
                        return CloseReason::ProtocolViolation;
                    }
                    Err(TransportError::Frame(FrameError::BadMagic)) => {
                        self.report(session, ErrorCode::BadMagic, "frame magic");
                        return CloseReason::ProtocolViolation;
                    }
                    Err(TransportError::Frame(FrameError::LengthExceeded(_))) => {
                        self.report(session, ErrorCode::ProtocolViolation, "frame too large");
                        return CloseReason::ProtocolViolation;
                    }
                    Err(_) => return CloseReason::TransportError,
                }
            };

            let raw_type = packet.packet_type;
            let Some(packet_type) = PacketType::from_u16(raw_type) else {
                if raw_type >= EXTENSION_TYPE_FLOOR {
                    // Unknown extension: decrypt to keep nonces in step, then drop.
                    if encrypted && recv_cipher.open(&packet.payload).is_err() {
                        return CloseReason::CryptoFailure;
                    }
                    continue;
                }
                self.report(session, ErrorCode::ProtocolViolation, "unknown packet type");
                return CloseReason::ProtocolViolation;
            };

            let event = match packet_type {
                PacketType::ImageFrame => EventKind::ImageFrame,
                PacketType::AudioBatch | PacketType::AudioOpusBatch => EventKind::Audio,
                PacketType::Ping => EventKind::Ping,
                _ => EventKind::Control,
            };
            match self.limiter.check(Subject::Client(session.id), event) {
                Decision::Allowed => {}
                Decision::Limited { sustained } => {
                    self.report(session, ErrorCode::RateLimited, "rate limited");
                    if sustained {
                        return CloseReason::RateLimited;
                    }
                    if encrypted && recv_cipher.open(&packet.payload).is_err() {
                        return CloseReason::CryptoFailure;
                    }
                    continue;
                }
            }

            let payload = if encrypted {
                match recv_cipher.open(&packet.payload) {
                    Ok(clear) => Bytes::from(clear),
                    Err(_) => {
                        self.report(session, ErrorCode::CryptoAuthFailed, "decrypt failed");
                        return CloseReason::CryptoFailure;
                    }
                }
            } else {
                packet.payload.clone()
            };

            match packet_type {
                PacketType::Ping => {
                    // Echo the nonce straight back.
                    let _ = session.queue.push_control(PacketType::Pong, 0, payload);
                }
                PacketType::Pong => session.touch_pong(),
                PacketType::StreamStart => match StreamSubscription::decode(payload) {
                    Ok(sub) => session.subscribe(sub.kinds),
                    Err(_) => {
                        self.report(session, ErrorCode::ProtocolViolation, "bad subscription");
                        return CloseReason::ProtocolViolation;
                    }
                },
                PacketType::StreamStop => match StreamSubscription::decode(payload) {
                    Ok(sub) => session.unsubscribe(sub.kinds),
                    Err(_) => {
                        self.report(session, ErrorCode::ProtocolViolation, "bad subscription");
                        return CloseReason::ProtocolViolation;
                    }
                },
                PacketType::ClientCapabilities => match ClientCapabilities::decode(payload) {
                    Ok(update) => {
                        session.set_capabilities(update.capabilities);
                        let notice = ClientCapabilities {
                            client_id: session.id,
                            capabilities: update.capabilities,
                        };
                        self.hub.broadcast_control(
                            PacketType::ClientCapabilities,
                            notice.encode(),
                            session.id,
                        );
                    }
                    Err(_) => {
                        self.report(session, ErrorCode::ProtocolViolation, "bad capabilities");
                        return CloseReason::ProtocolViolation;
                    }
                },
                PacketType::ImageFrame | PacketType::AudioBatch | PacketType::AudioOpusBatch => {
                    let kind = packet_type.stream_kind().expect("media type has a kind");
                    self.hub.route_media(Envelope {
                        packet_type,
                        kind,
                        origin: session.id,
                        payload,
                    });
                }
                PacketType::ClientLeave => return CloseReason::Graceful,
                PacketType::RekeyRequest => {
                    if !encrypted {
                        self.report(session, ErrorCode::ProtocolViolation, "rekey on plaintext");
                        return CloseReason::ProtocolViolation;
                    }
                    match respond_to_rekey(session, payload) {
                        Ok(new_recv) => recv_cipher = new_recv,
                        Err(_) => {
                            self.report(session, ErrorCode::CryptoHandshakeFailed, "rekey failed");
                            return CloseReason::CryptoFailure;
                        }
                    }
                }
                PacketType::ProtocolVersion => {
                    let version = ProtocolVersionPayload {
                        version: PROTOCOL_VERSION,
                    };
                    let _ = session.queue.push_control(
                        PacketType::ProtocolVersion,
                        0,
                        version.encode(),
                    );
                }
                PacketType::Error => {
                    if let Ok(err) = ErrorPayload::decode(payload) {
                        warn!(
                            target: "asciichat::server",
                            client_id = session.id,
                            code = %err.code,
                            message = %err.message,
                            "client reported error"
                        );
                    }
                }
                // Handshake, rekey-response and discovery packets are out of
                // place on an established media connection.
                _ => {
                    self.report(session, ErrorCode::ProtocolViolation, "unexpected packet");
                    return CloseReason::ProtocolViolation;
                }
            }
        }
    }

    fn report(&self, session: &Arc<ClientSession>, code: ErrorCode, message: &str) {
        let payload = ErrorPayload::new(code, message).encode();
        let _ = session.queue.push_control(PacketType::Error, 0, payload);
    }
}

/// Server-side rekey response: queue the reply and the send-cipher swap in
/// order, install the new receive cipher immediately. The initiator pauses
/// its sends between request and response, so no old-key traffic can
/// follow the request.
fn respond_to_rekey(
    session: &Arc<ClientSession>,
    payload: Bytes,
) -> Result<DirectionCipher, CryptoError> {
    let request = RekeyExchange::decode(payload).map_err(|_| CryptoError::InvalidPublicKey)?;
    let exchange = X25519KeyExchange::new();
    let reply = RekeyExchange {
        ephemeral: exchange.public_bytes(),
    };
    let (new_send, new_recv) = rekey_ciphers(exchange, &request.ephemeral, false, Role::Server);
    session
        .queue
        .push_control(PacketType::RekeyResponse, 0, reply.encode())
        .map_err(|_| CryptoError::NonceExhausted)?;
    session
        .queue
        .push_install_cipher(new_send)
        .map_err(|_| CryptoError::NonceExhausted)?;
    Ok(new_recv)
}

/// Drains one client's queue into its transport, sealing in order.
async fn send_worker<W>(
    queue: Arc<crate::session::SendQueue>,
    mut writer: FrameWriter<W>,
    cipher: DirectionCipher,
    encrypted: bool,
    cancel: CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let mut cipher = cipher;
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue.next() => item,
        };
        let Some(item) = item else { break };
        let (packet_type, origin, payload) = match item {
            crate::session::QueueItem::Media(env) => (env.packet_type, env.origin, env.payload),
            crate::session::QueueItem::Control {
                packet_type,
                origin,
                payload,
            } => (packet_type, origin, payload),
            crate::session::QueueItem::InstallSendCipher(next) => {
                cipher = *next;
                continue;
            }
            crate::session::QueueItem::Shutdown => break,
        };

        let body = if encrypted {
            match cipher.seal(&payload) {
                Ok(sealed) => Bytes::from(sealed),
                Err(_) => {
                    cancel.cancel();
                    break;
                }
            }
        } else {
            payload
        };
        let packet = Packet::new(packet_type.as_u16(), origin, body);
        if writer.write_packet(&packet).await.is_err() {
            cancel.cancel();
            break;
        }
    }
    writer.shutdown().await;
}

fn close_code(reason: CloseReason) -> ErrorCode {
    match reason {
        CloseReason::Graceful | CloseReason::ServerShutdown => ErrorCode::None,
        CloseReason::Timeout => ErrorCode::NetworkTimeout,
        CloseReason::ProtocolViolation => ErrorCode::ProtocolViolation,
        CloseReason::CryptoFailure => ErrorCode::CryptoAuthFailed,
        CloseReason::TransportError => ErrorCode::Network,
        CloseReason::RateLimited => ErrorCode::RateLimited,
    }
}
