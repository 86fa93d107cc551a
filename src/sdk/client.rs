//! The connected media client.
//!
//! Wraps a handshaken TCP transport: sends capture frames, receives
//! remote streams as events, answers server pings from a background task,
//! and drives in-channel rekeys when the send nonce budget runs low.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Timeouts;
use crate::crypto::identity::{KnownHosts, NodeCredentials};
use crate::crypto::{rekey_ciphers, CryptoError, DirectionCipher, Role, X25519KeyExchange};
use crate::framing::Packet;
use crate::handshake::{ClientHandshake, HandshakeError};
use crate::messages::{
    AudioBatch, AudioOpusBatch, ClientCapabilities, ClientJoin, ClientLeave, ErrorCode,
    ErrorPayload, ImageFrame, PacketType, Ping, RekeyExchange, SessionType, StreamSubscription,
    WireError, CAP_AUDIO, CAP_VIDEO, EXTENSION_TYPE_FLOOR,
};
use crate::sdk::discovery::{DiscoveryClient, DiscoveryClientError};
use crate::transport::{tcp, FrameReader, FrameWriter, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryClientError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("malformed payload: {0}")]
    Wire(#[from] WireError),
    #[error("plaintext send on an encrypted session")]
    EncryptionPolicy,
    #[error("rekey in flight; send paused")]
    RekeyPending,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("server reported: {0}")]
    Remote(ErrorPayload),
}

/// Connection parameters.
#[derive(Debug)]
pub struct ClientOptions {
    pub display_name: String,
    pub capabilities: u32,
    pub encrypt: bool,
    pub credentials: Option<NodeCredentials>,
    pub password: Option<String>,
    pub known_hosts: Option<KnownHosts>,
    pub timeouts: Timeouts,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            display_name: "anonymous".into(),
            capabilities: CAP_VIDEO | CAP_AUDIO,
            encrypt: true,
            credentials: None,
            password: None,
            known_hosts: None,
            timeouts: Timeouts::from_env(),
        }
    }
}

/// Everything a remote can tell us after the handshake.
#[derive(Debug)]
pub enum ClientEvent {
    PeerJoined(ClientJoin),
    PeerLeft(ClientLeave),
    PeerCapabilities(ClientCapabilities),
    Image { origin: u32, frame: ImageFrame },
    Audio { origin: u32, batch: AudioBatch },
    AudioOpus { origin: u32, batch: AudioOpusBatch },
    Pong { nonce: u64 },
    ServerError(ErrorPayload),
}

/// Send half shared between the app task and the ping task. Sealing and
/// the rekey pause flag live under one lock so nonce order is never
/// violated.
struct SecureWriter {
    writer: FrameWriter<WriteHalf<TcpStream>>,
    cipher: DirectionCipher,
    encrypted: bool,
    /// Set between REKEY_REQUEST and REKEY_RESPONSE; the fresh local
    /// exchange waits here for the server's ephemeral.
    pending_rekey: Option<X25519KeyExchange>,
}

impl SecureWriter {
    async fn send(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        client_id: u32,
    ) -> Result<(), ClientError> {
        if self.pending_rekey.is_some() {
            return Err(ClientError::RekeyPending);
        }
        let body = if self.encrypted {
            Bytes::from(self.cipher.seal(payload)?)
        } else {
            Bytes::copy_from_slice(payload)
        };
        self.writer
            .write_packet(&Packet::new(packet_type.as_u16(), client_id, body))
            .await?;

        if self.encrypted && self.cipher.needs_rekey() {
            self.initiate_rekey(client_id).await?;
        }
        Ok(())
    }

    /// Sends REKEY_REQUEST under the old key and pauses this direction
    /// until the response installs the new cipher.
    async fn initiate_rekey(&mut self, client_id: u32) -> Result<(), ClientError> {
        let exchange = X25519KeyExchange::new();
        let request = RekeyExchange {
            ephemeral: exchange.public_bytes(),
        };
        let body = Bytes::from(self.cipher.seal(&request.encode())?);
        self.writer
            .write_packet(&Packet::new(
                PacketType::RekeyRequest.as_u16(),
                client_id,
                body,
            ))
            .await?;
        self.pending_rekey = Some(exchange);
        debug!(target: "asciichat::client", "rekey requested; sends paused");
        Ok(())
    }
}

/// A connected participant.
pub struct AsciiChatClient {
    reader: FrameReader<ReadHalf<TcpStream>>,
    writer: Arc<Mutex<SecureWriter>>,
    recv_cipher: DirectionCipher,
    encrypted: bool,
    client_id: u32,
    ping_handle: Option<JoinHandle<()>>,
}

impl AsciiChatClient {
    /// Dials a server directly and completes the handshake.
    pub async fn connect(addr: SocketAddr, options: ClientOptions) -> Result<Self, ClientError> {
        let timeouts = options.timeouts;
        let mut transport = tcp::connect(addr, &timeouts).await?;
        let handshake = ClientHandshake {
            display_name: options.display_name,
            capabilities: options.capabilities,
            encrypt: options.encrypt,
            credentials: options.credentials,
            password: options.password,
            known_hosts: options.known_hosts,
            server_host: addr.ip().to_string(),
            server_port: addr.port(),
            timeouts,
        };
        let outcome = handshake.run(&mut transport).await?;
        let (reader, writer) = transport.into_split();
        let (send_cipher, recv_cipher, encrypted) = outcome.channel.into_halves();

        let writer = Arc::new(Mutex::new(SecureWriter {
            writer,
            cipher: send_cipher,
            encrypted,
            pending_rekey: None,
        }));

        let ping_writer = writer.clone();
        let client_id = outcome.client_id;
        let ping_handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(timeouts.ping_interval);
            loop {
                tick.tick().await;
                let ping = Ping {
                    nonce: rand::thread_rng().gen(),
                };
                let mut guard = ping_writer.lock().await;
                match guard.send(PacketType::Ping, &ping.encode(), client_id).await {
                    Ok(()) | Err(ClientError::RekeyPending) => {}
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            reader,
            writer,
            recv_cipher,
            encrypted,
            client_id,
            ping_handle: Some(ping_handle),
        })
    }

    /// Resolves a session string through the discovery service, then dials
    /// the disclosed contact address.
    pub async fn connect_session(
        discovery_addr: SocketAddr,
        session_string: &str,
        password: Option<&str>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let discovery = DiscoveryClient::new(discovery_addr, options.timeouts);
        let joined = discovery.join(session_string, password).await?;
        if joined.error == ErrorCode::IpWithheld || joined.server_addr.is_empty() {
            return Err(ClientError::Protocol(
                "registry withheld the host address".into(),
            ));
        }
        if joined.session_type == SessionType::WebRtc {
            return Err(ClientError::Protocol(
                "webrtc sessions need an external transport".into(),
            ));
        }
        let addr: SocketAddr = format!("{}:{}", joined.server_addr, joined.server_port)
            .parse()
            .map_err(|_| ClientError::Protocol("registry returned a bad address".into()))?;
        Self::connect(addr, options).await
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Subscribes to remote stream kinds (SUB_VIDEO / SUB_AUDIO bits).
    pub async fn subscribe(&self, kinds: u32) -> Result<(), ClientError> {
        self.send_control(PacketType::StreamStart, StreamSubscription { kinds }.encode())
            .await
    }

    pub async fn unsubscribe(&self, kinds: u32) -> Result<(), ClientError> {
        self.send_control(PacketType::StreamStop, StreamSubscription { kinds }.encode())
            .await
    }

    pub async fn send_image(&self, frame: &ImageFrame) -> Result<(), ClientError> {
        self.send_control(PacketType::ImageFrame, frame.encode())
            .await
    }

    pub async fn send_audio(&self, batch: &AudioBatch) -> Result<(), ClientError> {
        self.send_control(PacketType::AudioBatch, batch.encode())
            .await
    }

    pub async fn send_audio_opus(&self, batch: &AudioOpusBatch) -> Result<(), ClientError> {
        self.send_control(PacketType::AudioOpusBatch, batch.encode())
            .await
    }

    async fn send_control(&self, packet_type: PacketType, payload: Bytes) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        writer.send(packet_type, &payload, self.client_id).await
    }

    /// Sends a packet without sealing it. Refused on encrypted sessions:
    /// once the channel is up, plaintext violates policy.
    pub async fn send_plaintext(
        &self,
        packet_type: PacketType,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        if self.encrypted {
            return Err(ClientError::EncryptionPolicy);
        }
        self.send_control(packet_type, payload).await
    }

    /// Receives the next remote event, transparently answering pings and
    /// servicing rekeys.
    pub async fn next_event(&mut self) -> Result<ClientEvent, ClientError> {
        loop {
            let packet = self.reader.read_packet().await?;
            let raw_type = packet.packet_type;
            let Some(packet_type) = PacketType::from_u16(raw_type) else {
                if raw_type >= EXTENSION_TYPE_FLOOR {
                    if self.encrypted {
                        let _ = self.recv_cipher.open(&packet.payload)?;
                    }
                    continue;
                }
                return Err(ClientError::Protocol(format!(
                    "unknown packet type {raw_type}"
                )));
            };
            let payload = if self.encrypted {
                Bytes::from(self.recv_cipher.open(&packet.payload)?)
            } else {
                packet.payload.clone()
            };
            let origin = packet.client_id;

            match packet_type {
                PacketType::Ping => {
                    let mut writer = self.writer.lock().await;
                    match writer.send(PacketType::Pong, &payload, self.client_id).await {
                        Ok(()) | Err(ClientError::RekeyPending) => {}
                        Err(err) => return Err(err),
                    }
                }
                PacketType::Pong => {
                    let pong = Ping::decode(payload)?;
                    return Ok(ClientEvent::Pong { nonce: pong.nonce });
                }
                PacketType::ClientJoin => {
                    return Ok(ClientEvent::PeerJoined(ClientJoin::decode(payload)?));
                }
                PacketType::ClientLeave => {
                    return Ok(ClientEvent::PeerLeft(ClientLeave::decode(payload)?));
                }
                PacketType::ClientCapabilities => {
                    return Ok(ClientEvent::PeerCapabilities(ClientCapabilities::decode(
                        payload,
                    )?));
                }
                PacketType::ImageFrame => {
                    return Ok(ClientEvent::Image {
                        origin,
                        frame: ImageFrame::decode(payload)?,
                    });
                }
                PacketType::AudioBatch => {
                    return Ok(ClientEvent::Audio {
                        origin,
                        batch: AudioBatch::decode(payload)?,
                    });
                }
                PacketType::AudioOpusBatch => {
                    return Ok(ClientEvent::AudioOpus {
                        origin,
                        batch: AudioOpusBatch::decode(payload)?,
                    });
                }
                PacketType::RekeyRequest => self.respond_to_rekey(payload).await?,
                PacketType::RekeyResponse => self.finish_rekey(payload).await?,
                PacketType::Error => {
                    let err = ErrorPayload::decode(payload)?;
                    warn!(
                        target: "asciichat::client",
                        code = %err.code,
                        message = %err.message,
                        "server error"
                    );
                    return Ok(ClientEvent::ServerError(err));
                }
                PacketType::ProtocolVersion => continue,
                _ => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected packet {packet_type:?} on established session"
                    )));
                }
            }
        }
    }

    /// Responder half of a server-initiated rekey: the response is the
    /// last packet under the old send key.
    async fn respond_to_rekey(&mut self, payload: Bytes) -> Result<(), ClientError> {
        if !self.encrypted {
            return Err(ClientError::Protocol("rekey on plaintext session".into()));
        }
        let request = RekeyExchange::decode(payload)?;
        let exchange = X25519KeyExchange::new();
        let reply = RekeyExchange {
            ephemeral: exchange.public_bytes(),
        };
        let mut writer = self.writer.lock().await;
        let body = Bytes::from(writer.cipher.seal(&reply.encode())?);
        writer
            .writer
            .write_packet(&Packet::new(
                PacketType::RekeyResponse.as_u16(),
                self.client_id,
                body,
            ))
            .await?;
        let (new_send, new_recv) = rekey_ciphers(exchange, &request.ephemeral, true, Role::Client);
        writer.cipher = new_send;
        drop(writer);
        self.recv_cipher = new_recv;
        Ok(())
    }

    /// Initiator half: the server's response carries its fresh ephemeral;
    /// install both directions and resume sending.
    async fn finish_rekey(&mut self, payload: Bytes) -> Result<(), ClientError> {
        let response = RekeyExchange::decode(payload)?;
        let mut writer = self.writer.lock().await;
        let exchange = writer.pending_rekey.take().ok_or_else(|| {
            ClientError::Protocol("REKEY_RESPONSE without a pending request".into())
        })?;
        let (new_send, new_recv) = rekey_ciphers(exchange, &response.ephemeral, true, Role::Client);
        writer.cipher = new_send;
        drop(writer);
        self.recv_cipher = new_recv;
        debug!(target: "asciichat::client", "rekey complete; sends resumed");
        Ok(())
    }

    /// Graceful departure: announces CLIENT_LEAVE and stops the ping task.
    pub async fn leave(mut self) -> Result<(), ClientError> {
        if let Some(handle) = self.ping_handle.take() {
            handle.abort();
        }
        let notice = ClientLeave {
            client_id: self.client_id,
            reason: ErrorCode::None,
        };
        let mut writer = self.writer.lock().await;
        let result = writer
            .send(PacketType::ClientLeave, &notice.encode(), self.client_id)
            .await;
        writer.writer.shutdown().await;
        result
    }
}

impl Drop for AsciiChatClient {
    fn drop(&mut self) {
        if let Some(handle) = self.ping_handle.take() {
            handle.abort();
        }
    }
}
