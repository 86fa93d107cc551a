//! ascii-chat core (ACIP v1).
//!
//! Implements the framed ACIP wire protocol, the X25519 + XSalsa20-Poly1305
//! crypto handshake, the per-client worker-pair session engine with media
//! fan-out, and the ACDS discovery registry mapping three-word session
//! strings to host contact info.

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod fanout;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod sdk;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Timeouts;
pub use crypto::identity::{IdentityKey, KnownHosts, NodeCredentials};
pub use crypto::{DirectionCipher, SessionKeys, X25519KeyExchange};
pub use discovery::service::DiscoveryService;
pub use discovery::{CreateRequest, JoinGrant, Registry, RegistryConfig};
pub use fanout::Hub;
pub use framing::Packet;
pub use handshake::{ClientHandshake, HandshakeError, HandshakeState, ServerHandshake};
pub use messages::{ErrorCode, PacketType, StreamKind};
pub use sdk::{AsciiChatClient, ClientEvent, ClientOptions, DiscoveryClient};
pub use server::{Server, ServerConfig};
pub use session::{ClientSession, RateLimiter, SendQueue};
pub use transport::{Transport, TransportError};
