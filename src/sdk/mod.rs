//! High-level client surface: discovery resolution plus the connected
//! media client.

pub mod client;
pub mod discovery;

pub use client::{AsciiChatClient, ClientError, ClientEvent, ClientOptions};
pub use discovery::{DiscoveryClient, DiscoveryClientError, HostAnnouncement};
