//! Fan-out hub: the live-client map and media routing.
//!
//! One inbound media packet is duplicated to every other subscribed peer
//! as a refcounted view of the same payload buffer; nothing is mixed or
//! transcoded. The map's lock is held only across insert/remove and the
//! brief routing iteration; per-client state lives in the sessions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::messages::{ClientJoin, ClientLeave, ErrorCode, PacketType};
use crate::session::{ClientSession, Envelope};

/// Shared registry of live sessions.
pub struct Hub {
    peers: RwLock<HashMap<u32, Arc<ClientSession>>>,
    /// Ids are assigned once and never reused for the server's lifetime.
    next_id: AtomicU32,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Reserves the next client id; called before the handshake so the id
    /// can be handed out in HANDSHAKE_COMPLETE.
    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a session after a completed handshake.
    pub fn register(
        &self,
        id: u32,
        name: String,
        addr: IpAddr,
        capabilities: u32,
        cancel: CancellationToken,
    ) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(id, name, addr, capabilities, cancel));
        self.peers.write().insert(id, session.clone());
        debug!(target: "asciichat::server", client_id = id, "session registered");
        session
    }

    pub fn unregister(&self, id: u32) -> Option<Arc<ClientSession>> {
        self.peers.write().remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<Arc<ClientSession>> {
        self.peers.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.peers.read().values().cloned().collect()
    }

    /// Routes one media envelope to every other subscribed peer. Drops
    /// inside full queues are counted by the queues themselves and never
    /// surfaced to the originator.
    pub fn route_media(&self, envelope: Envelope) {
        let peers = self.peers.read();
        for (id, session) in peers.iter() {
            if *id == envelope.origin || !session.wants(envelope.kind) {
                continue;
            }
            // Bytes clone: refcount bump on the shared payload buffer.
            let _ = session.queue.push_media(envelope.clone());
        }
        trace!(
            target: "asciichat::fanout",
            origin = envelope.origin,
            kind = ?envelope.kind,
            targets = peers.len().saturating_sub(1),
            "routed media frame"
        );
    }

    /// Queues a control packet to every peer except `except`.
    pub fn broadcast_control(&self, packet_type: PacketType, payload: bytes::Bytes, except: u32) {
        for session in self.peers.read().values() {
            if session.id == except {
                continue;
            }
            let _ = session
                .queue
                .push_control(packet_type, 0, payload.clone());
        }
    }

    /// Announces a new peer to the room and replays the current roster to
    /// the newcomer.
    pub fn announce_join(&self, joined: &ClientSession) {
        let notice = ClientJoin {
            client_id: joined.id,
            capabilities: joined.capabilities(),
            display_name: joined.name.clone(),
        }
        .encode();
        self.broadcast_control(PacketType::ClientJoin, notice, joined.id);

        for session in self.peers.read().values() {
            if session.id == joined.id {
                continue;
            }
            let entry = ClientJoin {
                client_id: session.id,
                capabilities: session.capabilities(),
                display_name: session.name.clone(),
            }
            .encode();
            let _ = joined
                .queue
                .push_control(PacketType::ClientJoin, 0, entry);
        }
    }

    /// Broadcasts a departure, synthesized or graceful.
    pub fn announce_leave(&self, client_id: u32, reason: ErrorCode) {
        let notice = ClientLeave { client_id, reason }.encode();
        self.broadcast_control(PacketType::ClientLeave, notice, client_id);
    }
}
