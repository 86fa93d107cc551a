//! ACDS: the discovery registry mapping three-word session strings to
//! host contact info, with password gating, an IP-disclosure policy and
//! optional TURN credential derivation for WebRTC sessions.

pub mod service;
pub mod words;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::verify_password;
use crate::messages::{ErrorCode, SessionType};

/// Default record lifetime: one hour.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// TURN credentials expire with the record by default.
pub const DEFAULT_TURN_TTL: Duration = Duration::from_secs(24 * 3600);

/// Attempts at generating an unused session string before giving up.
const GENERATION_ATTEMPTS: usize = 64;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("session not found")]
    SessionNotFound,
    #[error("invalid password")]
    InvalidPassword,
    #[error("session is full")]
    SessionFull,
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("could not allocate a unique session string")]
    Exhausted,
    #[error("persistence: {0}")]
    Persist(String),
}

impl DiscoveryError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DiscoveryError::SessionNotFound => ErrorCode::SessionNotFound,
            DiscoveryError::InvalidPassword => ErrorCode::InvalidPassword,
            DiscoveryError::SessionFull => ErrorCode::SessionFull,
            DiscoveryError::InvalidParam(_) => ErrorCode::InvalidParam,
            DiscoveryError::Exhausted => ErrorCode::ResourceExhausted,
            DiscoveryError::Persist(_) => ErrorCode::Internal,
        }
    }
}

/// One registered session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_string: String,
    pub session_type: SessionType,
    pub capabilities: u32,
    pub max_participants: u16,
    /// Argon2id PHC string; `None` for open sessions.
    pub password_hash: Option<String>,
    pub expose_ip: bool,
    pub server_addr: String,
    pub server_port: u16,
    pub created_at_epoch: u64,
    pub ttl_secs: u64,
    pub joins: u32,
}

impl SessionRecord {
    fn is_expired(&self, now_epoch: u64) -> bool {
        now_epoch >= self.created_at_epoch.saturating_add(self.ttl_secs)
    }
}

/// Host request to register a session.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub session_type: SessionType,
    pub capabilities: u32,
    pub max_participants: u16,
    pub server_addr: String,
    pub server_port: u16,
    pub expose_ip: bool,
    pub password_hash: Option<String>,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session_string: String,
    pub ttl: Duration,
}

/// Result of a successful join. Contact fields are empty whenever the
/// disclosure rule withholds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGrant {
    pub session_type: SessionType,
    pub server_addr: String,
    pub server_port: u16,
    /// True when policy withheld the contact info (distinct from a wrong
    /// password, which is an error).
    pub ip_withheld: bool,
    pub turn_username: String,
    pub turn_password: String,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub ttl: Duration,
    pub turn_secret: Option<String>,
    pub turn_ttl: Duration,
    /// JSON file the registry persists to; in-memory only when absent.
    pub persist_path: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            turn_secret: None,
            turn_ttl: DEFAULT_TURN_TTL,
            persist_path: None,
        }
    }
}

/// The shared registry. All mutations are serialized under one lock;
/// lookups clone the record out and release it immediately.
pub struct Registry {
    config: RegistryConfig,
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl Registry {
    /// Opens the registry, reloading persisted records and discarding any
    /// that expired while the service was down.
    pub fn open(config: RegistryConfig) -> Result<Self, DiscoveryError> {
        let mut records = HashMap::new();
        if let Some(path) = &config.persist_path {
            if path.exists() {
                let raw = std::fs::read(path)
                    .map_err(|e| DiscoveryError::Persist(e.to_string()))?;
                let stored: Vec<SessionRecord> = serde_json::from_slice(&raw)
                    .map_err(|e| DiscoveryError::Persist(e.to_string()))?;
                let now = now_epoch();
                for record in stored {
                    if !record.is_expired(now) {
                        records.insert(record.session_string.clone(), record);
                    }
                }
                info!(
                    target: "asciichat::discovery",
                    live = records.len(),
                    "registry reloaded"
                );
            }
        }
        Ok(Self {
            config,
            records: Mutex::new(records),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            config: RegistryConfig::default(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a session under a freshly sampled session string.
    ///
    /// Uniqueness against live records is guaranteed by rejection
    /// sampling; two live sessions can never share a string.
    pub fn create_session(&self, request: CreateRequest) -> Result<CreatedSession, DiscoveryError> {
        if request.server_addr.is_empty() {
            return Err(DiscoveryError::InvalidParam("server_addr"));
        }
        if request.server_port == 0 {
            return Err(DiscoveryError::InvalidParam("server_port"));
        }
        if request.max_participants == 0 {
            return Err(DiscoveryError::InvalidParam("max_participants"));
        }

        let mut rng = rand::thread_rng();
        let mut records = self.records.lock();
        let session_string = (0..GENERATION_ATTEMPTS)
            .map(|_| words::random_session_string(&mut rng))
            .find(|candidate| !records.contains_key(candidate))
            .ok_or(DiscoveryError::Exhausted)?;

        let record = SessionRecord {
            session_string: session_string.clone(),
            session_type: request.session_type,
            capabilities: request.capabilities,
            max_participants: request.max_participants,
            password_hash: request.password_hash,
            expose_ip: request.expose_ip,
            server_addr: request.server_addr,
            server_port: request.server_port,
            created_at_epoch: now_epoch(),
            ttl_secs: self.config.ttl.as_secs(),
            joins: 0,
        };
        records.insert(session_string.clone(), record);
        self.persist(&records)?;
        debug!(
            target: "asciichat::discovery",
            session = %session_string,
            "session registered"
        );
        Ok(CreatedSession {
            session_string,
            ttl: self.config.ttl,
        })
    }

    /// Resolves a session string for a joiner.
    ///
    /// Disclosure rule: contact info is returned only if (a) the session
    /// has no password and `expose_ip` is set, or (b) the offered password
    /// verifies. A wrong password is an error; a policy withholding is a
    /// success with zeroed contact fields.
    pub fn join_session(
        &self,
        session_string: &str,
        password: Option<&str>,
    ) -> Result<JoinGrant, DiscoveryError> {
        let mut records = self.records.lock();
        let now = now_epoch();
        if records
            .get(session_string)
            .map(|r| r.is_expired(now))
            .unwrap_or(false)
        {
            records.remove(session_string);
        }
        let record = records
            .get_mut(session_string)
            .ok_or(DiscoveryError::SessionNotFound)?;

        if record.joins >= record.max_participants as u32 {
            return Err(DiscoveryError::SessionFull);
        }

        let disclose = match &record.password_hash {
            Some(stored) => {
                let offered = password.ok_or(DiscoveryError::InvalidPassword)?;
                if !verify_password(offered, stored) {
                    return Err(DiscoveryError::InvalidPassword);
                }
                true
            }
            None => record.expose_ip,
        };

        record.joins += 1;
        let record = record.clone();
        self.persist(&records)?;
        drop(records);

        let (turn_username, turn_password) = if disclose
            && record.session_type == SessionType::WebRtc
        {
            match &self.config.turn_secret {
                Some(secret) => {
                    let expiry = record
                        .created_at_epoch
                        .saturating_add(self.config.turn_ttl.as_secs());
                    turn_credentials(secret, &record.session_string, expiry)
                }
                None => (String::new(), String::new()),
            }
        } else {
            (String::new(), String::new())
        };

        Ok(JoinGrant {
            session_type: record.session_type,
            server_addr: if disclose {
                record.server_addr.clone()
            } else {
                String::new()
            },
            server_port: if disclose { record.server_port } else { 0 },
            ip_withheld: !disclose,
            turn_username,
            turn_password,
        })
    }

    /// Evicts records past their TTL; returns how many were dropped.
    pub fn expire_sessions(&self) -> usize {
        let mut records = self.records.lock();
        let now = now_epoch();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        let evicted = before - records.len();
        if evicted > 0 {
            let _ = self.persist(&records);
            debug!(
                target: "asciichat::discovery",
                evicted,
                "expired sessions evicted"
            );
        }
        evicted
    }

    pub fn live_sessions(&self) -> usize {
        self.records.lock().len()
    }

    /// Drops a record explicitly (host teardown).
    pub fn release_session(&self, session_string: &str) -> bool {
        let mut records = self.records.lock();
        let removed = records.remove(session_string).is_some();
        if removed {
            let _ = self.persist(&records);
        }
        removed
    }

    fn persist(&self, records: &HashMap<String, SessionRecord>) -> Result<(), DiscoveryError> {
        let Some(path) = &self.config.persist_path else {
            return Ok(());
        };
        let snapshot: Vec<&SessionRecord> = records.values().collect();
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| DiscoveryError::Persist(e.to_string()))?;
        std::fs::write(path, raw).map_err(|e| DiscoveryError::Persist(e.to_string()))
    }
}

/// Derives ephemeral TURN credentials in the long-term-credential form:
/// `username = {expiry}:{session}`, `password = base64(HMAC-SHA1(secret, username))`.
/// Pure in its inputs, so repeated joins within the window agree.
pub fn turn_credentials(secret: &str, session_string: &str, expiry_epoch: u64) -> (String, String) {
    let username = format!("{expiry_epoch}:{session_string}");
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(username.as_bytes());
    let digest = mac.finalize().into_bytes();
    (username, BASE64.encode(digest))
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_password;
    use crate::messages::CAP_VIDEO;

    fn request(expose_ip: bool, password_hash: Option<String>) -> CreateRequest {
        CreateRequest {
            session_type: SessionType::DirectTcp,
            capabilities: CAP_VIDEO,
            max_participants: 8,
            server_addr: "192.168.1.100".into(),
            server_port: 27224,
            expose_ip,
            password_hash,
        }
    }

    #[test]
    fn open_exposed_session_discloses_contact() {
        let registry = Registry::in_memory();
        let created = registry.create_session(request(true, None)).unwrap();
        let grant = registry.join_session(&created.session_string, None).unwrap();
        assert!(!grant.ip_withheld);
        assert_eq!(grant.server_addr, "192.168.1.100");
        assert_eq!(grant.server_port, 27224);
    }

    #[test]
    fn unexposed_session_withholds_contact_but_succeeds() {
        let registry = Registry::in_memory();
        let created = registry.create_session(request(false, None)).unwrap();
        let grant = registry.join_session(&created.session_string, None).unwrap();
        assert!(grant.ip_withheld);
        assert!(grant.server_addr.is_empty());
        assert_eq!(grant.server_port, 0);
    }

    #[test]
    fn password_gate_verifies_or_rejects() {
        let registry = Registry::in_memory();
        let hash = hash_password("test-password-123");
        let created = registry
            .create_session(request(false, Some(hash)))
            .unwrap();

        let grant = registry
            .join_session(&created.session_string, Some("test-password-123"))
            .unwrap();
        assert!(!grant.ip_withheld);
        assert_eq!(grant.server_addr, "192.168.1.100");

        assert!(matches!(
            registry.join_session(&created.session_string, Some("wrong")),
            Err(DiscoveryError::InvalidPassword)
        ));
        assert!(matches!(
            registry.join_session(&created.session_string, None),
            Err(DiscoveryError::InvalidPassword)
        ));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let registry = Registry::in_memory();
        assert!(matches!(
            registry.join_session("amberfox-mosswren-duskowl", None),
            Err(DiscoveryError::SessionNotFound)
        ));
    }

    #[test]
    fn session_strings_are_unique_while_live() {
        let registry = Registry::in_memory();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let created = registry.create_session(request(true, None)).unwrap();
            assert!(seen.insert(created.session_string));
        }
    }

    #[test]
    fn join_cap_enforced() {
        let registry = Registry::in_memory();
        let created = registry
            .create_session(CreateRequest {
                max_participants: 2,
                ..request(true, None)
            })
            .unwrap();
        registry.join_session(&created.session_string, None).unwrap();
        registry.join_session(&created.session_string, None).unwrap();
        assert!(matches!(
            registry.join_session(&created.session_string, None),
            Err(DiscoveryError::SessionFull)
        ));
    }

    #[test]
    fn webrtc_sessions_get_deterministic_turn_credentials() {
        let registry = Registry::with_config(RegistryConfig {
            turn_secret: Some("turn-secret".into()),
            ..RegistryConfig::default()
        });
        let created = registry
            .create_session(CreateRequest {
                session_type: SessionType::WebRtc,
                ..request(true, None)
            })
            .unwrap();
        let first = registry.join_session(&created.session_string, None).unwrap();
        let second = registry.join_session(&created.session_string, None).unwrap();
        assert!(!first.turn_username.is_empty());
        assert_eq!(first.turn_username, second.turn_username);
        assert_eq!(first.turn_password, second.turn_password);
        assert!(first
            .turn_username
            .ends_with(&format!(":{}", created.session_string)));
    }

    #[test]
    fn turn_credentials_withheld_without_disclosure() {
        let registry = Registry::with_config(RegistryConfig {
            turn_secret: Some("turn-secret".into()),
            ..RegistryConfig::default()
        });
        let created = registry
            .create_session(CreateRequest {
                session_type: SessionType::WebRtc,
                ..request(false, None)
            })
            .unwrap();
        let grant = registry.join_session(&created.session_string, None).unwrap();
        assert!(grant.ip_withheld);
        assert!(grant.turn_username.is_empty());
    }

    #[test]
    fn direct_tcp_sessions_never_get_turn() {
        let registry = Registry::with_config(RegistryConfig {
            turn_secret: Some("turn-secret".into()),
            ..RegistryConfig::default()
        });
        let created = registry.create_session(request(true, None)).unwrap();
        let grant = registry.join_session(&created.session_string, None).unwrap();
        assert!(grant.turn_username.is_empty());
    }

    #[test]
    fn expiry_evicts_and_forgets() {
        let registry = Registry::with_config(RegistryConfig {
            ttl: Duration::from_secs(0),
            ..RegistryConfig::default()
        });
        let created = registry.create_session(request(true, None)).unwrap();
        assert_eq!(registry.expire_sessions(), 1);
        assert!(matches!(
            registry.join_session(&created.session_string, None),
            Err(DiscoveryError::SessionNotFound)
        ));
    }

    #[test]
    fn persistence_roundtrip_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acds.json");
        let config = RegistryConfig {
            persist_path: Some(path.clone()),
            ..RegistryConfig::default()
        };
        let live = {
            let registry = Registry::open(config.clone()).unwrap();
            registry.create_session(request(true, None)).unwrap()
        };

        let reloaded = Registry::open(config).unwrap();
        assert_eq!(reloaded.live_sessions(), 1);
        let grant = reloaded.join_session(&live.session_string, None).unwrap();
        assert_eq!(grant.server_addr, "192.168.1.100");
    }

    #[test]
    fn release_session_removes_the_record() {
        let registry = Registry::in_memory();
        let created = registry.create_session(request(true, None)).unwrap();
        assert!(registry.release_session(&created.session_string));
        assert!(!registry.release_session(&created.session_string));
        assert!(matches!(
            registry.join_session(&created.session_string, None),
            Err(DiscoveryError::SessionNotFound)
        ));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let registry = Registry::in_memory();
        assert!(matches!(
            registry.create_session(CreateRequest {
                server_addr: String::new(),
                ..request(true, None)
            }),
            Err(DiscoveryError::InvalidParam("server_addr"))
        ));
        assert!(matches!(
            registry.create_session(CreateRequest {
                server_port: 0,
                ..request(true, None)
            }),
            Err(DiscoveryError::InvalidParam("server_port"))
        ));
        assert!(matches!(
            registry.create_session(CreateRequest {
                max_participants: 0,
                ..request(true, None)
            }),
            Err(DiscoveryError::InvalidParam("max_participants"))
        ));
    }
}
