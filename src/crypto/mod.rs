//! Session cryptography: X25519 key agreement, the labeled HKDF key
//! schedule, and the XSalsa20-Poly1305 direction ciphers with monotone
//! nonce counters and rekey budgeting.

pub mod identity;

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce counters run to 2^63 − 1; the budget is never exceeded.
pub const NONCE_BUDGET: u64 = (1u64 << 63) - 1;
/// High-water mark at which callers must schedule a rekey (75% of budget).
pub const REKEY_THRESHOLD: u64 = NONCE_BUDGET / 4 * 3;

const NONCE_SALT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext failed authentication")]
    AuthFail,
    #[error("nonce counter exhausted; rekey required")]
    NonceExhausted,
    #[error("remote public key is not a valid curve point")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    BadSignature,
}

/// Which side of the connection we are; selects the c2s/s2c key labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Ephemeral X25519 exchange. A fresh instance is generated per handshake
/// and per rekey.
pub struct X25519KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyExchange {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Completes the agreement, consuming the ephemeral secret.
    pub fn derive_shared(self, remote: &[u8; 32]) -> [u8; 32] {
        let remote = PublicKey::from(*remote);
        let shared = self.secret.diffie_hellman(&remote);
        shared.to_bytes()
    }
}

impl Default for X25519KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// The derived key material for one session: distinct keys and nonce salts
/// per direction. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub c2s_key: [u8; 32],
    pub s2c_key: [u8; 32],
    pub c2s_salt: [u8; NONCE_SALT_LEN],
    pub s2c_salt: [u8; NONCE_SALT_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Expands the X25519 shared secret into per-direction keys and nonce
/// salts. The HKDF salt binds both ephemerals so each session's schedule
/// is unique even under (impossible) shared-secret collision.
pub fn derive_session_keys(
    shared: &[u8; 32],
    client_ephemeral: &[u8; 32],
    server_ephemeral: &[u8; 32],
) -> SessionKeys {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(client_ephemeral);
    salt[32..].copy_from_slice(server_ephemeral);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);

    let mut keys = SessionKeys {
        c2s_key: [0; 32],
        s2c_key: [0; 32],
        c2s_salt: [0; NONCE_SALT_LEN],
        s2c_salt: [0; NONCE_SALT_LEN],
    };
    // expand() only fails for oversized outputs; these are all fixed-size.
    hkdf.expand(b"acip key c2s", &mut keys.c2s_key).unwrap();
    hkdf.expand(b"acip key s2c", &mut keys.s2c_key).unwrap();
    hkdf.expand(b"acip nonce c2s", &mut keys.c2s_salt).unwrap();
    hkdf.expand(b"acip nonce s2c", &mut keys.s2c_salt).unwrap();
    keys
}

impl SessionKeys {
    /// Splits the schedule into the send/recv cipher pair for `role`.
    pub fn into_ciphers(self, role: Role) -> (DirectionCipher, DirectionCipher) {
        let (send_key, send_salt, recv_key, recv_salt) = match role {
            Role::Client => (self.c2s_key, self.c2s_salt, self.s2c_key, self.s2c_salt),
            Role::Server => (self.s2c_key, self.s2c_salt, self.c2s_key, self.c2s_salt),
        };
        (
            DirectionCipher::new(&send_key, send_salt),
            DirectionCipher::new(&recv_key, recv_salt),
        )
    }
}

/// AEAD state for one direction of traffic.
///
/// The 24-byte nonce is the 16-byte session salt followed by a big-endian
/// 64-bit counter. Counters only move forward; a counter that would pass
/// the budget makes `seal`/`open` fail until the caller rekeys.
pub struct DirectionCipher {
    cipher: XSalsa20Poly1305,
    salt: [u8; NONCE_SALT_LEN],
    counter: u64,
    budget: u64,
}

impl std::fmt::Debug for DirectionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionCipher")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl DirectionCipher {
    pub fn new(key: &[u8; 32], salt: [u8; NONCE_SALT_LEN]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
            salt,
            counter: 0,
            budget: NONCE_BUDGET,
        }
    }

    /// Test hook: shrink the budget so rekey paths trigger quickly.
    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }

    fn nonce(&self) -> Nonce {
        let mut raw = [0u8; 24];
        raw[..NONCE_SALT_LEN].copy_from_slice(&self.salt);
        raw[NONCE_SALT_LEN..].copy_from_slice(&self.counter.to_be_bytes());
        *Nonce::from_slice(&raw)
    }

    /// Encrypts one payload, consuming the next nonce.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter > self.budget {
            return Err(CryptoError::NonceExhausted);
        }
        let sealed = self
            .cipher
            .encrypt(&self.nonce(), plaintext)
            .map_err(|_| CryptoError::AuthFail)?;
        self.counter += 1;
        Ok(sealed)
    }

    /// Decrypts the next in-order payload.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter > self.budget {
            return Err(CryptoError::NonceExhausted);
        }
        let opened = self
            .cipher
            .decrypt(&self.nonce(), ciphertext)
            .map_err(|_| CryptoError::AuthFail)?;
        self.counter += 1;
        Ok(opened)
    }

    /// True once the counter crosses the rekey high-water mark.
    pub fn needs_rekey(&self) -> bool {
        self.counter >= self.budget / 4 * 3
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// Hashes a session password with Argon2id; parameters are fixed at
/// registration time by being baked into the PHC string.
pub fn hash_password(password: &str) -> String {
    use argon2::password_hash::rand_core::OsRng as SaltRng;
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        // Only fails on malformed params; ours are the defaults.
        .expect("argon2id hashing with default params")
        .to_string()
}

/// Verifies a password against a stored Argon2id PHC string.
pub fn verify_password(password: &str, phc: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    use argon2::Argon2;

    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Derives the replacement cipher pair for an in-channel rekey.
///
/// Both sides feed the fresh ephemerals in protocol-role order (client
/// first), so the schedule matches regardless of who initiated.
pub fn rekey_ciphers(
    exchange: X25519KeyExchange,
    remote_ephemeral: &[u8; 32],
    local_ephemeral_is_client: bool,
    role: Role,
) -> (DirectionCipher, DirectionCipher) {
    let local_public = exchange.public_bytes();
    let shared = exchange.derive_shared(remote_ephemeral);
    let (client_eph, server_eph) = if local_ephemeral_is_client {
        (local_public, *remote_ephemeral)
    } else {
        (*remote_ephemeral, local_public)
    };
    derive_session_keys(&shared, &client_eph, &server_eph).into_ciphers(role)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_ciphers() -> (DirectionCipher, DirectionCipher, DirectionCipher, DirectionCipher) {
        let client = X25519KeyExchange::new();
        let server = X25519KeyExchange::new();
        let client_pub = client.public_bytes();
        let server_pub = server.public_bytes();
        let client_keys = derive_session_keys(
            &client.derive_shared(&server_pub),
            &client_pub,
            &server_pub,
        );
        let server_keys = derive_session_keys(
            &server.derive_shared(&client_pub),
            &client_pub,
            &server_pub,
        );
        let (c_send, c_recv) = client_keys.into_ciphers(Role::Client);
        let (s_send, s_recv) = server_keys.into_ciphers(Role::Server);
        (c_send, c_recv, s_send, s_recv)
    }

    #[test]
    fn both_sides_derive_the_same_schedule() {
        let (mut c_send, mut c_recv, mut s_send, mut s_recv) = paired_ciphers();

        let sealed = c_send.seal(b"hello from client").unwrap();
        assert_eq!(s_recv.open(&sealed).unwrap(), b"hello from client");

        let sealed = s_send.seal(b"hello from server").unwrap();
        assert_eq!(c_recv.open(&sealed).unwrap(), b"hello from server");
    }

    #[test]
    fn directions_use_distinct_keys() {
        let (mut c_send, mut c_recv, ..) = paired_ciphers();
        let sealed = c_send.seal(b"looped").unwrap();
        assert!(c_recv.open(&sealed).is_err());
    }

    #[test]
    fn bit_flip_fails_authentication() {
        let client = X25519KeyExchange::new();
        let server = X25519KeyExchange::new();
        let client_pub = client.public_bytes();
        let server_pub = server.public_bytes();
        let keys = derive_session_keys(
            &client.derive_shared(&server_pub),
            &client_pub,
            &server_pub,
        );

        let (mut c_send, _) = keys.clone().into_ciphers(Role::Client);
        let sealed = c_send.seal(b"sensitive frame").unwrap();
        for flipped in 0..sealed.len() {
            let mut copy = sealed.clone();
            copy[flipped] ^= 0x01;
            // Fresh receive cipher per attempt so every flip is checked
            // against the same nonce.
            let (_, mut s_recv) = keys.clone().into_ciphers(Role::Server);
            assert!(matches!(s_recv.open(&copy), Err(CryptoError::AuthFail)));
        }
        let (_, mut s_recv) = keys.into_ciphers(Role::Server);
        assert_eq!(s_recv.open(&sealed).unwrap(), b"sensitive frame");
    }

    #[test]
    fn counters_advance_and_stay_in_sync() {
        let (mut c_send, _, _, mut s_recv) = paired_ciphers();
        for i in 0..10u8 {
            let sealed = c_send.seal(&[i]).unwrap();
            assert_eq!(s_recv.open(&sealed).unwrap(), vec![i]);
        }
        assert_eq!(c_send.counter(), 10);
        assert_eq!(s_recv.counter(), 10);
    }

    #[test]
    fn exhausted_budget_refuses_to_seal() {
        let (c_send, ..) = paired_ciphers();
        let mut cipher = c_send.with_budget(2);
        cipher.seal(b"0").unwrap();
        cipher.seal(b"1").unwrap();
        cipher.seal(b"2").unwrap();
        assert!(matches!(
            cipher.seal(b"3"),
            Err(CryptoError::NonceExhausted)
        ));
    }

    #[test]
    fn rekey_threshold_trips_at_three_quarters() {
        let (c_send, ..) = paired_ciphers();
        let mut cipher = c_send.with_budget(8);
        for _ in 0..5 {
            cipher.seal(b"x").unwrap();
        }
        assert!(!cipher.needs_rekey());
        cipher.seal(b"x").unwrap();
        assert!(cipher.needs_rekey());
    }

    #[test]
    fn password_hash_verifies_and_rejects() {
        let phc = hash_password("test-password-123");
        assert!(phc.starts_with("$argon2id$"));
        assert!(verify_password("test-password-123", &phc));
        assert!(!verify_password("wrong", &phc));
        assert!(!verify_password("test-password-123", "not-a-phc-string"));
    }

    #[test]
    fn rekey_produces_a_fresh_matching_pair() {
        let client_ex = X25519KeyExchange::new();
        let server_ex = X25519KeyExchange::new();
        let client_pub = client_ex.public_bytes();
        let server_pub = server_ex.public_bytes();

        let (mut c_send, _) = rekey_ciphers(client_ex, &server_pub, true, Role::Client);
        let (_, mut s_recv) = rekey_ciphers(server_ex, &client_pub, false, Role::Server);

        assert_eq!(c_send.counter(), 0);
        let sealed = c_send.seal(b"post-rekey").unwrap();
        assert_eq!(s_recv.open(&sealed).unwrap(), b"post-rekey");
    }
}
