//! Long-term identity keys: Ed25519 credentials for challenge signatures,
//! parsers that normalize OpenSSH and GPG public keys to the raw 32-byte
//! form, and the known-hosts trust store.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Environment variable that disables known-hosts enforcement (test runs).
pub const INSECURE_NO_HOST_IDENTITY_CHECK: &str = "ASCII_CHAT_INSECURE_NO_HOST_IDENTITY_CHECK";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed key material: {0}")]
    Malformed(&'static str),
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("host key mismatch for {host}:{port}")]
    HostKeyMismatch { host: String, port: u16 },
}

/// Signing credentials for one endpoint.
#[derive(Clone)]
pub struct NodeCredentials {
    signing: SigningKey,
    pub verifying: VerifyingKey,
}

impl fmt::Debug for NodeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCredentials")
            .field("verifying", &hex(self.verifying.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl NodeCredentials {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// Loads a 32-byte seed stored as lowercase hex.
    pub fn load_seed_file(path: &Path) -> Result<Self, IdentityError> {
        let text = Zeroizing::new(fs::read_to_string(path)?);
        let seed = parse_hex32(text.trim())
            .ok_or(IdentityError::Malformed("seed file must hold 64 hex chars"))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying.verify(message, signature).is_ok()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }
}

/// A peer's Ed25519 public key, whatever format it arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey(pub [u8; 32]);

impl IdentityKey {
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|_| IdentityError::Malformed("not a valid ed25519 point"))
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex(&self.0)
    }

    /// Parses raw lowercase/uppercase hex (64 chars).
    pub fn from_hex(text: &str) -> Result<Self, IdentityError> {
        parse_hex32(text)
            .map(IdentityKey)
            .ok_or(IdentityError::Malformed("expected 64 hex characters"))
    }

    /// Parses an OpenSSH public key line: `ssh-ed25519 <base64> [comment]`.
    pub fn from_openssh(line: &str) -> Result<Self, IdentityError> {
        let mut parts = line.split_whitespace();
        let algo = parts
            .next()
            .ok_or(IdentityError::Malformed("empty ssh key line"))?;
        if algo != "ssh-ed25519" {
            return Err(IdentityError::UnsupportedAlgorithm(algo.to_string()));
        }
        let blob = parts
            .next()
            .ok_or(IdentityError::Malformed("ssh key line missing blob"))?;
        let blob = BASE64
            .decode(blob)
            .map_err(|_| IdentityError::Malformed("ssh key blob is not base64"))?;

        // Blob layout: u32 len + "ssh-ed25519" + u32 len + 32 key bytes.
        let mut cursor = &blob[..];
        let algo_inner = read_ssh_string(&mut cursor)?;
        if algo_inner != b"ssh-ed25519" {
            return Err(IdentityError::Malformed("ssh blob algorithm mismatch"));
        }
        let key = read_ssh_string(&mut cursor)?;
        let key: [u8; 32] = key
            .try_into()
            .map_err(|_| IdentityError::Malformed("ssh ed25519 key must be 32 bytes"))?;
        Ok(IdentityKey(key))
    }

    /// Parses a GPG public-key packet (binary or ASCII-armored) holding an
    /// EdDSA (algorithm 22) Ed25519 key.
    pub fn from_gpg(input: &[u8]) -> Result<Self, IdentityError> {
        let binary;
        let data: &[u8] = if input.starts_with(b"-----BEGIN") {
            binary = dearmor(input)?;
            &binary
        } else {
            input
        };
        parse_gpg_key_packet(data)
    }

    /// Accepts any supported textual form: hex, OpenSSH line, or armored GPG.
    pub fn parse(text: &str) -> Result<Self, IdentityError> {
        let trimmed = text.trim();
        if trimmed.starts_with("ssh-") {
            Self::from_openssh(trimmed)
        } else if trimmed.starts_with("-----BEGIN") {
            Self::from_gpg(trimmed.as_bytes())
        } else {
            Self::from_hex(trimmed)
        }
    }
}

fn read_ssh_string<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], IdentityError> {
    if cursor.len() < 4 {
        return Err(IdentityError::Malformed("ssh blob truncated"));
    }
    let len = u32::from_be_bytes(cursor[..4].try_into().unwrap()) as usize;
    *cursor = &cursor[4..];
    if cursor.len() < len {
        return Err(IdentityError::Malformed("ssh blob truncated"));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn dearmor(input: &[u8]) -> Result<Vec<u8>, IdentityError> {
    let text =
        std::str::from_utf8(input).map_err(|_| IdentityError::Malformed("armor is not utf-8"))?;
    let mut body = String::new();
    let mut in_body = false;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN") {
            in_body = true;
            continue;
        }
        if line.starts_with("-----END") {
            break;
        }
        if !in_body || line.is_empty() || line.contains(':') {
            // Armor headers (Version:, Comment:) precede the blank line.
            continue;
        }
        if line.starts_with('=') {
            // CRC24 trailer.
            continue;
        }
        body.push_str(line);
    }
    BASE64
        .decode(body.as_bytes())
        .map_err(|_| IdentityError::Malformed("armor body is not base64"))
}

/// Ed25519 curve OID inside a version-4 EdDSA key packet.
const ED25519_OID: [u8; 9] = [0x2B, 0x06, 0x01, 0x04, 0x01, 0xDA, 0x47, 0x0F, 0x01];
const GPG_ALGO_EDDSA: u8 = 22;

fn parse_gpg_key_packet(data: &[u8]) -> Result<IdentityKey, IdentityError> {
    if data.is_empty() {
        return Err(IdentityError::Malformed("empty gpg packet"));
    }
    let header = data[0];
    if header & 0x80 == 0 {
        return Err(IdentityError::Malformed("not an openpgp packet"));
    }

    // Resolve the packet tag and body offset for old- and new-format headers.
    let (tag, body) = if header & 0x40 != 0 {
        let tag = header & 0x3F;
        if data.len() < 2 {
            return Err(IdentityError::Malformed("gpg packet truncated"));
        }
        let first = data[1];
        let (len, off) = match first {
            0..=191 => (first as usize, 2),
            192..=223 => {
                if data.len() < 3 {
                    return Err(IdentityError::Malformed("gpg packet truncated"));
                }
                ((((first as usize) - 192) << 8) + data[2] as usize + 192, 3)
            }
            255 => {
                if data.len() < 6 {
                    return Err(IdentityError::Malformed("gpg packet truncated"));
                }
                (
                    u32::from_be_bytes(data[2..6].try_into().unwrap()) as usize,
                    6,
                )
            }
            _ => return Err(IdentityError::Malformed("unsupported gpg partial length")),
        };
        if data.len() < off + len {
            return Err(IdentityError::Malformed("gpg packet truncated"));
        }
        (tag, &data[off..off + len])
    } else {
        let tag = (header >> 2) & 0x0F;
        let len_type = header & 0x03;
        let (len, off) = match len_type {
            0 => {
                if data.len() < 2 {
                    return Err(IdentityError::Malformed("gpg packet truncated"));
                }
                (data[1] as usize, 2)
            }
            1 => {
                if data.len() < 3 {
                    return Err(IdentityError::Malformed("gpg packet truncated"));
                }
                (u16::from_be_bytes(data[1..3].try_into().unwrap()) as usize, 3)
            }
            2 => {
                if data.len() < 5 {
                    return Err(IdentityError::Malformed("gpg packet truncated"));
                }
                (
                    u32::from_be_bytes(data[1..5].try_into().unwrap()) as usize,
                    5,
                )
            }
            _ => return Err(IdentityError::Malformed("indeterminate gpg length")),
        };
        if data.len() < off + len {
            return Err(IdentityError::Malformed("gpg packet truncated"));
        }
        (tag, &data[off..off + len])
    };

    // Tags 6 (public key) and 14 (public subkey) both carry key material.
    if tag != 6 && tag != 14 {
        return Err(IdentityError::Malformed("not a gpg public-key packet"));
    }
    if body.len() < 6 || body[0] != 4 {
        return Err(IdentityError::Malformed("only v4 gpg keys are supported"));
    }
    let algo = body[5];
    if algo != GPG_ALGO_EDDSA {
        return Err(IdentityError::UnsupportedAlgorithm(format!(
            "gpg algorithm {algo}"
        )));
    }
    let rest = &body[6..];
    if rest.is_empty() || rest[0] as usize != ED25519_OID.len() || rest.len() < 1 + ED25519_OID.len()
    {
        return Err(IdentityError::Malformed("gpg curve oid truncated"));
    }
    if rest[1..1 + ED25519_OID.len()] != ED25519_OID {
        return Err(IdentityError::UnsupportedAlgorithm("gpg curve".into()));
    }
    let mpi = &rest[1 + ED25519_OID.len()..];
    if mpi.len() < 2 {
        return Err(IdentityError::Malformed("gpg key mpi truncated"));
    }
    let bits = u16::from_be_bytes(mpi[..2].try_into().unwrap()) as usize;
    let bytes = bits.div_ceil(8);
    let mpi = &mpi[2..];
    if mpi.len() < bytes {
        return Err(IdentityError::Malformed("gpg key mpi truncated"));
    }
    // EdDSA keys use the 0x40-prefixed native encoding.
    if bytes != 33 || mpi[0] != 0x40 {
        return Err(IdentityError::Malformed("gpg eddsa key must be 0x40-prefixed"));
    }
    let key: [u8; 32] = mpi[1..33].try_into().unwrap();
    Ok(IdentityKey(key))
}

/// Known-hosts store: one line per host, `{host} {port} {hex-public-key}`.
#[derive(Debug)]
pub struct KnownHosts {
    path: Option<PathBuf>,
    entries: HashMap<(String, u16), IdentityKey>,
}

/// Outcome of checking a server identity against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCheck {
    /// Key matches the recorded one.
    Known,
    /// Host has no record yet; callers typically record on first use.
    Unknown,
    /// Key differs from the recorded one: possible impersonation.
    Mismatch,
}

impl KnownHosts {
    pub fn empty() -> Self {
        Self {
            path: None,
            entries: HashMap::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let path = path.into();
        let mut entries = HashMap::new();
        if path.exists() {
            for line in fs::read_to_string(&path)?.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let mut parts = line.split_whitespace();
                let (Some(host), Some(port), Some(key)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(IdentityError::Malformed("known-hosts line needs 3 fields"));
                };
                let port: u16 = port
                    .parse()
                    .map_err(|_| IdentityError::Malformed("known-hosts port"))?;
                entries.insert((host.to_string(), port), IdentityKey::from_hex(key)?);
            }
        }
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn check(&self, host: &str, port: u16, key: &IdentityKey) -> HostCheck {
        match self.entries.get(&(host.to_string(), port)) {
            Some(recorded) if recorded == key => HostCheck::Known,
            Some(_) => HostCheck::Mismatch,
            None => HostCheck::Unknown,
        }
    }

    /// Records a newly accepted host key, appending to the backing file.
    pub fn record(&mut self, host: &str, port: u16, key: IdentityKey) -> Result<(), IdentityError> {
        self.entries.insert((host.to_string(), port), key);
        if let Some(path) = &self.path {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{host} {port} {}", key.to_hex())?;
        }
        Ok(())
    }

    /// True when the insecure env override disables enforcement.
    pub fn enforcement_disabled() -> bool {
        std::env::var(INSECURE_NO_HOST_IDENTITY_CHECK).is_ok()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_hex32(text: &str) -> Option<[u8; 32]> {
    if text.len() != 64 || !text.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
        let chunk = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(chunk, 16).ok()?;
    }
    Some(out)
}
