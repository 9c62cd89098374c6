//! Node identity and peer addressing
//!
//! A node is identified by an X25519 key pair. The public half is the stable
//! cross-reference key for sessions and pool entries; its canonical string
//! form is `0x`-prefixed lowercase hex.
//!
//! [`PeerAddress`] is the overlay address an envelope is routed to. It is
//! opaque to pss and only ever compared by prefix.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};

use crate::error::PssError;

/// Length of a public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Public identity of a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Parse a public key from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PssError> {
        let key: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            PssError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(PublicKey(key))
    }

    /// Short form for log lines (first 4 bytes).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", self.short())
    }
}

impl FromStr for PublicKey {
    type Err = PssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| PssError::InvalidPublicKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// Static X25519 key pair of the local node.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Build a key pair from a 32-byte secret scalar.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey(*X25519PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub(crate) fn diffie_hellman(&self, other: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(&other.to_x25519())
    }

    /// Secret bytes, for persisting the identity.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Raw overlay address of a node.
///
/// An empty address, or any prefix of a node's address, is understood by the
/// overlay as "deliver to every node matching this prefix".
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerAddress(pub Vec<u8>);

impl PeerAddress {
    /// Default base address for a public key: BLAKE3 of the key bytes.
    pub fn from_public_key(key: &PublicKey) -> Self {
        PeerAddress(blake3::hash(key.as_bytes()).as_bytes().to_vec())
    }

    /// Whether `self` (a full address) is covered by `prefix`.
    pub fn matches(&self, prefix: &PeerAddress) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PeerAddress {
    fn from(bytes: Vec<u8>) -> Self {
        PeerAddress(bytes)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

impl FromStr for PeerAddress {
    type Err = PssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        hex::decode(digits)
            .map(PeerAddress)
            .map_err(|e| PssError::Serialization(format!("Invalid address: {}", e)))
    }
}
