//! Protocol topics
//!
//! A topic is a 4-byte identifier scoping envelopes to one higher-level
//! protocol. Topics are derived from a protocol's name and version so that
//! peers agree on them without coordination:
//!
//! ```text
//! topic = BLAKE3("{name}:{version}")[..4]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PssError;

/// Length of a topic in bytes.
pub const TOPIC_LENGTH: usize = 4;

/// Input hashed to obtain the reserved handshake topic.
const HANDSHAKE_TOPIC_SEED: &[u8] = b"pss:handshake";

/// Fixed-size protocol identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Topic(pub [u8; TOPIC_LENGTH]);

impl Topic {
    /// Derive a topic from arbitrary bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut topic = [0u8; TOPIC_LENGTH];
        topic.copy_from_slice(&hash.as_bytes()[..TOPIC_LENGTH]);
        Topic(topic)
    }

    /// Derive the topic for a protocol name and version.
    pub fn from_protocol(name: &str, version: u32) -> Self {
        Self::from_bytes(format!("{}:{}", name, version).as_bytes())
    }

    /// The topic reserved for handshake control messages.
    pub fn handshake() -> Self {
        Self::from_bytes(HANDSHAKE_TOPIC_SEED)
    }

    /// Whether this is the reserved handshake topic.
    pub fn is_handshake(&self) -> bool {
        *self == Self::handshake()
    }

    pub fn as_bytes(&self) -> &[u8; TOPIC_LENGTH] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self)
    }
}

impl FromStr for Topic {
    type Err = PssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| PssError::InvalidTopic(e.to_string()))?;
        let topic: [u8; TOPIC_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            PssError::InvalidTopic(format!("expected {} bytes, got {}", TOPIC_LENGTH, b.len()))
        })?;
        Ok(Topic(topic))
    }
}
