//! Topic-addressed envelopes
//!
//! ## Wire Format
//!
//! ```text
//! +----------+-------+-------+-------+----------------------+
//! | version  | topic | flags | nonce | payload              |
//! | (1 byte) | (4)   | (1)   | (12)  | (variable, postcard) |
//! +----------+-------+-------+-------+----------------------+
//! ```
//!
//! The payload is the ChaCha20-Poly1305 ciphertext for symmetric envelopes,
//! an encoded [`SealedBox`](crate::crypto::SealedBox) for asymmetric ones and
//! the plain message for raw ones.

use serde::{Deserialize, Serialize};

use crate::crypto::NONCE_SIZE;
use crate::error::PssError;
use crate::identity::PeerAddress;
use crate::topic::Topic;

/// Current envelope protocol version
pub const ENVELOPE_VERSION: u8 = 1;

/// How the envelope payload is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flags(u8);

impl Flags {
    pub const SYMMETRIC: Flags = Flags(0x01);
    pub const ASYMMETRIC: Flags = Flags(0x02);
    pub const RAW: Flags = Flags(0x04);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_symmetric(self) -> bool {
        self == Self::SYMMETRIC
    }

    pub fn is_asymmetric(self) -> bool {
        self == Self::ASYMMETRIC
    }

    pub fn is_raw(self) -> bool {
        self == Self::RAW
    }
}

/// A single message unit travelling over the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for forward compatibility
    pub version: u8,
    /// Topic the message is scoped to
    pub topic: Topic,
    /// Protection mode of the payload
    pub flags: Flags,
    /// Nonce used for encryption (ignored for raw envelopes)
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext, sealed box, or raw message
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(topic: Topic, flags: Flags, nonce: [u8; NONCE_SIZE], payload: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            topic,
            flags,
            nonce,
            payload,
        }
    }

    /// Encode envelope to bytes using postcard
    pub fn to_bytes(&self) -> Result<Vec<u8>, PssError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode envelope from bytes, rejecting unknown versions and flag sets.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PssError> {
        let envelope: Envelope = postcard::from_bytes(data)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(PssError::EnvelopeVersionUnsupported(envelope.version));
        }
        let flags = envelope.flags;
        if !(flags.is_symmetric() || flags.is_asymmetric() || flags.is_raw()) {
            return Err(PssError::Serialization(format!(
                "Invalid envelope flags: {:#04x}",
                flags.bits()
            )));
        }
        Ok(envelope)
    }
}

/// Envelope bytes paired with the destination address, as handed to the
/// overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Full or partial destination address
    pub to: PeerAddress,
    /// Encoded [`Envelope`]
    pub envelope: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, PssError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PssError> {
        Ok(postcard::from_bytes(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SymmetricCipher;

    fn sample() -> Envelope {
        Envelope::new(
            Topic::from_protocol("ping", 1),
            Flags::SYMMETRIC,
            SymmetricCipher::generate_nonce(),
            vec![1, 2, 3, 4],
        )
    }

    #[test]
    fn test_envelope_bytes_roundtrip() {
        let envelope = sample();
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut envelope = sample();
        envelope.version = 99;
        let bytes = envelope.to_bytes().unwrap();
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(PssError::EnvelopeVersionUnsupported(99))
        ));
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let mut envelope = sample();
        envelope.flags = Flags(0x03);
        let bytes = envelope.to_bytes().unwrap();
        assert!(Envelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Envelope::from_bytes(&[]).is_err());
        assert!(Envelope::from_bytes(&[0xff; 3]).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            to: PeerAddress(vec![0xaa, 0xbb]),
            envelope: sample().to_bytes().unwrap(),
        };
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }
}
