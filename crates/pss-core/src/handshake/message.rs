//! Handshake wire messages
//!
//! Both messages travel asymmetrically sealed on the reserved handshake
//! topic, so the sender identity comes from the sealed box, not from the
//! message body.
//!
//! ```text
//! Initiator                                   Responder
//!   |                                             |
//!   |--- Request {id, topic, eph_i, limit} ------>|
//!   |                                             |  key = HKDF(DH(eph_r, eph_i))
//!   |<-- Response {id, topic, eph_r, limit} ------|  install key
//!   |                                             |
//!   |  key = HKDF(DH(eph_i, eph_r))               |
//!   |  install key                                |
//! ```

use serde::{Deserialize, Serialize};

use crate::error::PssError;
use crate::identity::PeerAddress;
use crate::topic::Topic;

/// Key negotiation control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// Initiator to responder
    Request {
        /// Correlation id echoed by the response
        request_id: u64,
        /// Topic the session key is for
        topic: Topic,
        /// Initiator's ephemeral X25519 share
        ephemeral: [u8; 32],
        /// Requested use limit for the key
        limit: u16,
        /// Where the response should be routed
        reply_to: PeerAddress,
    },

    /// Responder to initiator
    Response {
        /// Correlation id of the request
        request_id: u64,
        /// Topic the session key is for
        topic: Topic,
        /// Responder's ephemeral X25519 share
        ephemeral: [u8; 32],
        /// Agreed use limit (never above the requested one)
        limit: u16,
    },
}

impl HandshakeMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            HandshakeMessage::Request { request_id, .. }
            | HandshakeMessage::Response { request_id, .. } => *request_id,
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            HandshakeMessage::Request { topic, .. } | HandshakeMessage::Response { topic, .. } => {
                *topic
            }
        }
    }

    /// Encode message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, PssError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, PssError> {
        postcard::from_bytes(data)
            .map_err(|e| PssError::HandshakeProtocolError(format!("Malformed message: {}", e)))
    }
}
