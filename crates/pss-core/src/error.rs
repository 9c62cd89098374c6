//! Error types for pss

use thiserror::Error;

use crate::identity::PublicKey;
use crate::topic::Topic;

/// Main error type for pss operations
#[derive(Error, Debug)]
pub enum PssError {
    /// No handshake response arrived within the request timeout
    #[error("Handshake with {peer} on topic {topic} timed out")]
    HandshakeTimeout {
        /// Remote peer
        peer: PublicKey,
        /// Session topic
        topic: Topic,
    },

    /// The peer answered with something that is not a valid handshake response
    #[error("Handshake protocol error: {0}")]
    HandshakeProtocolError(String),

    /// Every key of the session has been used up and no new key was negotiated yet
    #[error("Symmetric key for {peer} on topic {topic} is exhausted")]
    KeyExhausted {
        /// Remote peer
        peer: PublicKey,
        /// Session topic
        topic: Topic,
    },

    /// Neither a session key nor a usable public key is available for the peer
    #[error("No key available for {peer} on topic {topic}")]
    NoKeyAvailable {
        /// Remote peer
        peer: PublicKey,
        /// Session topic
        topic: Topic,
    },

    /// A virtual stream already exists for this (topic, peer)
    #[error("Peer {peer} already added on topic {topic}")]
    DuplicatePeer {
        /// Remote peer
        peer: PublicKey,
        /// Protocol topic
        topic: Topic,
    },

    /// A handler is already registered for the topic
    #[error("Topic {0} already has a registered handler")]
    TopicAlreadyRegistered(Topic),

    /// The operation was cancelled by its caller
    #[error("Operation cancelled")]
    Cancelled,

    /// The overlay could not accept the envelope
    #[error("Routing unavailable: {0}")]
    RoutingUnavailable(String),

    /// Read or write on a virtual stream that was removed
    #[error("Stream to {peer} on topic {topic} is closed")]
    StreamClosed {
        /// Remote peer
        peer: PublicKey,
        /// Protocol topic
        topic: Topic,
    },

    /// Peer added on a topic whose protocol is not running
    #[error("No protocol running on topic {0}")]
    ProtocolNotRunning(Topic),

    /// Raw (unencrypted) messaging is disabled in the configuration
    #[error("Raw messages are disabled")]
    RawDisabled,

    /// No overlay address is known for the public key
    #[error("No address known for peer {0}")]
    UnknownPeer(PublicKey),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Envelope protocol version not supported
    #[error("Envelope version {0} is not supported")]
    EnvelopeVersionUnsupported(u8),

    /// Malformed public key string or bytes
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Malformed topic string
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for PssError {
    fn from(e: postcard::Error) -> Self {
        PssError::Serialization(e.to_string())
    }
}

/// Result type alias using PssError
pub type PssResult<T> = Result<T, PssError>;
