//! pss core library
//!
//! Encrypted topic messaging over an overlay network, with symmetric session
//! keys negotiated per peer and topic.
//!
//! ## Overview
//!
//! Nodes are identified by X25519 public keys and reached through overlay
//! addresses. The overlay only moves envelopes; pss decides how each one is
//! protected:
//!
//! - **Symmetric**: under a session key from a handshake. Every key is valid
//!   for a fixed number of uses, counted on both sides, and is renegotiated
//!   when it runs out.
//! - **Asymmetric**: sealed to the recipient's static key, used for
//!   handshakes and as a fallback before a session exists.
//! - **Raw**: unencrypted, opt-in on both ends.
//!
//! On top of that, [`Client`] runs any [`Protocol`] against a
//! [`VirtualStream`] per peer, so protocol code written against
//! [`MsgReadWriter`] does not know it is not on a direct connection.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pss_core::{Client, Keypair, MemoryNetwork, PeerAddress, Pss, PssConfig};
//! use pss_core::ping::{ping_protocol, ping_topic, Ping};
//! use tokio_util::sync::CancellationToken;
//!
//! let network = MemoryNetwork::new();
//! let keypair = Keypair::generate();
//! let address = PeerAddress::from_public_key(&keypair.public_key());
//! let pss = Pss::start(keypair, Arc::new(network.join(address)), PssConfig::default())?;
//!
//! let client = Client::new(pss);
//! let (ping, mut handle) = Ping::new(true);
//! client.run_protocol(CancellationToken::new(), ping_protocol(ping))?;
//! client.add_pss_peer(remote_key, remote_address, ping_topic()).await?;
//! handle.ping()?;
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod overlay;
pub mod ping;
pub mod pss;
pub mod router;
pub mod topic;

// Re-exports
pub use client::{pipe, Client, Msg, MsgReadWriter, PeerContext, PeerPool, Protocol, VirtualStream};
pub use config::{HandshakeParams, PssConfig};
pub use crypto::KeyId;
pub use envelope::{Envelope, Flags, ENVELOPE_VERSION};
pub use error::{PssError, PssResult};
pub use handshake::{HandshakeController, KeyInfo, KeyResolution, SessionState};
pub use identity::{Keypair, PeerAddress, PublicKey};
pub use overlay::{GossipOverlay, MemoryNetwork, MemoryOverlay, Overlay};
pub use pss::Pss;
pub use router::{HandlerCaps, IncomingMessage, MessageKind, TopicHandler};
pub use topic::Topic;
