//! Overlay routing seam
//!
//! pss does not route envelopes itself. It hands encoded envelopes to an
//! [`Overlay`] together with a full or partial destination address, and
//! receives inbound envelopes through a callback registered once at startup.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryNetwork`] / [`MemoryOverlay`]: in-process hub, used by tests and
//!   simulations.
//! - [`GossipOverlay`]: iroh endpoint + iroh-gossip swarm topic.

pub mod gossip;
pub mod memory;

pub use gossip::GossipOverlay;
pub use memory::{MemoryNetwork, MemoryOverlay};

use crate::error::PssResult;
use crate::identity::PeerAddress;

/// Callback receiving encoded envelopes from the overlay.
pub type EnvelopeHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Send/receive primitive of the underlying routing network.
pub trait Overlay: Send + Sync + 'static {
    /// Address of the local node in the overlay.
    fn base_address(&self) -> PeerAddress;

    /// Hand an encoded envelope to the overlay for delivery to every node
    /// matching `to` (an empty address matches all nodes).
    ///
    /// Delivery is best-effort; an error means the overlay could not accept
    /// the envelope at all.
    fn send_envelope(&self, to: &PeerAddress, envelope: Vec<u8>) -> PssResult<()>;

    /// Register the inbound callback. Replaces any previous callback.
    fn on_envelope(&self, handler: EnvelopeHandler);
}
