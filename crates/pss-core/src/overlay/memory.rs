//! In-process overlay
//!
//! Every node joined to a [`MemoryNetwork`] receives the envelopes whose
//! destination is a prefix of its address. Delivery happens synchronously on
//! the sender's task, so envelopes from one sender arrive in send order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{EnvelopeHandler, Overlay};
use crate::error::{PssError, PssResult};
use crate::identity::PeerAddress;

struct Node {
    id: u64,
    address: PeerAddress,
    handler: Arc<RwLock<Option<EnvelopeHandler>>>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: RwLock<Vec<Node>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    delivered: AtomicU64,
}

/// Shared hub connecting [`MemoryOverlay`] nodes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node with the given address.
    pub fn join(&self, address: PeerAddress) -> MemoryOverlay {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::new(RwLock::new(None));
        self.inner.nodes.write().push(Node {
            id,
            address: address.clone(),
            handler: handler.clone(),
        });
        debug!(%address, "Node joined memory network");
        MemoryOverlay {
            id,
            address,
            network: self.clone(),
            handler,
        }
    }

    /// Detach a node; envelopes addressed to it are dropped from now on.
    pub fn leave(&self, address: &PeerAddress) {
        self.inner.nodes.write().retain(|n| &n.address != address);
    }

    /// Simulate a routing outage: sends fail with `RoutingUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of envelopes handed to node callbacks so far.
    pub fn delivered_count(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.read().len()
    }

    fn route(&self, from: u64, to: &PeerAddress, envelope: Vec<u8>) -> PssResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(PssError::RoutingUnavailable(
                "memory network is offline".to_string(),
            ));
        }

        // Collect targets first so callbacks run without the node list lock.
        let targets: Vec<_> = self
            .inner
            .nodes
            .read()
            .iter()
            .filter(|n| n.id != from && n.address.matches(to))
            .map(|n| n.handler.clone())
            .collect();

        trace!(%to, targets = targets.len(), len = envelope.len(), "Routing envelope");

        for handler in targets {
            if let Some(handler) = handler.read().as_ref() {
                handler(envelope.clone());
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryOverlay {
    id: u64,
    address: PeerAddress,
    network: MemoryNetwork,
    handler: Arc<RwLock<Option<EnvelopeHandler>>>,
}

impl Overlay for MemoryOverlay {
    fn base_address(&self) -> PeerAddress {
        self.address.clone()
    }

    fn send_envelope(&self, to: &PeerAddress, envelope: Vec<u8>) -> PssResult<()> {
        self.network.route(self.id, to, envelope)
    }

    fn on_envelope(&self, handler: EnvelopeHandler) {
        *self.handler.write() = Some(handler);
    }
}
