//! Gossip-backed overlay using iroh-gossip
//!
//! All pss nodes join one well-known swarm topic. Outbound envelopes are
//! wrapped in a [`Frame`] carrying the destination address and broadcast;
//! every node keeps only the frames whose destination is a prefix of its own
//! address.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  GossipOverlay                                       │
//! │  ├── Endpoint (QUIC transport, NAT traversal)        │
//! │  ├── Gossip (swarm topic pub/sub)                    │
//! │  ├── outbox task: mpsc -> GossipSender::broadcast    │
//! │  └── inbox task: GossipReceiver -> address filter    │
//! │                  -> EnvelopeHandler                  │
//! └──────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{EnvelopeHandler, Overlay};
use crate::envelope::Frame;
use crate::error::{PssError, PssResult};
use crate::identity::PeerAddress;

/// Seed of the swarm topic every pss node subscribes to.
const SWARM_TOPIC_SEED: &[u8] = b"pss-swarm-v1";

/// Max gossip message size. Envelopes are small; leave room for frames.
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Well-known gossip topic of the pss swarm.
pub fn swarm_topic() -> TopicId {
    TopicId::from_bytes(*blake3::hash(SWARM_TOPIC_SEED).as_bytes())
}

/// Overlay adapter over an iroh endpoint and gossip swarm.
pub struct GossipOverlay {
    endpoint: Endpoint,
    router: Router,
    address: PeerAddress,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    handler: Arc<RwLock<Option<EnvelopeHandler>>>,
    cancel: CancellationToken,
}

impl GossipOverlay {
    /// Bind an endpoint, join the swarm topic and start the relay tasks.
    ///
    /// # Arguments
    /// * `address` - pss address of the local node (frames are filtered by it)
    /// * `secret_key` - iroh identity; a fresh one is generated when `None`
    /// * `bootstrap` - endpoints already in the swarm (empty for the first node)
    pub async fn bind(
        address: PeerAddress,
        secret_key: Option<SecretKey>,
        bootstrap: Vec<EndpointAddr>,
    ) -> PssResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));

        let static_provider = StaticProvider::new();
        let mut bootstrap_ids: Vec<EndpointId> = Vec::with_capacity(bootstrap.len());
        for peer in bootstrap {
            bootstrap_ids.push(peer.id);
            static_provider.add_endpoint_info(peer);
        }

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider)
            .bind()
            .await
            .map_err(|e| PssError::RoutingUnavailable(format!("Failed to bind endpoint: {}", e)))?;
        info!(endpoint_id = %endpoint.id(), %address, "Gossip overlay endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        let topic = gossip
            .subscribe(swarm_topic(), bootstrap_ids)
            .await
            .map_err(|e| PssError::RoutingUnavailable(format!("Failed to subscribe: {}", e)))?;
        let (sender, receiver) = topic.split();

        let cancel = CancellationToken::new();
        let handler: Arc<RwLock<Option<EnvelopeHandler>>> = Arc::new(RwLock::new(None));
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_outbox(sender, outbox_rx, cancel.clone()));
        tokio::spawn(run_inbox(
            receiver,
            address.clone(),
            handler.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            endpoint,
            router,
            address,
            outbox,
            handler,
            cancel,
        })
    }

    /// This node's endpoint ID (what other nodes bootstrap from)
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Stop the relay tasks and close the endpoint.
    ///
    /// Sends after this fail with `RoutingUnavailable`.
    pub async fn shutdown(&self) -> PssResult<()> {
        info!("Shutting down gossip overlay");
        self.cancel.cancel();
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        Ok(())
    }
}

impl Overlay for GossipOverlay {
    fn base_address(&self) -> PeerAddress {
        self.address.clone()
    }

    fn send_envelope(&self, to: &PeerAddress, envelope: Vec<u8>) -> PssResult<()> {
        let shut_down = || PssError::RoutingUnavailable("gossip overlay is shut down".to_string());
        if self.cancel.is_cancelled() {
            return Err(shut_down());
        }
        let frame = Frame {
            to: to.clone(),
            envelope,
        }
        .encode()?;
        self.outbox
            .send(frame)
            .map_err(|_| shut_down())
    }

    fn on_envelope(&self, handler: EnvelopeHandler) {
        *self.handler.write() = Some(handler);
    }
}

async fn run_outbox(
    sender: GossipSender,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sender.broadcast(frame.into()).await {
            warn!(error = ?e, "Failed to broadcast frame");
        }
    }
    debug!("Gossip outbox stopped");
}

async fn run_inbox(
    mut receiver: GossipReceiver,
    address: PeerAddress,
    handler: Arc<RwLock<Option<EnvelopeHandler>>>,
    cancel: CancellationToken,
) {
    use n0_future::StreamExt;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = receiver.try_next() => event,
        };
        match event {
            Ok(Some(Event::Received(msg))) => {
                let frame = match Frame::decode(&msg.content) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(from = %msg.delivered_from, error = %e, "Dropping malformed frame");
                        continue;
                    }
                };
                if !address.matches(&frame.to) {
                    trace!(to = %frame.to, "Frame not addressed to us");
                    continue;
                }
                if let Some(handler) = handler.read().as_ref() {
                    handler(frame.envelope);
                }
            }
            Ok(Some(Event::NeighborUp(peer))) => info!(?peer, "Swarm neighbor joined"),
            Ok(Some(Event::NeighborDown(peer))) => info!(?peer, "Swarm neighbor left"),
            Ok(Some(Event::Lagged)) => warn!("Lagged behind on swarm topic"),
            Ok(None) => {
                debug!("Swarm subscription closed");
                break;
            }
            Err(e) => {
                warn!(error = ?e, "Error receiving from swarm topic");
                break;
            }
        }
    }
    debug!("Gossip inbox stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swarm_topic_stable() {
        assert_eq!(swarm_topic(), swarm_topic());
    }

    #[tokio::test]
    async fn test_gossip_overlay_binds() {
        let address = PeerAddress(vec![0xaa; 32]);
        let overlay = GossipOverlay::bind(address.clone(), None, vec![])
            .await
            .expect("Failed to bind gossip overlay");
        assert_eq!(overlay.base_address(), address);
        assert!(overlay.send_envelope(&PeerAddress::default(), vec![1, 2, 3]).is_ok());
        overlay.shutdown().await.unwrap();
        assert!(matches!(
            overlay.send_envelope(&PeerAddress::default(), vec![1, 2, 3]),
            Err(PssError::RoutingUnavailable(_))
        ));
    }
}
