//! Protocol client
//!
//! Runs arbitrary [`Protocol`]s over pss. Each running protocol owns one
//! topic; each remote peer on that topic gets a [`VirtualStream`] in the
//! [`PeerPool`] and its own task running the protocol against it.
//!
//! ```text
//! Pss receive loop ──► topic handler ──► PeerPool[(topic, peer)] ──► VirtualStream
//!                                                                      │
//! protocol task ◄──────────────── read_msg ◄───────────────────────────┘
//! protocol task ──► write_msg ──► ensure_key ──► Pss::send_sym ──► Overlay
//! ```
//!
//! A peer joins the pool either through [`Client::add_pss_peer`] (we
//! initiate) or when its first session message arrives on a running topic
//! (it initiated).

pub mod pool;
pub mod protocol;
pub mod stream;

pub use pool::PeerPool;
pub use protocol::{pipe, Msg, MsgReadWriter, PeerContext, PipeEnd, Protocol};
pub use stream::VirtualStream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{PssError, PssResult};
use crate::identity::{PeerAddress, PublicKey};
use crate::pss::Pss;
use crate::router::{HandlerCaps, IncomingMessage, MessageKind, TopicHandler};
use crate::topic::Topic;

#[derive(Clone)]
struct RunningProtocol {
    protocol: Protocol,
    /// Cancelled with the caller's context or on client shutdown
    cancel: CancellationToken,
}

struct ClientInner {
    pss: Arc<Pss>,
    pool: PeerPool,
    protocols: RwLock<HashMap<Topic, RunningProtocol>>,
    next_stream_id: AtomicU64,
    cancel: CancellationToken,
}

/// Runs protocols over pss, one virtual stream per peer.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(pss: Arc<Pss>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                pss,
                pool: PeerPool::new(),
                protocols: RwLock::new(HashMap::new()),
                next_stream_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn pss(&self) -> &Arc<Pss> {
        &self.inner.pss
    }

    /// Start serving `protocol` on its topic.
    ///
    /// Inbound session messages on the topic are routed to the sender's
    /// stream; a sender without a stream gets one and a protocol run. Once
    /// `ctx` is cancelled no new peers are accepted and the runs' own
    /// contexts are cancelled; existing streams keep delivering so the runs
    /// can drain.
    pub fn run_protocol(&self, ctx: CancellationToken, protocol: Protocol) -> PssResult<()> {
        let topic = protocol.topic();
        let cancel = self.inner.cancel.child_token();
        {
            let mut protocols = self.inner.protocols.write();
            if protocols.contains_key(&topic) {
                return Err(PssError::TopicAlreadyRegistered(topic));
            }
            protocols.insert(
                topic,
                RunningProtocol {
                    protocol: protocol.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let handler: TopicHandler = Arc::new(move |msg| match weak.upgrade() {
            Some(inner) => inner.on_message(topic, msg),
            None => Ok(()),
        });
        if let Err(e) = self.inner.pss.register(topic, handler, HandlerCaps::default()) {
            self.inner.protocols.write().remove(&topic);
            return Err(e);
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });

        info!(name = %protocol.name, version = protocol.version, %topic, "Protocol running");
        Ok(())
    }

    /// Add a peer on a running protocol's topic and start the protocol
    /// against it.
    ///
    /// The initial handshake runs (with bounded retries) before the stream is
    /// published, so the protocol's first write does not wait for it.
    pub async fn add_pss_peer(&self, peer: PublicKey, address: PeerAddress, topic: Topic) -> PssResult<()> {
        let running = self.inner.running(&topic)?;
        if self.inner.pool.get(&topic, &peer).is_some() {
            return Err(PssError::DuplicatePeer { peer, topic });
        }

        let pss = &self.inner.pss;
        pss.set_peer_public_key(peer, topic, address.clone());
        let retries = pss.config().handshake.handshake_retries;
        pss.ensure_key(&peer, &topic, &running.cancel, retries).await?;

        let stream = self.inner.new_stream(peer, topic);
        self.inner.pool.insert(stream.clone())?;
        info!(peer = %peer.short(), %topic, "Added pss peer");
        self.inner.spawn_run(&running, stream, address);
        Ok(())
    }

    /// Remove and close the peer's stream and drop its session keys on the
    /// topic. Returns whether the stream existed.
    ///
    /// Writes pending on the stream fail with `StreamClosed`; nothing is
    /// delivered to it after this returns. Messages the peer still sends
    /// under the old keys no longer open, so they cannot bring the stream
    /// back. A fresh handshake from the peer can.
    pub fn remove_pss_peer(&self, peer: &PublicKey, topic: &Topic) -> bool {
        match self.inner.pool.remove(topic, peer) {
            Some(stream) => {
                stream.close();
                self.inner.pss.handshake().remove_session(peer, topic);
                info!(peer = %peer.short(), %topic, "Removed pss peer");
                true
            }
            None => false,
        }
    }

    /// Live stream for the peer, if any.
    pub fn stream(&self, peer: &PublicKey, topic: &Topic) -> Option<VirtualStream> {
        self.inner.pool.get(topic, peer)
    }

    pub fn peers(&self, topic: &Topic) -> Vec<PublicKey> {
        self.inner.pool.peers(topic)
    }

    /// Stop a protocol: deregister its topic and close its streams.
    pub fn stop_protocol(&self, topic: &Topic) -> bool {
        let Some(running) = self.inner.protocols.write().remove(topic) else {
            return false;
        };
        running.cancel.cancel();
        self.inner.pss.deregister(topic);
        for stream in self.inner.pool.remove_topic(topic) {
            stream.close();
        }
        true
    }

    /// Cancel every run and close every stream.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let topics: Vec<Topic> = self.inner.protocols.write().drain().map(|(t, _)| t).collect();
        for topic in &topics {
            self.inner.pss.deregister(topic);
        }
        let streams = self.inner.pool.drain();
        for stream in &streams {
            stream.close();
        }
        info!(protocols = topics.len(), streams = streams.len(), "Client shut down");
    }
}

impl ClientInner {
    fn running(&self, topic: &Topic) -> PssResult<RunningProtocol> {
        let running = self
            .protocols
            .read()
            .get(topic)
            .cloned()
            .ok_or(PssError::ProtocolNotRunning(*topic))?;
        if running.cancel.is_cancelled() {
            return Err(PssError::Cancelled);
        }
        Ok(running)
    }

    fn new_stream(&self, peer: PublicKey, topic: Topic) -> VirtualStream {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        VirtualStream::new(id, peer, topic, self.pss.clone())
    }

    /// Topic handler of a running protocol. Runs on the pss receive task.
    fn on_message(self: &Arc<Self>, topic: Topic, msg: IncomingMessage) -> PssResult<()> {
        let (MessageKind::Symmetric(_), Some(peer)) = (msg.kind, msg.from) else {
            trace!(%topic, kind = ?msg.kind, "Ignoring non-session message on protocol topic");
            return Ok(());
        };
        let decoded = Msg::from_bytes(&msg.payload)?;

        let stream = match self.pool.get(&topic, &peer) {
            Some(stream) => stream,
            None => {
                let running = match self.running(&topic) {
                    Ok(running) => running,
                    Err(e) => {
                        debug!(peer = %peer.short(), %topic, reason = %e, "Not accepting new peer");
                        return Ok(());
                    }
                };
                let address = msg
                    .address
                    .or_else(|| self.pss.peer_address(&peer, &topic))
                    .ok_or(PssError::UnknownPeer(peer))?;
                let (stream, created) =
                    self.pool
                        .get_or_insert_with(topic, peer, || self.new_stream(peer, topic));
                if created {
                    self.pss.set_peer_public_key(peer, topic, address.clone());
                    info!(peer = %peer.short(), %topic, "Accepted pss peer");
                    self.spawn_run(&running, stream.clone(), address);
                }
                stream
            }
        };

        if !stream.deliver(decoded) {
            debug!(peer = %peer.short(), %topic, "Stream closed, dropping message");
        }
        Ok(())
    }

    fn spawn_run(self: &Arc<Self>, running: &RunningProtocol, stream: VirtualStream, address: PeerAddress) {
        let peer = stream.peer();
        let topic = stream.topic();
        let ctx = PeerContext {
            peer,
            address,
            topic,
            cancel: running.cancel.child_token(),
        };
        let run = running.protocol.run(ctx, stream.clone());
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            match run.await {
                Ok(()) => debug!(peer = %peer.short(), %topic, "Protocol run finished"),
                Err(e) => warn!(peer = %peer.short(), %topic, error = %e, "Protocol run failed"),
            }
            if let Some(inner) = weak.upgrade() {
                inner.pool.remove_if_same(&topic, &peer, stream.id());
            }
            stream.close();
        });
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.inner.cancel.is_cancelled() {
            self.shutdown();
        }
    }
}
