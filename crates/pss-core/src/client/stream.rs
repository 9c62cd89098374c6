//! Virtual streams
//!
//! A [`VirtualStream`] stands in for a direct connection to one peer on one
//! protocol topic. Reads come from the topic dispatcher, writes go out through
//! [`Pss::send_sym`] after making sure a session key exists.
//!
//! Closing takes the write side of the `open` lock, and both writes and
//! deliveries happen under its read side. Once [`VirtualStream::close`]
//! returns, no write can succeed and no message can be delivered.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::protocol::{Msg, MsgReadWriter};
use crate::error::{PssError, PssResult};
use crate::identity::PublicKey;
use crate::pss::Pss;
use crate::topic::Topic;

struct StreamInner {
    id: u64,
    peer: PublicKey,
    topic: Topic,
    pss: Arc<Pss>,
    open: RwLock<bool>,
    closed: CancellationToken,
    inbound_tx: mpsc::UnboundedSender<Msg>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Msg>>,
    handshake_retries: u32,
}

/// Duplex message stream to one peer on one topic.
#[derive(Clone)]
pub struct VirtualStream {
    inner: Arc<StreamInner>,
}

impl VirtualStream {
    pub(crate) fn new(id: u64, peer: PublicKey, topic: Topic, pss: Arc<Pss>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let handshake_retries = pss.config().handshake.handshake_retries;
        Self {
            inner: Arc::new(StreamInner {
                id,
                peer,
                topic,
                pss,
                open: RwLock::new(true),
                closed: CancellationToken::new(),
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                handshake_retries,
            }),
        }
    }

    /// Pool-unique id; tells a replaced stream from its successor.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> PublicKey {
        self.inner.peer
    }

    pub fn topic(&self) -> Topic {
        self.inner.topic
    }

    pub fn is_closed(&self) -> bool {
        !*self.inner.open.read()
    }

    fn closed_error(&self) -> PssError {
        PssError::StreamClosed {
            peer: self.inner.peer,
            topic: self.inner.topic,
        }
    }

    /// Queue an inbound message. Returns `false` if the stream is closed.
    pub(crate) fn deliver(&self, msg: Msg) -> bool {
        let open = self.inner.open.read();
        *open && self.inner.inbound_tx.send(msg).is_ok()
    }

    /// Close the stream: pending reads and writes fail, queued messages are
    /// discarded.
    pub fn close(&self) {
        {
            let mut open = self.inner.open.write();
            if !*open {
                return;
            }
            *open = false;
        }
        self.inner.closed.cancel();

        // A reader holding the receiver sees the cancellation instead.
        if let Ok(mut rx) = self.inner.inbound_rx.try_lock() {
            let mut discarded = 0;
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                trace!(peer = %self.inner.peer.short(), discarded, "Discarded unread messages");
            }
        }
        debug!(peer = %self.inner.peer.short(), topic = %self.inner.topic, "Virtual stream closed");
    }

    fn send_locked(&self, bytes: &[u8]) -> PssResult<()> {
        let open = self.inner.open.read();
        if !*open {
            return Err(self.closed_error());
        }
        self.inner
            .pss
            .send_sym(&self.inner.peer, &self.inner.topic, bytes)
            .map(|_| ())
    }
}

impl MsgReadWriter for VirtualStream {
    async fn read_msg(&self) -> PssResult<Msg> {
        let mut rx = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => return Err(self.closed_error()),
            rx = self.inner.inbound_rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(self.closed_error()),
            msg = rx.recv() => msg.ok_or_else(|| self.closed_error()),
        }
    }

    /// Make sure a session key exists (negotiating one if needed), then send.
    ///
    /// A key can run out between the check and the send when several writers
    /// share the session; that case renegotiates and tries again, a bounded
    /// number of times.
    async fn write_msg(&self, msg: Msg) -> PssResult<()> {
        let bytes = msg.to_bytes()?;
        let retries = self.inner.handshake_retries;
        let mut attempt = 0;
        loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }
            self.inner
                .pss
                .ensure_key(&self.inner.peer, &self.inner.topic, &self.inner.closed, retries)
                .await
                .map_err(|e| match e {
                    PssError::Cancelled if self.is_closed() => self.closed_error(),
                    e => e,
                })?;

            match self.send_locked(&bytes) {
                Err(PssError::KeyExhausted { .. } | PssError::NoKeyAvailable { .. })
                    if attempt < retries =>
                {
                    attempt += 1;
                    trace!(peer = %self.inner.peer.short(), attempt, "Key used up before send, renegotiating");
                }
                result => return result,
            }
        }
    }
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("topic", &self.inner.topic)
            .field("closed", &self.is_closed())
            .finish()
    }
}
