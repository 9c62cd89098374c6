//! Messaging core
//!
//! [`Pss`] turns application payloads into envelopes and back:
//!
//! ```text
//! send:    payload -> encrypt (session key | sealed box | raw) -> Envelope -> Overlay
//! receive: Overlay -> Envelope -> decrypt -> handshake controller | TopicRouter
//! ```
//!
//! Inbound envelopes are queued by the overlay callback and processed one at
//! a time by a receive task, so the order the overlay delivered them in is
//! the order handlers see them in.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PssConfig;
use crate::crypto::{KeyId, SealedBox, SymmetricCipher, NONCE_SIZE};
use crate::envelope::{Envelope, Flags};
use crate::error::{PssError, PssResult};
use crate::handshake::{HandshakeController, HandshakeMessage, HandshakeTransport, KeyInfo, KeyResolution};
use crate::identity::{Keypair, PeerAddress, PublicKey};
use crate::overlay::Overlay;
use crate::router::{HandlerCaps, IncomingMessage, MessageKind, TopicHandler, TopicRouter};
use crate::topic::Topic;

/// The messaging core of one node.
pub struct Pss {
    keypair: Keypair,
    config: PssConfig,
    overlay: Arc<dyn Overlay>,
    handshake: HandshakeController,
    router: TopicRouter,
    /// Known overlay addresses per (peer, topic)
    addresses: RwLock<HashMap<(PublicKey, Topic), PeerAddress>>,
    cancel: CancellationToken,
}

impl Pss {
    /// Build the core on top of `overlay` and start the receive task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(keypair: Keypair, overlay: Arc<dyn Overlay>, config: PssConfig) -> PssResult<Arc<Self>> {
        config.validate()?;

        let address = overlay.base_address();
        let handshake =
            HandshakeController::new(keypair.public_key(), address.clone(), config.handshake.clone());

        let pss = Arc::new(Self {
            keypair,
            config,
            overlay,
            handshake,
            router: TopicRouter::new(),
            addresses: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        pss.overlay.on_envelope(Box::new(move |bytes| {
            // Receiver gone means the node shut down.
            let _ = inbox_tx.send(bytes);
        }));
        tokio::spawn(run_receive_loop(Arc::downgrade(&pss), inbox_rx, pss.cancel.clone()));

        info!(key = %pss.public_key().short(), %address, "pss started");
        Ok(pss)
    }

    /// Overlay address of this node.
    pub fn base_address(&self) -> PeerAddress {
        self.overlay.base_address()
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &PssConfig {
        &self.config
    }

    pub fn handshake(&self) -> &HandshakeController {
        &self.handshake
    }

    /// Record the overlay address of `key` for `topic`.
    pub fn set_peer_public_key(&self, key: PublicKey, topic: Topic, address: PeerAddress) {
        debug!(peer = %key.short(), %topic, %address, "Peer address set");
        self.addresses.write().insert((key, topic), address);
    }

    /// Known address of `key` on `topic`: the one set explicitly, else the one
    /// bound to the newest session key.
    pub fn peer_address(&self, key: &PublicKey, topic: &Topic) -> Option<PeerAddress> {
        if let Some(address) = self.addresses.read().get(&(*key, *topic)) {
            return Some(address.clone());
        }
        self.handshake
            .keys(key, topic)
            .pop()
            .map(|newest| newest.address)
    }

    /// Forget everything about `key`: addresses and session keys.
    pub fn forget_peer(&self, key: &PublicKey) {
        self.addresses.write().retain(|(k, _), _| k != key);
        self.handshake.remove_peer(key);
    }

    pub fn register(&self, topic: Topic, handler: TopicHandler, caps: HandlerCaps) -> PssResult<()> {
        self.router.register(topic, handler, caps)
    }

    pub fn deregister(&self, topic: &Topic) -> bool {
        self.router.deregister(topic)
    }

    fn check_running(&self) -> PssResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PssError::Cancelled);
        }
        Ok(())
    }

    /// Send under the session key negotiated with `peer`, consuming one use.
    ///
    /// Fails with `KeyExhausted` when the session's keys have been used up and
    /// `NoKeyAvailable` when none was ever negotiated. When the key reaches
    /// the renegotiation mark a new handshake starts in the background.
    pub fn send_sym(self: &Arc<Self>, peer: &PublicKey, topic: &Topic, payload: &[u8]) -> PssResult<KeyInfo> {
        self.check_running()?;
        let nonce = SymmetricCipher::generate_nonce();
        let (ciphertext, key) = self.handshake.encrypt_for(peer, topic, payload, &nonce)?;

        let envelope = Envelope::new(*topic, Flags::SYMMETRIC, nonce, ciphertext);
        self.overlay.send_envelope(&key.address, envelope.to_bytes()?)?;
        trace!(peer = %peer.short(), %topic, key = %key.id, remaining = key.remaining, "Sent symmetric message");

        if self.handshake.needs_renegotiation(key.remaining) {
            self.spawn_handshake(*peer, *topic, key.address.clone(), Some(key.id));
        }
        Ok(key)
    }

    /// Send sealed to `peer`'s static key. Needs a known address.
    pub fn send_asym(&self, peer: &PublicKey, topic: &Topic, payload: &[u8]) -> PssResult<()> {
        self.check_running()?;
        let address = self.peer_address(peer, topic).ok_or(PssError::UnknownPeer(*peer))?;
        self.seal_and_send(peer, &address, *topic, payload)?;
        trace!(peer = %peer.short(), %topic, "Sent asymmetric message");
        Ok(())
    }

    /// Send unencrypted to every node matching `address`.
    pub fn send_raw(&self, address: &PeerAddress, topic: &Topic, payload: &[u8]) -> PssResult<()> {
        self.check_running()?;
        if !self.config.allow_raw {
            return Err(PssError::RawDisabled);
        }
        let envelope = Envelope::new(*topic, Flags::RAW, [0u8; NONCE_SIZE], payload.to_vec());
        self.overlay.send_envelope(address, envelope.to_bytes()?)
    }

    /// Send symmetrically if a session key exists, otherwise sealed to the
    /// peer's static key (when enabled and an address is known) while a
    /// handshake runs in the background.
    ///
    /// # Arguments
    ///
    /// * `peer` - Static public key of the recipient
    /// * `topic` - Topic the recipient's handler is registered on
    /// * `payload` - Application bytes, opaque to pss
    ///
    /// # Returns
    ///
    /// `Ok` once the envelope is handed to the overlay. Without a session
    /// key the original `NoKeyAvailable` or `KeyExhausted` is returned when
    /// the fallback is disabled or no address is known for `peer`.
    pub fn send(self: &Arc<Self>, peer: &PublicKey, topic: &Topic, payload: &[u8]) -> PssResult<()> {
        match self.send_sym(peer, topic, payload) {
            Ok(_) => Ok(()),
            Err(e @ (PssError::NoKeyAvailable { .. } | PssError::KeyExhausted { .. })) => {
                let address = match self.peer_address(peer, topic) {
                    Some(address) if self.config.asymmetric_fallback => address,
                    _ => return Err(e),
                };
                debug!(peer = %peer.short(), %topic, reason = %e, "Falling back to asymmetric send");
                self.seal_and_send(peer, &address, *topic, payload)?;
                self.spawn_handshake(*peer, *topic, address, None);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Negotiate a fresh key with `peer`, replacing the current one if any.
    pub async fn initiate_handshake(
        &self,
        peer: &PublicKey,
        topic: &Topic,
        cancel: &CancellationToken,
    ) -> PssResult<KeyInfo> {
        self.check_running()?;
        let address = self.peer_address(peer, topic).ok_or(PssError::UnknownPeer(*peer))?;
        let current = self.handshake.keys(peer, topic).pop().map(|k| k.id);
        self.handshake
            .initiate(self, *peer, *topic, address, cancel, current)
            .await
    }

    /// Return a usable session key, negotiating one if needed.
    ///
    /// Timeouts and routing failures are retried up to `retries` extra times.
    pub async fn ensure_key(
        &self,
        peer: &PublicKey,
        topic: &Topic,
        cancel: &CancellationToken,
        retries: u32,
    ) -> PssResult<KeyInfo> {
        self.check_running()?;
        if let KeyResolution::Key(key) = self.handshake.resolve_key_for_send(peer, topic) {
            return Ok(key);
        }
        let address = self.peer_address(peer, topic).ok_or(PssError::UnknownPeer(*peer))?;

        let mut attempt = 0;
        loop {
            match self
                .handshake
                .initiate(self, *peer, *topic, address.clone(), cancel, None)
                .await
            {
                Ok(key) => return Ok(key),
                Err(e) if attempt < retries && is_transient(&e) => {
                    attempt += 1;
                    debug!(peer = %peer.short(), %topic, attempt, error = %e, "Retrying handshake");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_handshake(self: &Arc<Self>, peer: PublicKey, topic: Topic, address: PeerAddress, replacing: Option<KeyId>) {
        let pss = self.clone();
        tokio::spawn(async move {
            let cancel = pss.cancel.child_token();
            match pss
                .handshake
                .initiate(&*pss, peer, topic, address, &cancel, replacing)
                .await
            {
                Ok(key) => debug!(peer = %peer.short(), %topic, key = %key.id, "Background handshake done"),
                Err(e) => debug!(peer = %peer.short(), %topic, error = %e, "Background handshake failed"),
            }
        });
    }

    fn seal_and_send(&self, peer: &PublicKey, address: &PeerAddress, topic: Topic, payload: &[u8]) -> PssResult<()> {
        let nonce = SymmetricCipher::generate_nonce();
        let sealed = SealedBox::seal(&self.keypair, peer, payload, &nonce)?;
        let envelope = Envelope::new(topic, Flags::ASYMMETRIC, nonce, sealed.encode()?);
        self.overlay.send_envelope(address, envelope.to_bytes()?)
    }

    /// Process one encoded envelope as delivered by the overlay.
    ///
    /// Envelopes that cannot be opened are dropped with `Ok(())`; only
    /// malformed input is an error.
    pub fn receive(&self, bytes: &[u8]) -> PssResult<()> {
        let envelope = Envelope::from_bytes(bytes)?;
        if envelope.flags.is_raw() {
            self.receive_raw(envelope)
        } else if envelope.flags.is_asymmetric() {
            self.receive_asym(envelope)
        } else {
            self.receive_sym(envelope)
        }
    }

    fn receive_sym(&self, envelope: Envelope) -> PssResult<()> {
        let Some(opened) = self
            .handshake
            .decrypt(&envelope.topic, &envelope.nonce, &envelope.payload)
        else {
            debug!(topic = %envelope.topic, "No session key opens envelope, dropping");
            return Ok(());
        };

        trace!(peer = %opened.peer.short(), topic = %envelope.topic, key = %opened.key.id, remaining = opened.key.remaining, "Received symmetric message");
        self.router.dispatch(IncomingMessage {
            topic: envelope.topic,
            from: Some(opened.peer),
            address: Some(opened.key.address),
            payload: opened.plaintext,
            kind: MessageKind::Symmetric(opened.key.id),
        })?;
        Ok(())
    }

    fn receive_asym(&self, envelope: Envelope) -> PssResult<()> {
        let sealed = SealedBox::decode(&envelope.payload)?;
        let plaintext = match sealed.open(&self.keypair, &envelope.nonce) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                // Prefix-addressed envelopes reach nodes they are not for.
                trace!(topic = %envelope.topic, "Sealed envelope not for us");
                return Ok(());
            }
        };
        let sender = sealed.sender;

        if envelope.topic.is_handshake() {
            let message = HandshakeMessage::decode(&plaintext)?;
            if let HandshakeMessage::Request { topic, reply_to, .. } = &message {
                if !reply_to.is_empty() {
                    self.addresses
                        .write()
                        .entry((sender, *topic))
                        .or_insert_with(|| reply_to.clone());
                }
            }
            if let Err(e) = self.handshake.handle_message(self, sender, message) {
                warn!(peer = %sender.short(), error = %e, "Rejected handshake message");
            }
            return Ok(());
        }

        self.router.dispatch(IncomingMessage {
            topic: envelope.topic,
            from: Some(sender),
            address: self.peer_address(&sender, &envelope.topic),
            payload: plaintext,
            kind: MessageKind::Asymmetric,
        })?;
        Ok(())
    }

    fn receive_raw(&self, envelope: Envelope) -> PssResult<()> {
        let accepts = self.config.allow_raw
            && self
                .router
                .caps(&envelope.topic)
                .is_some_and(|caps| caps.raw);
        if !accepts {
            trace!(topic = %envelope.topic, "Raw envelope not accepted, dropping");
            return Ok(());
        }
        self.router.dispatch(IncomingMessage {
            topic: envelope.topic,
            from: None,
            address: None,
            payload: envelope.payload,
            kind: MessageKind::Raw,
        })?;
        Ok(())
    }

    /// Stop the receive task and tear down every session.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(key = %self.public_key().short(), "Shutting down pss");
        self.cancel.cancel();
        self.handshake.clear();
    }
}

impl HandshakeTransport for Pss {
    fn send_handshake(
        &self,
        peer: &PublicKey,
        address: &PeerAddress,
        message: &HandshakeMessage,
    ) -> PssResult<()> {
        self.seal_and_send(peer, address, Topic::handshake(), &message.encode()?)
    }
}

fn is_transient(error: &PssError) -> bool {
    matches!(
        error,
        PssError::HandshakeTimeout { .. } | PssError::RoutingUnavailable(_)
    )
}

async fn run_receive_loop(
    pss: Weak<Pss>,
    mut inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            bytes = inbox.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let Some(pss) = pss.upgrade() else {
            break;
        };
        if let Err(e) = pss.receive(&bytes) {
            debug!(error = %e, len = bytes.len(), "Dropping envelope");
        }
    }
    debug!("pss receive loop stopped");
}
