//! Handshake controller
//!
//! Negotiates, caches, expires and renegotiates the symmetric session keys
//! used between two nodes on one topic. Sessions are keyed by
//! `(peer public key, topic)` and each one carries its own async gate, so a
//! slow or unreachable peer only ever delays callers waiting on that same
//! session.
//!
//! The controller does not touch the overlay. Handshake messages leave
//! through a [`HandshakeTransport`] (implemented by the messaging core, which
//! seals them asymmetrically) and come back in through
//! [`HandshakeController::handle_message`].

pub mod message;
pub mod session;

pub use message::HandshakeMessage;
pub use session::{KeyInfo, SessionState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HandshakeParams;
use crate::crypto::{EphemeralShare, KeyId, SymmetricKey, NONCE_SIZE};
use crate::error::{PssError, PssResult};
use crate::identity::{PeerAddress, PublicKey};
use crate::topic::Topic;
use session::{HandshakeSession, PendingRequest, SessionKey};

/// Outbound path for handshake messages.
pub trait HandshakeTransport: Send + Sync {
    /// Deliver `message` to `peer` at `address`, protected so that only the
    /// peer can read it and can verify it came from us.
    fn send_handshake(
        &self,
        peer: &PublicKey,
        address: &PeerAddress,
        message: &HandshakeMessage,
    ) -> PssResult<()>;
}

/// Outcome of looking up a send key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    /// A key with uses left
    Key(KeyInfo),
    /// No usable key. `exhausted` is set when a previous key was used up (or
    /// expired), as opposed to no key ever having been negotiated.
    NeedsHandshake { exhausted: bool },
}

/// Plaintext recovered from a symmetric envelope.
#[derive(Debug)]
pub struct Decrypted {
    pub peer: PublicKey,
    pub key: KeyInfo,
    pub plaintext: Vec<u8>,
}

struct SessionSlot {
    state: Mutex<HandshakeSession>,
    /// Serializes exchanges for this session only
    gate: tokio::sync::Mutex<()>,
}

/// Per-(peer, topic) session key manager.
pub struct HandshakeController {
    local_key: PublicKey,
    local_address: PeerAddress,
    params: HandshakeParams,
    sessions: RwLock<HashMap<(PublicKey, Topic), Arc<SessionSlot>>>,
    next_request_id: AtomicU64,
}

impl HandshakeController {
    /// Create a controller for the local identity.
    ///
    /// `local_address` is sent as the reply address in every request.
    pub fn new(local_key: PublicKey, local_address: PeerAddress, params: HandshakeParams) -> Self {
        Self {
            local_key,
            local_address,
            params,
            sessions: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn params(&self) -> &HandshakeParams {
        &self.params
    }

    fn slot(&self, peer: PublicKey, topic: Topic) -> Arc<SessionSlot> {
        if let Some(slot) = self.sessions.read().get(&(peer, topic)) {
            return slot.clone();
        }
        self.sessions
            .write()
            .entry((peer, topic))
            .or_insert_with(|| {
                debug!(peer = %peer.short(), %topic, "Creating handshake session");
                Arc::new(SessionSlot {
                    state: Mutex::new(HandshakeSession::new(peer, topic)),
                    gate: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    fn existing_slot(&self, peer: &PublicKey, topic: &Topic) -> Option<Arc<SessionSlot>> {
        self.sessions.read().get(&(*peer, *topic)).cloned()
    }

    fn all_slots(&self) -> Vec<Arc<SessionSlot>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Negotiate a session key with `peer` on `topic`.
    ///
    /// # Arguments
    ///
    /// * `transport` - Outbound path for the request
    /// * `peer` - Static public key of the responder
    /// * `topic` - Topic the key is scoped to
    /// * `address` - Where the request is routed
    /// * `cancel` - Aborts the wait for the gate or the response
    /// * `replacing` - Key being renegotiated, never returned as is
    ///
    /// # Returns
    ///
    /// The newest key of the session once both sides hold it.
    ///
    /// An existing usable key is returned as is, unless it is the key named
    /// by `replacing` (the one being renegotiated). Concurrent callers for the
    /// same session coalesce: whoever waits on the gate while another exchange
    /// completes gets that exchange's key.
    ///
    /// Fails with `HandshakeTimeout` when no response arrives within the
    /// request timeout, `Cancelled` when `cancel` fires first, and
    /// `HandshakeProtocolError` when the response is invalid.
    pub async fn initiate(
        &self,
        transport: &dyn HandshakeTransport,
        peer: PublicKey,
        topic: Topic,
        address: PeerAddress,
        cancel: &CancellationToken,
        replacing: Option<KeyId>,
    ) -> PssResult<KeyInfo> {
        let slot = self.slot(peer, topic);

        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PssError::Cancelled),
            guard = slot.gate.lock() => guard,
        };

        {
            let mut state = slot.state.lock();
            state.purge_expired(self.params.key_expiry());
            if let Some(existing) = state.newest() {
                if replacing != Some(existing.id) {
                    debug!(peer = %peer.short(), %topic, key = %existing.id, "Reusing negotiated key");
                    return Ok(existing);
                }
            }
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let share = EphemeralShare::generate();
        let limit = self.params.send_limit;
        let message = HandshakeMessage::Request {
            request_id,
            topic,
            ephemeral: share.public(),
            limit,
            reply_to: self.local_address.clone(),
        };

        let (done, response) = oneshot::channel();
        slot.state.lock().pending.insert(
            request_id,
            PendingRequest {
                share,
                address: address.clone(),
                limit,
                done,
            },
        );

        info!(peer = %peer.short(), %topic, request_id, limit, "Initiating handshake");
        if let Err(e) = transport.send_handshake(&peer, &address, &message) {
            slot.state.lock().pending.remove(&request_id);
            return Err(e);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PssError::Cancelled),
            _ = tokio::time::sleep(self.params.request_timeout()) => {
                Err(PssError::HandshakeTimeout { peer, topic })
            }
            result = response => result.unwrap_or_else(|_| {
                Err(PssError::HandshakeProtocolError("Handshake abandoned".to_string()))
            }),
        };

        slot.state.lock().pending.remove(&request_id);

        match &outcome {
            Ok(key) => info!(peer = %peer.short(), %topic, key = %key.id, "Handshake complete"),
            Err(e) => warn!(peer = %peer.short(), %topic, request_id, error = %e, "Handshake failed"),
        }
        outcome
    }

    /// Process an inbound handshake message from an authenticated sender.
    pub fn handle_message(
        &self,
        transport: &dyn HandshakeTransport,
        from: PublicKey,
        message: HandshakeMessage,
    ) -> PssResult<KeyInfo> {
        match message {
            HandshakeMessage::Request {
                request_id,
                topic,
                ephemeral,
                limit,
                reply_to,
            } => self.on_request(transport, from, request_id, topic, ephemeral, limit, reply_to),
            HandshakeMessage::Response {
                request_id,
                topic,
                ephemeral,
                limit,
            } => self.on_response(from, request_id, topic, ephemeral, limit),
        }
    }

    /// Responder side: derive the key, answer, then install it.
    ///
    /// When the response cannot be sent nothing is installed and the
    /// session's previous key stays the send key.
    #[allow(clippy::too_many_arguments)]
    pub fn on_request(
        &self,
        transport: &dyn HandshakeTransport,
        from: PublicKey,
        request_id: u64,
        topic: Topic,
        ephemeral: [u8; 32],
        requested_limit: u16,
        reply_to: PeerAddress,
    ) -> PssResult<KeyInfo> {
        if topic.is_handshake() {
            return Err(PssError::HandshakeProtocolError(
                "Session requested on the handshake topic".to_string(),
            ));
        }
        let limit = requested_limit.min(self.params.send_limit);
        if limit == 0 {
            return Err(PssError::HandshakeProtocolError(
                "Requested key limit is zero".to_string(),
            ));
        }

        let share = EphemeralShare::generate();
        let key = share.agree(&ephemeral, &topic, &from, &self.local_key, request_id)?;

        let response = HandshakeMessage::Response {
            request_id,
            topic,
            ephemeral: share.public(),
            limit,
        };
        debug!(peer = %from.short(), %topic, request_id, limit, "Answering handshake request");
        // The key is only installed once the initiator can learn it.
        transport.send_handshake(&from, &reply_to, &response)?;

        let slot = self.slot(from, topic);
        let mut state = slot.state.lock();
        state.purge_expired(self.params.key_expiry());
        Ok(state.install(
            SessionKey::new(key, reply_to, limit),
            self.params.key_capacity,
        ))
    }

    /// Initiator side: complete the pending request the response refers to.
    pub fn on_response(
        &self,
        from: PublicKey,
        request_id: u64,
        topic: Topic,
        ephemeral: [u8; 32],
        limit: u16,
    ) -> PssResult<KeyInfo> {
        let unsolicited = || {
            PssError::HandshakeProtocolError(format!(
                "Unsolicited handshake response {} from {}",
                request_id,
                from.short()
            ))
        };
        let slot = self.existing_slot(&from, &topic).ok_or_else(unsolicited)?;
        let pending = slot
            .state
            .lock()
            .pending
            .remove(&request_id)
            .ok_or_else(unsolicited)?;

        let outcome = if limit == 0 || limit > pending.limit {
            Err(PssError::HandshakeProtocolError(format!(
                "Response limit {} outside 1..={}",
                limit, pending.limit
            )))
        } else {
            pending
                .share
                .agree(&ephemeral, &topic, &self.local_key, &from, request_id)
                .map(|key| {
                    slot.state.lock().install(
                        SessionKey::new(key, pending.address.clone(), limit),
                        self.params.key_capacity,
                    )
                })
        };

        match outcome {
            Ok(installed) => {
                let _ = pending.done.send(Ok(installed.clone()));
                Ok(installed)
            }
            Err(e) => {
                let _ = pending
                    .done
                    .send(Err(PssError::HandshakeProtocolError(e.to_string())));
                Err(e)
            }
        }
    }

    /// Current send key for the session, if any.
    pub fn resolve_key_for_send(&self, peer: &PublicKey, topic: &Topic) -> KeyResolution {
        let Some(slot) = self.existing_slot(peer, topic) else {
            return KeyResolution::NeedsHandshake { exhausted: false };
        };
        let mut state = slot.state.lock();
        state.purge_expired(self.params.key_expiry());
        match state.newest() {
            Some(key) => KeyResolution::Key(key),
            None => KeyResolution::NeedsHandshake {
                exhausted: state.is_exhausted(),
            },
        }
    }

    /// Encrypt under the newest key of the session, consuming one use.
    ///
    /// Lookup, encryption and the counter update happen under the session
    /// lock, so two concurrent senders never share a use.
    pub fn encrypt_for(
        &self,
        peer: &PublicKey,
        topic: &Topic,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> PssResult<(Vec<u8>, KeyInfo)> {
        let no_key = || PssError::NoKeyAvailable {
            peer: *peer,
            topic: *topic,
        };
        let slot = self.existing_slot(peer, topic).ok_or_else(no_key)?;
        let mut state = slot.state.lock();
        state.purge_expired(self.params.key_expiry());
        match state.encrypt(plaintext, nonce) {
            Some(result) => result,
            None if state.is_exhausted() => Err(PssError::KeyExhausted {
                peer: *peer,
                topic: *topic,
            }),
            None => Err(no_key()),
        }
    }

    /// Try every key cached for `topic` and consume one use of the key that
    /// opens the ciphertext.
    pub fn decrypt(
        &self,
        topic: &Topic,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Option<Decrypted> {
        let candidates: Vec<_> = self
            .sessions
            .read()
            .iter()
            .filter(|((_, t), _)| t == topic)
            .map(|(_, slot)| slot.clone())
            .collect();

        candidates.into_iter().find_map(|slot| {
            let mut state = slot.state.lock();
            state.purge_expired(self.params.key_expiry());
            state
                .decrypt(ciphertext, nonce)
                .map(|(plaintext, key)| Decrypted {
                    peer: state.peer,
                    key,
                    plaintext,
                })
        })
    }

    /// Whether a key left with `remaining` uses is due for renegotiation.
    pub fn needs_renegotiation(&self, remaining: u16) -> bool {
        remaining <= self.params.renegotiate_below
    }

    pub fn state(&self, peer: &PublicKey, topic: &Topic) -> SessionState {
        self.existing_slot(peer, topic)
            .map(|slot| slot.state.lock().state())
            .unwrap_or(SessionState::Idle)
    }

    /// Keys of a session, newest last.
    pub fn keys(&self, peer: &PublicKey, topic: &Topic) -> Vec<KeyInfo> {
        self.existing_slot(peer, topic)
            .map(|slot| {
                let mut state = slot.state.lock();
                state.purge_expired(self.params.key_expiry());
                state.keys()
            })
            .unwrap_or_default()
    }

    fn find_key<T>(&self, f: impl Fn(&HandshakeSession) -> Option<T>) -> Option<T> {
        self.all_slots()
            .into_iter()
            .find_map(|slot| f(&*slot.state.lock()))
    }

    /// Remaining uses of a key.
    pub fn key_capacity(&self, id: &KeyId) -> Option<u16> {
        self.find_key(|s| s.keys().into_iter().find(|k| &k.id == id).map(|k| k.remaining))
    }

    /// Session a key belongs to.
    pub fn peer_for_key(&self, id: &KeyId) -> Option<(PublicKey, Topic)> {
        self.find_key(|s| s.key_ids().contains(id).then_some((s.peer, s.topic)))
    }

    /// Raw key material, for diagnostics.
    pub fn symmetric_key(&self, id: &KeyId) -> Option<SymmetricKey> {
        self.find_key(|s| s.key_material(id))
    }

    /// Drop one key ahead of its limit. Returns whether it existed.
    pub fn release_key(&self, peer: &PublicKey, topic: &Topic, id: &KeyId) -> bool {
        self.existing_slot(peer, topic)
            .is_some_and(|slot| slot.state.lock().release(id))
    }

    /// Tear down the session with `peer` on `topic`. Pending exchanges fail
    /// with `Cancelled`. Returns whether the session existed.
    pub fn remove_session(&self, peer: &PublicKey, topic: &Topic) -> bool {
        let Some(slot) = self.sessions.write().remove(&(*peer, *topic)) else {
            return false;
        };
        fail_pending(&slot);
        debug!(peer = %peer.short(), %topic, "Removed handshake session");
        true
    }

    /// Tear down every session with `peer`. Pending exchanges fail with
    /// `Cancelled`.
    pub fn remove_peer(&self, peer: &PublicKey) {
        let removed: Vec<_> = {
            let mut sessions = self.sessions.write();
            let keys: Vec<_> = sessions.keys().filter(|(p, _)| p == peer).copied().collect();
            keys.into_iter().filter_map(|k| sessions.remove(&k)).collect()
        };
        for slot in &removed {
            fail_pending(slot);
        }
        if !removed.is_empty() {
            debug!(peer = %peer.short(), sessions = removed.len(), "Removed handshake sessions");
        }
    }

    /// Tear down every session.
    pub fn clear(&self) {
        let removed: Vec<_> = self.sessions.write().drain().map(|(_, slot)| slot).collect();
        for slot in &removed {
            fail_pending(slot);
        }
    }
}

fn fail_pending(slot: &SessionSlot) {
    let pending: Vec<_> = slot.state.lock().pending.drain().collect();
    for (_, request) in pending {
        let _ = request.done.send(Err(PssError::Cancelled));
    }
}
