//! Per-(peer, topic) session state
//!
//! ```text
//! ┌──────┐  initiate   ┌─────────┐  response   ┌─────────────┐
//! │ Idle │ ──────────► │ Pending │ ──────────► │ Established │
//! └──────┘             └─────────┘             └──────┬──────┘
//!     ▲                  │ timeout / cancel           │ last key used up
//!     └──────────────────┴────────────────────────────┘ or expired
//! ```
//!
//! A session holds up to `key_capacity` keys, newest last. Sends use the
//! newest key; receives try every key so a message sealed under the previous
//! key still opens while a rotation is in progress.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::crypto::{EphemeralShare, KeyId, SymmetricCipher, SymmetricKey, NONCE_SIZE};
use crate::error::PssResult;
use crate::identity::{PeerAddress, PublicKey};
use crate::topic::Topic;

/// Negotiation state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No usable key and no exchange in flight
    Idle,
    /// A handshake request awaits its response
    Pending,
    /// At least one usable key
    Established,
}

/// Snapshot of a key, safe to hand out (no key material).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub id: KeyId,
    pub peer: PublicKey,
    pub topic: Topic,
    pub address: PeerAddress,
    /// Uses left before the key is evicted
    pub remaining: u16,
    /// Uses the key was negotiated for
    pub limit: u16,
    pub age: Duration,
}

/// An installed session key with its use counter.
pub(crate) struct SessionKey {
    pub(crate) id: KeyId,
    pub(crate) key: SymmetricKey,
    pub(crate) address: PeerAddress,
    pub(crate) remaining: u16,
    pub(crate) limit: u16,
    pub(crate) created_at: Instant,
}

impl SessionKey {
    pub(crate) fn new(key: SymmetricKey, address: PeerAddress, limit: u16) -> Self {
        Self {
            id: KeyId::of(&key),
            key,
            address,
            remaining: limit,
            limit,
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, expiry: Option<Duration>, now: Instant) -> bool {
        expiry.is_some_and(|max_age| now.duration_since(self.created_at) >= max_age)
    }
}

/// In-flight handshake started by the local node.
pub(crate) struct PendingRequest {
    pub(crate) share: EphemeralShare,
    pub(crate) address: PeerAddress,
    pub(crate) limit: u16,
    pub(crate) done: oneshot::Sender<PssResult<KeyInfo>>,
}

/// One session per (peer public key, topic).
pub(crate) struct HandshakeSession {
    pub(crate) peer: PublicKey,
    pub(crate) topic: Topic,
    keys: VecDeque<SessionKey>,
    pub(crate) pending: HashMap<u64, PendingRequest>,
    /// Set when the last key ran out and no new one was installed since
    exhausted: bool,
}

impl HandshakeSession {
    pub(crate) fn new(peer: PublicKey, topic: Topic) -> Self {
        Self {
            peer,
            topic,
            keys: VecDeque::new(),
            pending: HashMap::new(),
            exhausted: false,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        if !self.keys.is_empty() {
            SessionState::Established
        } else if !self.pending.is_empty() {
            SessionState::Pending
        } else {
            SessionState::Idle
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Install a freshly negotiated key, evicting the oldest beyond capacity.
    pub(crate) fn install(&mut self, key: SessionKey, capacity: usize) -> KeyInfo {
        // A retransmitted response must not reset a counter.
        if let Some(existing) = self.keys.iter().find(|k| k.id == key.id) {
            return self.info(existing);
        }
        let info = self.info(&key);
        self.keys.push_back(key);
        // The new key always stays, whatever the capacity.
        while self.keys.len() > capacity.max(1) {
            self.keys.pop_front();
        }
        self.exhausted = false;
        info
    }

    /// Drop expired keys. Returns the ids removed.
    ///
    /// Expiring the last key counts as exhaustion: the peer still expects a
    /// renegotiation, not a fresh session.
    pub(crate) fn purge_expired(&mut self, expiry: Option<Duration>) -> Vec<KeyId> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.keys.retain(|k| {
            let expired = k.is_expired(expiry, now);
            if expired {
                removed.push(k.id);
            }
            !expired
        });
        if !removed.is_empty() && self.keys.is_empty() {
            self.exhausted = true;
        }
        removed
    }

    /// Newest key with uses left.
    pub(crate) fn newest(&self) -> Option<KeyInfo> {
        self.keys.back().map(|k| self.info(k))
    }

    /// Encrypt under the newest key and consume one use.
    ///
    /// Returns `None` when no key is available. A key reaching zero is
    /// evicted immediately.
    pub(crate) fn encrypt(
        &mut self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Option<PssResult<(Vec<u8>, KeyInfo)>> {
        let index = self.keys.len().checked_sub(1)?;
        let result = SymmetricCipher::new(&self.keys[index].key).encrypt_with_nonce(plaintext, nonce);
        Some(result.map(|ciphertext| (ciphertext, self.consume(index))))
    }

    /// Try every key, newest first. On success consume one use of the key
    /// that opened the ciphertext.
    pub(crate) fn decrypt(
        &mut self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Option<(Vec<u8>, KeyInfo)> {
        let index = (0..self.keys.len()).rev().find_map(|i| {
            SymmetricCipher::new(&self.keys[i].key)
                .decrypt_with_nonce(ciphertext, nonce)
                .ok()
                .map(|plaintext| (i, plaintext))
        });
        index.map(|(i, plaintext)| (plaintext, self.consume(i)))
    }

    fn consume(&mut self, index: usize) -> KeyInfo {
        let key = &mut self.keys[index];
        key.remaining = key.remaining.saturating_sub(1);
        let info = self.info(&self.keys[index]);
        if info.remaining == 0 {
            self.keys.remove(index);
            if self.keys.is_empty() {
                self.exhausted = true;
            }
        }
        info
    }

    pub(crate) fn keys(&self) -> Vec<KeyInfo> {
        self.keys.iter().map(|k| self.info(k)).collect()
    }

    pub(crate) fn key_material(&self, id: &KeyId) -> Option<SymmetricKey> {
        self.keys.iter().find(|k| &k.id == id).map(|k| k.key)
    }

    pub(crate) fn release(&mut self, id: &KeyId) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| &k.id != id);
        before != self.keys.len()
    }

    pub(crate) fn key_ids(&self) -> Vec<KeyId> {
        self.keys.iter().map(|k| k.id).collect()
    }

    fn info(&self, key: &SessionKey) -> KeyInfo {
        KeyInfo {
            id: key.id,
            peer: self.peer,
            topic: self.topic,
            address: key.address.clone(),
            remaining: key.remaining,
            limit: key.limit,
            age: key.created_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn session() -> HandshakeSession {
        HandshakeSession::new(Keypair::generate().public_key(), Topic::from_protocol("ping", 1))
    }

    fn key(limit: u16) -> SessionKey {
        SessionKey::new(SymmetricCipher::generate_key(), PeerAddress(vec![1]), limit)
    }

    #[test]
    fn test_new_session_is_idle() {
        let s = session();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.newest().is_none());
        assert!(!s.is_exhausted());
    }

    #[test]
    fn test_install_establishes() {
        let mut s = session();
        let info = s.install(key(3), 4);
        assert_eq!(s.state(), SessionState::Established);
        assert_eq!(info.remaining, 3);
        assert_eq!(s.newest().map(|k| k.id), Some(info.id));
    }

    #[test]
    fn test_counter_exhaustion_evicts() {
        let mut s = session();
        s.install(key(2), 4);
        let nonce = SymmetricCipher::generate_nonce();

        let (_, info) = s.encrypt(b"a", &nonce).unwrap().unwrap();
        assert_eq!(info.remaining, 1);
        let (_, info) = s.encrypt(b"b", &nonce).unwrap().unwrap();
        assert_eq!(info.remaining, 0);

        assert!(s.encrypt(b"c", &nonce).is_none());
        assert!(s.is_exhausted());
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut s = session();
        let first = s.install(key(5), 2);
        s.install(key(5), 2);
        s.install(key(5), 2);
        let ids = s.key_ids();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&first.id));
    }

    #[test]
    fn test_zero_capacity_keeps_newest() {
        let mut s = session();
        s.install(key(5), 0);
        let info = s.install(key(5), 0);
        assert_eq!(s.key_ids(), vec![info.id]);
        assert_eq!(s.state(), SessionState::Established);
    }

    #[test]
    fn test_reinstall_same_key_keeps_counter() {
        let mut s = session();
        let material = SymmetricCipher::generate_key();
        s.install(SessionKey::new(material, PeerAddress(vec![1]), 3), 4);
        let nonce = SymmetricCipher::generate_nonce();
        s.encrypt(b"x", &nonce).unwrap().unwrap();

        let info = s.install(SessionKey::new(material, PeerAddress(vec![1]), 3), 4);
        assert_eq!(info.remaining, 2);
        assert_eq!(s.keys().len(), 1);
    }

    #[test]
    fn test_decrypt_tries_older_keys() {
        let mut sender = session();
        let mut receiver = session();
        let old = SymmetricCipher::generate_key();
        let new = SymmetricCipher::generate_key();
        sender.install(SessionKey::new(old, PeerAddress(vec![1]), 5), 4);
        receiver.install(SessionKey::new(old, PeerAddress(vec![1]), 5), 4);
        receiver.install(SessionKey::new(new, PeerAddress(vec![1]), 5), 4);

        let nonce = SymmetricCipher::generate_nonce();
        let (ciphertext, sent) = sender.encrypt(b"hello", &nonce).unwrap().unwrap();
        let (plaintext, got) = receiver.decrypt(&ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, b"hello");
        assert_eq!(got.id, sent.id);
        assert_eq!(got.remaining, sent.remaining, "Counters stay in step");
    }

    #[test]
    fn test_expired_keys_purged() {
        let mut s = session();
        let info = s.install(key(5), 4);
        assert!(s.purge_expired(None).is_empty());
        let removed = s.purge_expired(Some(Duration::ZERO));
        assert_eq!(removed, vec![info.id]);
        assert!(s.newest().is_none());
        assert!(s.is_exhausted());
    }

    #[test]
    fn test_release() {
        let mut s = session();
        let info = s.install(key(5), 4);
        assert!(s.release(&info.id));
        assert!(!s.release(&info.id));
    }
}
