//! Property-based tests for the crypto layer and key accounting
//!
//! Uses proptest to check that encryption round-trips, that decoding never
//! panics on arbitrary input, and that both ends of a session agree on how
//! many uses a key has left.

use proptest::prelude::*;
use pss_core::crypto::{SealedBox, SymmetricCipher};
use pss_core::handshake::{HandshakeMessage, HandshakeTransport};
use pss_core::{
    Envelope, HandshakeController, HandshakeParams, Keypair, PeerAddress, PssError, PssResult,
    PublicKey, Topic,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Strategy Generators
// ============================================================================

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=4096)
}

fn seed_strategy() -> impl Strategy<Value = [u8; 32]> {
    any::<[u8; 32]>()
}

// ============================================================================
// Direct handshake transport
// ============================================================================

/// Delivers handshake messages straight into the remote controller.
struct Direct<'a> {
    local: PublicKey,
    remote: &'a HandshakeController,
    reply: &'a dyn HandshakeTransport,
}

impl HandshakeTransport for Direct<'_> {
    fn send_handshake(&self, _: &PublicKey, _: &PeerAddress, message: &HandshakeMessage) -> PssResult<()> {
        self.remote
            .handle_message(self.reply, self.local, message.clone())
            .map(|_| ())
    }
}

/// Sink for the last hop, where the initiator never answers a response.
struct Nowhere;

impl HandshakeTransport for Nowhere {
    fn send_handshake(&self, _: &PublicKey, _: &PeerAddress, _: &HandshakeMessage) -> PssResult<()> {
        Ok(())
    }
}

fn controller(key: PublicKey, limit: u16) -> HandshakeController {
    let params = HandshakeParams::default().with_send_limit(limit);
    HandshakeController::new(key, PeerAddress::from_public_key(&key), params)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Any payload survives symmetric encryption under a random key
    #[test]
    fn symmetric_roundtrip(payload in payload_strategy()) {
        let cipher = SymmetricCipher::new(&SymmetricCipher::generate_key());
        let nonce = SymmetricCipher::generate_nonce();
        let ciphertext = cipher.encrypt_with_nonce(&payload, &nonce).unwrap();
        prop_assert_eq!(cipher.decrypt_with_nonce(&ciphertext, &nonce).unwrap(), payload);
    }

    /// Sealed boxes open for the recipient and name the right sender
    #[test]
    fn sealed_box_roundtrip(
        payload in payload_strategy(),
        sender_seed in seed_strategy(),
        recipient_seed in seed_strategy(),
    ) {
        let sender = Keypair::from_seed(sender_seed);
        let recipient = Keypair::from_seed(recipient_seed);
        let nonce = SymmetricCipher::generate_nonce();

        let sealed = SealedBox::seal(&sender, &recipient.public_key(), &payload, &nonce).unwrap();
        let decoded = SealedBox::decode(&sealed.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded.sender, sender.public_key());
        prop_assert_eq!(decoded.open(&recipient, &nonce).unwrap(), payload);
    }

    /// Decoding arbitrary bytes as an envelope never panics
    #[test]
    fn envelope_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Envelope::from_bytes(&bytes);
    }

    /// Decoding arbitrary bytes as a handshake message never panics
    #[test]
    fn handshake_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = HandshakeMessage::decode(&bytes);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// A key with limit L carries exactly L messages, on both ends, and a
    /// renegotiation restores the full limit
    #[test]
    fn key_limit_is_shared_by_both_ends(limit in 1u16..=8, payload in payload_strategy()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let a_key = Keypair::generate().public_key();
        let b_key = Keypair::generate().public_key();
        let a = controller(a_key, limit);
        let b = controller(b_key, limit);
        let topic = Topic::from_protocol("prop", 1);

        let back = Direct { local: b_key, remote: &a, reply: &Nowhere };
        let forward = Direct { local: a_key, remote: &b, reply: &back };
        let negotiate = || {
            runtime.block_on(a.initiate(
                &forward,
                b_key,
                topic,
                PeerAddress::from_public_key(&b_key),
                &CancellationToken::new(),
                None,
            ))
        };

        for round in 0..2 {
            let key = negotiate().unwrap();
            prop_assert_eq!(key.remaining, limit, "round {}", round);
            prop_assert_eq!(b.key_capacity(&key.id), Some(limit));

            for used in 1..=limit {
                let nonce = SymmetricCipher::generate_nonce();
                let (ciphertext, sent) = a.encrypt_for(&b_key, &topic, &payload, &nonce).unwrap();
                prop_assert_eq!(sent.remaining, limit - used);
                let opened = b.decrypt(&topic, &nonce, &ciphertext).unwrap();
                prop_assert_eq!(opened.peer, a_key);
                prop_assert_eq!(&opened.plaintext, &payload);
                prop_assert_eq!(opened.key.remaining, limit - used);
            }

            let nonce = SymmetricCipher::generate_nonce();
            let exhausted = a.encrypt_for(&b_key, &topic, &payload, &nonce);
            let exhausted_err = matches!(exhausted, Err(PssError::KeyExhausted { .. }));
            prop_assert!(exhausted_err);
            let reverse = b.encrypt_for(&a_key, &topic, &payload, &nonce);
            let reverse_err = matches!(reverse, Err(PssError::KeyExhausted { .. }));
            prop_assert!(reverse_err);
            prop_assert_eq!(b.key_capacity(&key.id), None);
        }
    }
}
