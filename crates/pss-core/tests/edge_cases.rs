//! Edge cases of the messaging core
//!
//! Malformed input, unknown topics, foreign envelopes and payload extremes.

use std::sync::Arc;
use std::time::Duration;

use pss_core::crypto::{SealedBox, SymmetricCipher};
use pss_core::{
    Envelope, Flags, HandlerCaps, IncomingMessage, Keypair, MemoryNetwork, Overlay, PeerAddress,
    Pss, PssConfig, PssError, Topic,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

fn node(network: &MemoryNetwork) -> (Arc<Pss>, Keypair) {
    let _ = tracing_subscriber::fmt::try_init();
    let keypair = Keypair::generate();
    let copy = Keypair::from_seed(keypair.to_bytes());
    let overlay = network.join(PeerAddress::from_public_key(&keypair.public_key()));
    let pss = Pss::start(keypair, Arc::new(overlay), PssConfig::default()).unwrap();
    (pss, copy)
}

fn listen(pss: &Pss, topic: Topic) -> UnboundedReceiver<IncomingMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    pss.register(
        topic,
        Arc::new(move |msg| {
            let _ = tx.send(msg);
            Ok(())
        }),
        HandlerCaps::default(),
    )
    .unwrap();
    rx
}

async fn recv(rx: &mut UnboundedReceiver<IncomingMessage>) -> IncomingMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for message")
        .expect("Handler channel closed")
}

async fn assert_silent(rx: &mut UnboundedReceiver<IncomingMessage>) {
    let got = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(got.is_err(), "No message expected");
}

// ============================================================================
// Routing
// ============================================================================

/// Messages on a topic nobody registered are dropped; other topics still work
#[tokio::test]
async fn test_unknown_topic_dropped() {
    let network = MemoryNetwork::new();
    let (a, _) = node(&network);
    let (b, _) = node(&network);
    let known = Topic::from_protocol("known", 1);
    let unknown = Topic::from_protocol("unknown", 1);
    for topic in [known, unknown] {
        a.set_peer_public_key(b.public_key(), topic, b.base_address());
    }
    let mut rx = listen(&b, known);

    a.send_asym(&b.public_key(), &unknown, b"lost").unwrap();
    a.send_asym(&b.public_key(), &known, b"kept").unwrap();

    let msg = recv(&mut rx).await;
    assert_eq!(msg.payload, b"kept");
    assert_eq!(msg.topic, known);
    assert_silent(&mut rx).await;
}

/// Garbage on the overlay is dropped and does not stop the receive loop
#[tokio::test]
async fn test_garbage_does_not_stop_receiving() {
    let network = MemoryNetwork::new();
    let (a, _) = node(&network);
    let (b, _) = node(&network);
    let topic = Topic::from_protocol("garbage", 1);
    a.set_peer_public_key(b.public_key(), topic, b.base_address());
    let mut rx = listen(&b, topic);

    let rogue = network.join(PeerAddress(vec![0xee; 4]));
    for garbage in [vec![], vec![0xff; 7], vec![0x01; 300]] {
        rogue.send_envelope(&b.base_address(), garbage).unwrap();
    }

    a.send_asym(&b.public_key(), &topic, b"after").unwrap();
    assert_eq!(recv(&mut rx).await.payload, b"after");
}

// ============================================================================
// Malformed envelopes
// ============================================================================

/// An envelope from a future protocol version is refused
#[tokio::test]
async fn test_wrong_version_rejected() {
    let network = MemoryNetwork::new();
    let (b, _) = node(&network);
    let mut envelope = Envelope::new(
        Topic::from_protocol("v", 1),
        Flags::RAW,
        [0u8; 12],
        b"hi".to_vec(),
    );
    envelope.version = 2;

    let result = b.receive(&envelope.to_bytes().unwrap());
    assert!(matches!(result, Err(PssError::EnvelopeVersionUnsupported(2))));
}

/// A symmetric envelope under an unknown key is dropped without error
#[tokio::test]
async fn test_unknown_session_key_dropped() {
    let network = MemoryNetwork::new();
    let (b, _) = node(&network);
    let topic = Topic::from_protocol("sym", 1);
    let mut rx = listen(&b, topic);

    let nonce = SymmetricCipher::generate_nonce();
    let cipher = SymmetricCipher::new(&SymmetricCipher::generate_key());
    let ciphertext = cipher.encrypt_with_nonce(b"secret", &nonce).unwrap();
    let envelope = Envelope::new(topic, Flags::SYMMETRIC, nonce, ciphertext);

    b.receive(&envelope.to_bytes().unwrap()).unwrap();
    assert_silent(&mut rx).await;
}

/// A sealed envelope for another node is ignored
#[tokio::test]
async fn test_sealed_for_someone_else_ignored() {
    let network = MemoryNetwork::new();
    let (_, a_keys) = node(&network);
    let (b, _) = node(&network);
    let (c, _) = node(&network);
    let topic = Topic::from_protocol("sealed", 1);
    let mut b_rx = listen(&b, topic);

    let nonce = SymmetricCipher::generate_nonce();
    let sealed = SealedBox::seal(&a_keys, &c.public_key(), b"for c", &nonce).unwrap();
    let envelope = Envelope::new(topic, Flags::ASYMMETRIC, nonce, sealed.encode().unwrap());

    b.receive(&envelope.to_bytes().unwrap()).unwrap();
    assert_silent(&mut b_rx).await;
}

/// A sealed box claiming the wrong sender does not open
#[tokio::test]
async fn test_forged_sender_rejected() {
    let network = MemoryNetwork::new();
    let (a, a_keys) = node(&network);
    let (b, _) = node(&network);
    let topic = Topic::from_protocol("forged", 1);
    let mut rx = listen(&b, topic);

    let nonce = SymmetricCipher::generate_nonce();
    let mut sealed = SealedBox::seal(&a_keys, &b.public_key(), b"from a", &nonce).unwrap();
    sealed.sender = Keypair::generate().public_key();
    let envelope = Envelope::new(topic, Flags::ASYMMETRIC, nonce, sealed.encode().unwrap());

    b.receive(&envelope.to_bytes().unwrap()).unwrap();
    assert_silent(&mut rx).await;
    assert!(b.handshake().keys(&a.public_key(), &topic).is_empty());
}

// ============================================================================
// Payload sizes
// ============================================================================

/// Empty and large payloads survive both encryption modes
#[tokio::test]
async fn test_payload_extremes() {
    let network = MemoryNetwork::new();
    let (a, _) = node(&network);
    let (b, _) = node(&network);
    let topic = Topic::from_protocol("sizes", 1);
    a.set_peer_public_key(b.public_key(), topic, b.base_address());
    let mut rx = listen(&b, topic);

    let large: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

    a.send_asym(&b.public_key(), &topic, &[]).unwrap();
    assert!(recv(&mut rx).await.payload.is_empty());
    a.send_asym(&b.public_key(), &topic, &large).unwrap();
    assert_eq!(recv(&mut rx).await.payload, large);

    a.ensure_key(&b.public_key(), &topic, &CancellationToken::new(), 0)
        .await
        .unwrap();
    a.send_sym(&b.public_key(), &topic, &[]).unwrap();
    assert!(recv(&mut rx).await.payload.is_empty());
    a.send_sym(&b.public_key(), &topic, &large).unwrap();
    assert_eq!(recv(&mut rx).await.payload, large);
}
