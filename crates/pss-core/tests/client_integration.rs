//! Protocol client and peer pool behaviour

use std::sync::Arc;
use std::time::Duration;

use pss_core::ping::{ping_protocol, ping_topic, Ping};
use pss_core::{
    Client, Keypair, MemoryNetwork, Msg, MsgReadWriter, PeerAddress, Protocol, Pss, PssConfig,
    PssError, PssResult, Topic, VirtualStream,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn start(network: &MemoryNetwork) -> (Arc<Pss>, Client) {
    let _ = tracing_subscriber::fmt::try_init();
    let keypair = Keypair::generate();
    let overlay = network.join(PeerAddress::from_public_key(&keypair.public_key()));
    let pss = Pss::start(keypair, Arc::new(overlay), PssConfig::default()).unwrap();
    (pss.clone(), Client::new(pss))
}

/// Echo every message back with the code incremented
async fn echo(stream: VirtualStream) -> PssResult<()> {
    loop {
        let msg = stream.read_msg().await?;
        stream
            .write_msg(Msg {
                code: msg.code + 1,
                payload: msg.payload,
            })
            .await?;
    }
}

/// Report every message read to a channel
async fn record(stream: VirtualStream, tx: mpsc::UnboundedSender<Msg>) -> PssResult<()> {
    loop {
        let msg = stream.read_msg().await?;
        let _ = tx.send(msg);
    }
}

fn echo_protocol() -> Protocol {
    Protocol::new("echo", 1, |_ctx, stream| echo(stream))
}

fn recording_protocol(tx: mpsc::UnboundedSender<Msg>) -> Protocol {
    Protocol::new("echo", 1, move |_ctx, stream| record(stream, tx.clone()))
}

#[tokio::test]
async fn test_duplicate_peer_rejected() {
    let network = MemoryNetwork::new();
    let (_, left) = start(&network);
    let (right_pss, right) = start(&network);
    let (ping, _) = Ping::new(false);
    left.run_protocol(CancellationToken::new(), ping_protocol(ping.clone())).unwrap();
    right.run_protocol(CancellationToken::new(), ping_protocol(ping)).unwrap();

    let key = right_pss.public_key();
    let address = right_pss.base_address();
    left.add_pss_peer(key, address.clone(), ping_topic()).await.unwrap();

    let result = left.add_pss_peer(key, address, ping_topic()).await;
    assert!(matches!(result, Err(PssError::DuplicatePeer { .. })));
    assert_eq!(left.peers(&ping_topic()).len(), 1);
}

#[tokio::test]
async fn test_add_peer_without_protocol() {
    let network = MemoryNetwork::new();
    let (_, left) = start(&network);
    let (right_pss, _right) = start(&network);

    let result = left
        .add_pss_peer(right_pss.public_key(), right_pss.base_address(), ping_topic())
        .await;
    assert!(matches!(result, Err(PssError::ProtocolNotRunning(t)) if t == ping_topic()));
}

#[tokio::test]
async fn test_protocol_runs_once_per_topic() {
    let network = MemoryNetwork::new();
    let (_, client) = start(&network);
    let (ping, _) = Ping::new(false);
    client.run_protocol(CancellationToken::new(), ping_protocol(ping.clone())).unwrap();
    assert!(matches!(
        client.run_protocol(CancellationToken::new(), ping_protocol(ping)),
        Err(PssError::TopicAlreadyRegistered(_))
    ));
}

#[tokio::test]
async fn test_cancelled_protocol_accepts_no_peers() {
    let network = MemoryNetwork::new();
    let (_, left) = start(&network);
    let (right_pss, _right) = start(&network);
    let (ping, _) = Ping::new(false);
    let ctx = CancellationToken::new();
    left.run_protocol(ctx.clone(), ping_protocol(ping)).unwrap();

    ctx.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = left
        .add_pss_peer(right_pss.public_key(), right_pss.base_address(), ping_topic())
        .await;
    assert!(matches!(result, Err(PssError::Cancelled)));
}

#[tokio::test]
async fn test_echo_roundtrip_and_inbound_peer() {
    let network = MemoryNetwork::new();
    let (left_pss, left) = start(&network);
    let (right_pss, right) = start(&network);
    let (tx, mut rx) = mpsc::unbounded_channel();
    left.run_protocol(CancellationToken::new(), recording_protocol(tx)).unwrap();
    right.run_protocol(CancellationToken::new(), echo_protocol()).unwrap();
    let topic = Topic::from_protocol("echo", 1);

    left.add_pss_peer(right_pss.public_key(), right_pss.base_address(), topic)
        .await
        .unwrap();
    let stream = left.stream(&right_pss.public_key(), &topic).unwrap();
    for code in [10, 20, 30] {
        stream.write_msg(Msg { code, payload: vec![code as u8] }).await.unwrap();
    }

    for code in [11, 21, 31] {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for echo")
            .unwrap();
        assert_eq!(msg.code, code, "Echoes arrive in order");
    }

    // Right never called add_pss_peer; the stream came from inbound traffic.
    assert_eq!(right.peers(&topic), vec![left_pss.public_key()]);
}

#[tokio::test]
async fn test_run_end_removes_stream() {
    let network = MemoryNetwork::new();
    let (_, left) = start(&network);
    let (right_pss, right) = start(&network);
    let finishing = Protocol::new("oneshot", 1, |_ctx, _stream| async { Ok::<_, PssError>(()) });
    left.run_protocol(CancellationToken::new(), finishing.clone()).unwrap();
    right.run_protocol(CancellationToken::new(), finishing.clone()).unwrap();

    left.add_pss_peer(right_pss.public_key(), right_pss.base_address(), finishing.topic())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !left.peers(&finishing.topic()).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Finished run should leave the pool");

    // Re-adding after the run ended is allowed.
    left.add_pss_peer(right_pss.public_key(), right_pss.base_address(), finishing.topic())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_streams() {
    let network = MemoryNetwork::new();
    let (_, left) = start(&network);
    let (right_pss, right) = start(&network);
    left.run_protocol(CancellationToken::new(), echo_protocol()).unwrap();
    right.run_protocol(CancellationToken::new(), echo_protocol()).unwrap();
    let topic = Topic::from_protocol("echo", 1);

    left.add_pss_peer(right_pss.public_key(), right_pss.base_address(), topic)
        .await
        .unwrap();
    let stream = left.stream(&right_pss.public_key(), &topic).unwrap();

    left.shutdown();
    assert!(stream.is_closed());
    assert!(left.peers(&topic).is_empty());
    assert!(matches!(
        stream.write_msg(Msg { code: 0, payload: vec![] }).await,
        Err(PssError::StreamClosed { .. })
    ));
}

#[tokio::test]
async fn test_remove_unknown_peer_is_noop() {
    let network = MemoryNetwork::new();
    let (_, client) = start(&network);
    assert!(!client.remove_pss_peer(&Keypair::generate().public_key(), &ping_topic()));
}

#[tokio::test]
async fn test_removed_peer_stays_removed() {
    let network = MemoryNetwork::new();
    let (left_pss, left) = start(&network);
    let (right_pss, right) = start(&network);
    let (tx, mut rx) = mpsc::unbounded_channel();
    left.run_protocol(CancellationToken::new(), recording_protocol(tx)).unwrap();
    right.run_protocol(CancellationToken::new(), echo_protocol()).unwrap();
    let topic = Topic::from_protocol("echo", 1);
    let right_key = right_pss.public_key();

    left.add_pss_peer(right_key, right_pss.base_address(), topic)
        .await
        .unwrap();
    let stream = left.stream(&right_key, &topic).unwrap();
    stream.write_msg(Msg { code: 1, payload: vec![] }).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for echo")
        .unwrap();

    assert!(left.remove_pss_peer(&right_key, &topic));
    assert!(left_pss.handshake().keys(&right_key, &topic).is_empty());

    // Right still holds the old key and keeps talking.
    let reverse = right.stream(&left_pss.public_key(), &topic).unwrap();
    reverse.write_msg(Msg { code: 7, payload: vec![] }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(left.peers(&topic).is_empty());
    assert!(left.stream(&right_key, &topic).is_none());
    assert!(rx.try_recv().is_err());
}
