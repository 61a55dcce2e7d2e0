//! Integration tests for bootstrap discovery, handshake verification and
//! reconnection.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use servmesh::messages::{Frame, HandshakePacket};
use servmesh::session::client_handshake;
use servmesh::transport::{TcpTransport, Transport};
use servmesh::{
    generate_secret_key, Context, Identity, Keypair, Node, NodeConfig, PublicKey, Reply,
    RECONNECT_ATTEMPTS, RECONNECT_DELAY,
};
use tokio::time::timeout;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(32000);

fn test_addr() -> String {
    format!("127.0.0.1:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn keyed_node() -> Node {
    Node::start(NodeConfig::default().with_secret_key(generate_secret_key()))
        .await
        .expect("start failed")
}

async fn first_addr(node: &Node) -> String {
    node.local_addrs().await[0].clone()
}

async fn knows(node: &Node, key: PublicKey) -> bool {
    node.peers().await.iter().any(|p| *p.key() == key)
}

/// Poll `cond` until it holds or the test timeout expires.
async fn eventually<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(TEST_TIMEOUT, async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn services(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn bootstrap_links_both_routing_tables() {
    let a = keyed_node().await;
    let a_addr = first_addr(&a).await;
    let b = Node::start(
        NodeConfig::default()
            .with_secret_key(generate_secret_key())
            .bootstrap(a_addr),
    )
    .await
    .unwrap();

    assert!(knows(&b, a.public_key().unwrap()).await);
    assert!(knows(&a, b.public_key().unwrap()).await);
    assert!(b.providers_for(&services(&["x"])).await.is_empty());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn new_service_is_seen_after_reconnect() {
    let a = keyed_node().await;
    let b = Node::start(
        NodeConfig::default()
            .with_secret_key(generate_secret_key())
            .bootstrap(first_addr(&a).await),
    )
    .await
    .unwrap();
    assert!(b.providers_for(&services(&["x"])).await.is_empty());

    a.register_service("x", |ctx: Context| async move {
        Ok::<_, anyhow::Error>(Reply::new(ctx.body.bytes().await?))
    })
    .await;
    // Registering alone does not re-announce.
    assert!(b.providers_for(&services(&["x"])).await.is_empty());

    // Drop the link from A's side; B dialed it, so B re-dials and handshakes again.
    for provider in a.providers().await {
        provider.close();
    }
    eventually("B to learn about x", || async {
        !b.providers_for(&services(&["x"])).await.is_empty()
    })
    .await;

    let providers = b.providers_for(&services(&["x"])).await;
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].key(), a.public_key());
    assert!(knows(&b, a.public_key().unwrap()).await);

    let response = b.push(&services(&["x"]), Default::default(), b"ping").await.unwrap();
    assert_eq!(response.bytes().await.unwrap(), b"ping");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn bootstrap_discovers_peers_of_peers() {
    let a = keyed_node().await;
    let a_addr = first_addr(&a).await;
    let b = Node::start(
        NodeConfig::default()
            .with_secret_key(generate_secret_key())
            .bootstrap(a_addr.clone()),
    )
    .await
    .unwrap();
    let c = Node::start(
        NodeConfig::default()
            .with_secret_key(generate_secret_key())
            .bootstrap(a_addr),
    )
    .await
    .unwrap();

    let b_key = b.public_key().unwrap();
    assert!(knows(&c, b_key).await, "C learns B through A");
    assert!(!c.peers().await.iter().any(|p| Some(*p.key()) == c.public_key()));

    // A second pass dials B directly; nothing new turns up.
    let discovered = timeout(TEST_TIMEOUT, c.bootstrap()).await.unwrap().unwrap();
    assert!(discovered.is_empty());
    assert!(c.providers().await.iter().any(|p| p.key() == Some(b_key)));

    for node in [a, b, c] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn bootstrap_skips_unreachable_peers() {
    let a = keyed_node().await;
    // A peer that can never be reached: nothing listens on its address.
    let ghost = Identity::with_addr(Keypair::generate().public_key(), "127.0.0.1:1").unwrap();
    let b = Node::start(
        NodeConfig::default()
            .with_secret_key(generate_secret_key())
            .bootstrap("127.0.0.1:1")
            .bootstrap(first_addr(&a).await),
    )
    .await
    .expect("unreachable seeds are not fatal");
    assert!(knows(&b, a.public_key().unwrap()).await);
    assert!(!knows(&b, *ghost.key()).await);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn forged_handshake_signature_is_rejected() {
    let a = keyed_node().await;
    let addr = first_addr(&a).await;

    let conn = TcpTransport.connect(&addr).await.unwrap();
    let session = client_handshake(conn).await.unwrap();
    let binding = *session.binding();

    let claimed = Keypair::generate();
    let signer = Keypair::generate();
    let forged = HandshakePacket::signed(
        Identity::with_addr(claimed.public_key(), "127.0.0.1:9").unwrap(),
        services(&["evil"]),
        &signer,
        &binding,
    )
    .unwrap();
    assert!(forged.verify(&binding).is_err());

    let (mut reader, mut writer) = session.split();
    writer
        .write_frame(&Frame::from_packet(1, &forged).unwrap())
        .await
        .unwrap();

    let reply = timeout(TEST_TIMEOUT, reader.read_frame()).await.unwrap();
    assert!(!matches!(reply, Ok(Some(_))), "no handshake reply for a forged identity");

    assert!(!knows(&a, claimed.public_key()).await);
    eventually("A to drop the connection", || async { a.providers().await.is_empty() }).await;
    assert!(a.providers_for(&services(&["evil"])).await.is_empty());

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_handshake_closes_connection() {
    let a = keyed_node().await;
    let addr = first_addr(&a).await;

    let conn = TcpTransport.connect(&addr).await.unwrap();
    let session = client_handshake(conn).await.unwrap();
    let binding = *session.binding();
    let (mut reader, mut writer) = session.split();

    let keypair = Keypair::generate();
    let ours = HandshakePacket::signed(
        Identity::with_addr(keypair.public_key(), "127.0.0.1:9").unwrap(),
        Vec::new(),
        &keypair,
        &binding,
    )
    .unwrap();

    writer.write_frame(&Frame::from_packet(7, &ours).unwrap()).await.unwrap();
    let reply = timeout(TEST_TIMEOUT, reader.read_frame())
        .await
        .unwrap()
        .unwrap()
        .expect("handshake reply");
    assert_eq!(reply.seq, 7, "reply echoes the request sequence number");
    let theirs: HandshakePacket = reply.packet().unwrap();
    assert_eq!(theirs.verify(&binding).unwrap().map(|id| *id.key()), a.public_key());
    assert!(knows(&a, keypair.public_key()).await);

    writer.write_frame(&Frame::from_packet(8, &ours).unwrap()).await.unwrap();
    let after = timeout(TEST_TIMEOUT, reader.read_frame()).await.unwrap();
    assert!(!matches!(after, Ok(Some(_))));

    eventually("A to forget the peer", || async {
        !knows(&a, keypair.public_key()).await && a.providers().await.is_empty()
    })
    .await;

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnects_when_peer_restarts() {
    let secret = generate_secret_key();
    let addr = test_addr();
    let start_a = || {
        Node::start(
            NodeConfig::default()
                .with_secret_key(secret.clone())
                .bind(addr.clone()),
        )
    };

    let a = start_a().await.unwrap();
    let a_key = a.public_key().unwrap();
    let b = Node::start(
        NodeConfig::default()
            .with_secret_key(generate_secret_key())
            .bootstrap(addr.clone()),
    )
    .await
    .unwrap();
    assert!(knows(&b, a_key).await);

    a.shutdown().await.unwrap();
    eventually("B to forget A", || async { !knows(&b, a_key).await }).await;

    // Come back well within the retry budget.
    tokio::time::sleep(RECONNECT_DELAY).await;
    let a = start_a().await.unwrap();
    eventually("B to reconnect", || async { knows(&b, a_key).await }).await;
    assert_eq!(b.providers().await.len(), 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnection_gives_up_after_budget() {
    let a = keyed_node().await;
    let b = Node::start(
        NodeConfig::default()
            .with_secret_key(generate_secret_key())
            .bootstrap(first_addr(&a).await),
    )
    .await
    .unwrap();
    a.shutdown().await.unwrap();

    let budget = RECONNECT_DELAY * (RECONNECT_ATTEMPTS + 2);
    tokio::time::sleep(budget).await;
    assert!(b.providers().await.is_empty());
    assert!(b.peers().await.is_empty());

    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn inbound_links_are_not_redialed() {
    let a = keyed_node().await;
    let b = keyed_node().await;
    b.connect(&first_addr(&a).await).await.unwrap();
    let b_key = b.public_key().unwrap();

    for provider in b.providers().await {
        provider.close();
    }
    eventually("A to notice", || async { a.providers().await.is_empty() }).await;

    tokio::time::sleep(RECONNECT_DELAY * 3).await;
    assert!(a.providers().await.is_empty(), "A never dialed B");
    assert!(b.providers().await.is_empty(), "B closed it locally");
    assert!(!knows(&a, b_key).await);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn handshake_replayed_on_another_session_is_rejected() {
    let a = keyed_node().await;
    let addr = first_addr(&a).await;

    let first = client_handshake(TcpTransport.connect(&addr).await.unwrap())
        .await
        .unwrap();
    let keypair = Keypair::generate();
    let captured = HandshakePacket::signed(
        Identity::with_addr(keypair.public_key(), "127.0.0.1:9").unwrap(),
        Vec::new(),
        &keypair,
        first.binding(),
    )
    .unwrap();
    drop(first);

    let second = client_handshake(TcpTransport.connect(&addr).await.unwrap())
        .await
        .unwrap();
    let (mut reader, mut writer) = second.split();
    writer
        .write_frame(&Frame::from_packet(1, &captured).unwrap())
        .await
        .unwrap();

    let reply = timeout(TEST_TIMEOUT, reader.read_frame()).await.unwrap();
    assert!(!matches!(reply, Ok(Some(_))), "a signature from another session is refused");
    assert!(!knows(&a, keypair.public_key()).await);

    a.shutdown().await.unwrap();
}
