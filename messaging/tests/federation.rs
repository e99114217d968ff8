//! Two nodes talking over real sockets on the loopback interface: unicast
//! delivery with ack, queue-and-retry, and directory propagation via gossip.

use messaging::{managers, Engine, NonceLedger, OutboundEvent, Queue, Router};
use std::{sync::Arc, time::Duration};
use util::db::DbPath;

struct TestNode {
    engine: Engine,
    _workers: Vec<tokio::task::JoinHandle<()>>,
}

impl TestNode {
    async fn listen_addrs(&self) -> Vec<libp2p::Multiaddr> {
        for _ in 0..100 {
            let addrs = self.engine.transport().listeners().await;
            if !addrs.is_empty() {
                return addrs;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("transport never bound a listener");
    }
}

async fn test_node() -> TestNode {
    let (directory_tx, directory_rx) = tokio::sync::mpsc::unbounded_channel();
    let (peer_tx, peer_rx) = tokio::sync::mpsc::unbounded_channel();

    let (transport, transport_events, incoming) = swarm::start(swarm::TransportConfig {
        keypair: crypto::KeyPair::generate(),
        listen: util::BindAddrs::parse_multiaddr("/ip4/127.0.0.1/tcp/0").unwrap(),
        topics: messaging::TOPICS.iter().map(|t| t.to_string()).collect(),
        enable_mdns: false,
        idle_timeout: Duration::from_secs(60),
    })
    .await
    .unwrap();
    let registry = Arc::new(swarm::PeerRegistry::open(DbPath::Memory, transport.clone(), 1, peer_tx).unwrap());

    let queue = Queue::open(DbPath::Memory).unwrap();
    let engine = Engine::new(
        identity::IdentityStore::open(DbPath::Memory).unwrap(),
        identity::Directory::open(DbPath::Memory, directory_tx).unwrap(),
        registry,
        queue.clone(),
        NonceLedger::new(queue),
        Router::new(),
        transport,
    );
    let workers = managers::spawn_all(
        engine.clone(),
        transport_events,
        peer_rx,
        directory_rx,
        incoming,
        identity::DIRECTORY_TTL,
    );
    TestNode {
        engine,
        _workers: workers,
    }
}

async fn connect(from: &TestNode, to: &TestNode) {
    let peer = to.engine.transport().local_peer_id();
    let addrs = to.listen_addrs().await;
    from.engine.registry().add_known(peer, addrs);
    assert!(from.engine.registry().connect(peer).await, "could not connect");
    // wait until the receiving side has seen the connection as well
    for _ in 0..100 {
        if to.engine.registry().sufficient() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("receiver never registered the connection");
}

fn capture_handler(
    node: &TestNode,
) -> tokio::sync::mpsc::UnboundedReceiver<(String, Vec<u8>)> {
    let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();
    node.engine.router().app("friends").service("friends").event(
        "invite",
        Arc::new(move |event: messaging::Event| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                seen_tx.send((event.from.clone(), event.content.clone())).ok();
                Ok(())
            })
        }),
    );
    seen_rx
}

#[tokio::test]
async fn unicast_delivery_with_ack() {
    let a = test_node().await;
    let b = test_node().await;
    connect(&b, &a).await;

    let aid = a
        .engine
        .identities()
        .create("alice", "person", "Alice", identity::Privacy::Public, serde_json::json!({}))
        .unwrap();
    let bid = b
        .engine
        .identities()
        .create("bob", "person", "Bob", identity::Privacy::Public, serde_json::json!({}))
        .unwrap();
    let mut seen = capture_handler(&a);

    // B knows where Alice lives via its directory
    b.engine
        .directory()
        .create(&aid.directory_entry(a.engine.transport().local_peer_id().to_string()))
        .unwrap();

    b.engine
        .send(OutboundEvent {
            from: bid.id.clone(),
            to: aid.id.clone(),
            service: "friends".to_owned(),
            event: "invite".to_owned(),
            content: b"{\"name\":\"Bob\"}".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();

    let (from, content) = tokio::time::timeout(Duration::from_secs(10), seen.recv())
        .await
        .expect("event never arrived")
        .unwrap();
    assert_eq!(from, bid.id);
    assert_eq!(content, b"{\"name\":\"Bob\"}");

    // delivered, so nothing is left in any queue
    assert!(b.engine.queue().entity_rows(&aid.id).unwrap().is_empty());

    // exactly once
    assert!(tokio::time::timeout(Duration::from_millis(300), seen.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn queued_message_is_delivered_after_discovery() {
    let a = test_node().await;
    let b = test_node().await;

    let aid = a
        .engine
        .identities()
        .create("alice", "person", "Alice", identity::Privacy::Public, serde_json::json!({}))
        .unwrap();
    let bid = b
        .engine
        .identities()
        .create("bob", "person", "Bob", identity::Privacy::Public, serde_json::json!({}))
        .unwrap();
    let mut seen = capture_handler(&a);

    let peer_a = a.engine.transport().local_peer_id();
    // B knows the hosting peer but has no address for it yet
    b.engine
        .directory()
        .create(&aid.directory_entry(peer_a.to_string()))
        .unwrap();

    b.engine
        .send(OutboundEvent {
            from: bid.id.clone(),
            to: aid.id.clone(),
            service: "friends".to_owned(),
            event: "invite".to_owned(),
            content: b"{\"name\":\"Bob\"}".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(b.engine.queue().peer_rows(&peer_a.to_string()).unwrap().len(), 1);

    // discovery of the peer's address fires the queue check
    for addr in a.listen_addrs().await {
        b.engine.registry().discovered_address(peer_a, addr);
    }

    let (from, _) = tokio::time::timeout(Duration::from_secs(10), seen.recv())
        .await
        .expect("queued event never arrived")
        .unwrap();
    assert_eq!(from, bid.id);

    for _ in 0..100 {
        if b.engine.queue().peer_rows(&peer_a.to_string()).unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("queue row was not removed after delivery");
}

#[tokio::test]
async fn directory_entries_propagate_via_gossip() {
    let a = test_node().await;
    let b = test_node().await;
    connect(&b, &a).await;

    let bid = b
        .engine
        .identities()
        .create("bob", "person", "Bob", identity::Privacy::Public, serde_json::json!({}))
        .unwrap();
    let entry = bid.directory_entry(b.engine.transport().local_peer_id().to_string());

    // gossipsub needs a moment to graft the mesh; keep announcing until the
    // entry lands on the other side
    for _ in 0..60 {
        b.engine.publish_directory_entry(entry.clone()).await.unwrap();
        b.engine.drain_broadcasts().await.unwrap();
        if let Some(found) = a.engine.directory().by_id(&bid.id).unwrap() {
            assert_eq!(found.location, b.engine.transport().local_peer_id().to_string());
            assert_eq!(found.name, "Bob");
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("directory entry never arrived via gossip");
}
