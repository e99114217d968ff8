//! End-to-end behaviour of a single node: self-send through the loopback
//! pipe, queue parking for unknown recipients, and broadcast deferral
//! without peers.

use messaging::{managers, Engine, NonceLedger, OutboundEvent, Queue, Router};
use std::{sync::Arc, time::Duration};
use util::db::DbPath;

struct Node {
    engine: Engine,
    _workers: Vec<tokio::task::JoinHandle<()>>,
}

async fn node() -> Node {
    let (directory_tx, directory_rx) = tokio::sync::mpsc::unbounded_channel();
    let (peer_tx, peer_rx) = tokio::sync::mpsc::unbounded_channel();

    let identities = identity::IdentityStore::open(DbPath::Memory).unwrap();
    let directory = identity::Directory::open(DbPath::Memory, directory_tx).unwrap();
    let queue = Queue::open(DbPath::Memory).unwrap();
    let nonces = NonceLedger::new(queue.clone());
    let router = Router::new();

    let (transport, transport_events, incoming) = swarm::start(swarm::TransportConfig {
        keypair: crypto::KeyPair::generate(),
        listen: util::BindAddrs::empty(),
        topics: messaging::TOPICS.iter().map(|t| t.to_string()).collect(),
        enable_mdns: false,
        idle_timeout: Duration::from_secs(60),
    })
    .await
    .unwrap();
    let registry = Arc::new(swarm::PeerRegistry::open(DbPath::Memory, transport.clone(), 1, peer_tx).unwrap());

    let engine = Engine::new(identities, directory, registry, queue, nonces, router, transport);
    let workers = managers::spawn_all(
        engine.clone(),
        transport_events,
        peer_rx,
        directory_rx,
        incoming,
        identity::DIRECTORY_TTL,
    );
    Node {
        engine,
        _workers: workers,
    }
}

#[tokio::test]
async fn self_send_invokes_local_handler_once() {
    let node = node().await;
    let engine = &node.engine;

    let alice = engine
        .identities()
        .create(
            "alice",
            "person",
            "Alice",
            identity::Privacy::Private,
            serde_json::json!({}),
        )
        .unwrap();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    engine.router().app("friends").service("friends").event(
        "invite",
        Arc::new(move |event: messaging::Event| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                seen_tx
                    .send((event.from.clone(), event.content.clone(), event.user.clone()))
                    .ok();
                Ok(())
            })
        }),
    );

    engine
        .send(OutboundEvent {
            from: alice.id.clone(),
            to: alice.id.clone(),
            service: "friends".to_owned(),
            event: "invite".to_owned(),
            content: b"{\"name\":\"Bob\"}".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();

    let (from, content, user) = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("handler was not invoked")
        .unwrap();
    assert_eq!(from, alice.id);
    assert_eq!(content, b"{\"name\":\"Bob\"}");
    assert_eq!(user.as_deref(), Some("alice"));

    // exactly once: no duplicate delivery shows up afterwards
    assert!(tokio::time::timeout(Duration::from_millis(300), seen_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn unknown_recipient_is_parked_in_the_entity_queue() {
    let node = node().await;
    let engine = &node.engine;

    let alice = engine
        .identities()
        .create(
            "alice",
            "person",
            "Alice",
            identity::Privacy::Private,
            serde_json::json!({}),
        )
        .unwrap();

    // a valid-looking entity id that no one here owns
    let stranger = crypto::KeyPair::generate().pub_key().to_string();
    engine
        .send(OutboundEvent {
            from: alice.id,
            to: stranger.clone(),
            service: "friends".to_owned(),
            event: "invite".to_owned(),
            content: b"{}".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();

    let rows = engine.queue().entity_rows(&stranger).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].service, "friends");
}

#[tokio::test]
async fn broadcast_without_peers_is_deferred() {
    let node = node().await;
    let engine = &node.engine;

    engine
        .send(OutboundEvent {
            service: "directory".to_owned(),
            event: "publish".to_owned(),
            content: b"{}".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();

    let broadcasts = engine.queue().broadcast_rows().unwrap();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].topic, messaging::TOPIC_MESSAGES);
}

#[tokio::test]
async fn replayed_nonce_is_dropped() {
    let node = node().await;
    let engine = &node.engine;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    engine.router().app("friends").service("friends").event(
        "invite",
        Arc::new(move |event: messaging::Event| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                seen_tx.send(event.id.clone()).ok();
                Ok(())
            })
        }),
    );

    // an anonymous broadcast frame, as another peer would gossip it
    let frame = messaging::Frame {
        headers: messaging::Headers {
            frame_type: "msg".to_owned(),
            service: "friends".to_owned(),
            event: "invite".to_owned(),
            id: "m-replay".to_owned(),
            timestamp: util::unix_now(),
            nonce: messaging::nonce(),
            ..Default::default()
        },
        content: b"{}".to_vec(),
        data: Vec::new(),
        file: None,
    };
    let bytes = frame.to_message().unwrap();
    let sender = libp2p::PeerId::from(crypto::KeyPair::generate());

    engine
        .receive_gossip(messaging::TOPIC_MESSAGES.to_owned(), Some(sender), bytes.clone())
        .await;
    engine
        .receive_gossip(messaging::TOPIC_MESSAGES.to_owned(), Some(sender), bytes)
        .await;

    // dispatched exactly once, the replay is dropped by the nonce ledger
    assert!(seen_rx.recv().await.is_some());
    assert!(tokio::time::timeout(Duration::from_millis(300), seen_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn tampered_content_is_dropped() {
    let node = node().await;
    let engine = &node.engine;

    let alice = engine
        .identities()
        .create(
            "alice",
            "person",
            "Alice",
            identity::Privacy::Private,
            serde_json::json!({}),
        )
        .unwrap();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    engine.router().app("friends").service("friends").event(
        "invite",
        Arc::new(move |event: messaging::Event| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                seen_tx.send(event.id.clone()).ok();
                Ok(())
            })
        }),
    );

    let mut headers = messaging::Headers {
        frame_type: "msg".to_owned(),
        from: alice.id.clone(),
        service: "friends".to_owned(),
        event: "invite".to_owned(),
        id: "m-tampered".to_owned(),
        timestamp: util::unix_now(),
        nonce: messaging::nonce(),
        ..Default::default()
    };
    headers.sign(&alice.keypair(), b"", b"{\"name\":\"Bob\"}", b"");
    let frame = messaging::Frame {
        headers,
        // one byte flipped relative to what was signed
        content: b"{\"name\":\"Bub\"}".to_vec(),
        data: Vec::new(),
        file: None,
    };

    engine
        .receive_gossip(
            messaging::TOPIC_MESSAGES.to_owned(),
            Some(libp2p::PeerId::from(crypto::KeyPair::generate())),
            frame.to_message().unwrap(),
        )
        .await;

    assert!(tokio::time::timeout(Duration::from_millis(300), seen_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn invalid_send_arguments_are_rejected() {
    let node = node().await;
    assert!(node
        .engine
        .send(OutboundEvent {
            service: "Not A Service".to_owned(),
            event: "invite".to_owned(),
            ..Default::default()
        })
        .await
        .is_err());
    assert!(node
        .engine
        .send(OutboundEvent {
            to: "short".to_owned(),
            service: "friends".to_owned(),
            event: "invite".to_owned(),
            ..Default::default()
        })
        .await
        .is_err());
}
