use crate::{
    event::{message_id, Event, OutboundEvent, Reply},
    headers::{Headers, TYPE_ACK, TYPE_BYE, TYPE_MSG},
    nonce::{nonce, NonceLedger},
    queue::{Queue, QueuedBroadcast, QueuedMessage},
    router::Router,
    wire::{self, Frame, CHALLENGE_LEN},
};
use anyhow::{anyhow, Context, Result};
use futures::{AsyncReadExt, AsyncWriteExt};
use identity::{locate, Directory, DirectoryEntry, FollowUp, Identity, IdentityStore, Method, Privacy};
use libp2p::PeerId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc, time::Duration};
use swarm::{EventStream, OpenedStream, PeerRegistry, Transport};
use tokio::time::timeout;
use tracing::*;
use util::{
    formats::{audit, CoreError},
    patterns, unix_now,
};

pub const TOPIC_DIRECTORY: &str = "directory";
pub const TOPIC_PEERS: &str = "peers";
pub const TOPIC_MESSAGES: &str = "messages/1";

/// The well-known topics every node joins.
pub const TOPICS: &[&str] = &[TOPIC_DIRECTORY, TOPIC_PEERS, TOPIC_MESSAGES];

/// Reads on an open stream give up after this long; the stream is closed and
/// the peer marked disconnected.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a shutdown `bye` is allowed to take per peer.
const BYE_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory entries published in response to a seed download request.
const DOWNLOAD_BATCH: usize = 50;

/// A peer announcing its own addresses on the peers topic.
#[derive(Debug, Serialize, Deserialize)]
struct PeerAnnouncement {
    id: String,
    addresses: Vec<String>,
}

struct Inner {
    identities: IdentityStore,
    directory: Directory,
    registry: Arc<PeerRegistry>,
    queue: Queue,
    nonces: NonceLedger,
    router: Arc<Router>,
    transport: Transport,
}

/// The protocol engine: everything between the transport and the registered
/// handlers. Cloning is cheap and shares the same state, so per-stream tasks
/// just carry their own handle.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identities: IdentityStore,
        directory: Directory,
        registry: Arc<PeerRegistry>,
        queue: Queue,
        nonces: NonceLedger,
        router: Arc<Router>,
        transport: Transport,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identities,
                directory,
                registry,
                queue,
                nonces,
                router,
                transport,
            }),
        }
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.inner.identities
    }

    pub fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    pub fn nonces(&self) -> &NonceLedger {
        &self.inner.nonces
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    // ------------------------------------------------------------ identity

    /// Create an identity; public ones are announced in the directory right
    /// away (deferred through the broadcast queue while peerless).
    pub async fn create_identity(
        &self,
        user: &str,
        class: &str,
        name: &str,
        privacy: Privacy,
        data: serde_json::Value,
    ) -> Result<Identity> {
        let identity = self.inner.identities.create(user, class, name, privacy, data)?;
        if identity.privacy == Privacy::Public {
            let entry = identity.directory_entry(self.inner.transport.local_peer_id().to_string());
            self.inner.directory.create(&entry)?;
            self.inner.identities.mark_published(&identity.id, unix_now())?;
            if let Err(err) = self.publish_directory_entry(entry).await {
                warn!(id = %identity.id, %err, "identity announcement failed");
            }
        }
        Ok(identity)
    }

    // ---------------------------------------------------------------- send

    /// Send an event. Succeeds as soon as the message is either delivered or
    /// parked in a queue; only validation and fatal store errors surface.
    /// Returns the message id.
    pub async fn send(&self, event: OutboundEvent) -> Result<String> {
        if !patterns::is_constant(&event.service) {
            return Err(CoreError::Validation(format!("invalid service {:?}", event.service)).into());
        }
        if !patterns::is_constant(&event.event) {
            return Err(CoreError::Validation(format!("invalid event {:?}", event.event)).into());
        }
        if !event.from.is_empty() && !patterns::is_entity(&event.from) {
            return Err(CoreError::Validation(format!("invalid sender {:?}", event.from)).into());
        }
        if !event.to.is_empty() && !patterns::is_address(&event.to) {
            return Err(CoreError::Validation(format!("invalid recipient {:?}", event.to)).into());
        }
        let id = message_id();
        if event.to.is_empty() {
            self.publish_event(QueuedBroadcast {
                id: id.clone(),
                topic: TOPIC_MESSAGES.to_owned(),
                sender: event.from,
                service: event.service,
                event: event.event,
                content: event.content,
                data: event.data,
                created: unix_now(),
            })
            .await?;
            return Ok(id);
        }
        let msg = QueuedMessage {
            id: id.clone(),
            sender: event.from,
            recipient: event.to,
            service: event.service,
            event: event.event,
            content: event.content,
            data: event.data,
            file: event.file,
            created: unix_now(),
        };
        self.deliver(msg).await?;
        Ok(id)
    }

    async fn deliver(&self, msg: QueuedMessage) -> Result<()> {
        let inner = &self.inner;
        let (location, follow_up) = locate(&inner.identities, &inner.directory, inner.registry.as_ref(), &msg.recipient)?;
        if let Some(follow_up) = follow_up {
            self.fire_follow_up(follow_up);
        }
        match location.method {
            Method::Local => {
                // loopback pipe; the frame still runs the whole protocol
                self.send_via_peer(inner.registry.local_peer_id(), &msg)
                    .await
                    .map(|_| ())
                    .context("loopback delivery")
            }
            Method::Libp2p => {
                let peer = PeerId::from_str(&location.location)
                    .map_err(|_| anyhow!("directory holds unparseable peer {}", location.location))?;
                match self.send_via_peer(peer, &msg).await {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        warn!(id = %msg.id, %peer, "message refused by peer, dropped");
                        Ok(())
                    }
                    Err(err) => {
                        debug!(id = %msg.id, %peer, %err, "transient send failure, queueing");
                        self.park(&location.queue_method, &location.queue_location, &msg)
                    }
                }
            }
            // nothing to dial yet; wait for discovery to fire a queue check
            Method::Peer | Method::Entity => self.park(&location.queue_method, &location.queue_location, &msg),
        }
    }

    fn park(&self, method: &Method, key: &str, msg: &QueuedMessage) -> Result<()> {
        match method {
            Method::Peer | Method::Libp2p => self.inner.queue.enqueue_peer(key, msg),
            Method::Entity | Method::Local => self.inner.queue.enqueue_entity(key, msg),
        }
    }

    /// Run the client half of the wire protocol against one peer.
    /// `Ok(true)` is an ack, `Ok(false)` a nack; `Err` is transient.
    async fn send_via_peer(&self, peer: PeerId, msg: &QueuedMessage) -> Result<bool> {
        let mut stream = match self.inner.registry.stream(peer).await? {
            OpenedStream::Remote(stream) => stream,
            OpenedStream::Loopback { client, server } => {
                tokio::spawn(self.clone().receive(server, peer));
                client
            }
        };
        let mut challenge = [0u8; CHALLENGE_LEN];
        timeout(IDLE_TIMEOUT, stream.read_exact(&mut challenge))
            .await
            .context("waiting for challenge")??;
        let frame = self.seal(msg, &challenge).await?;
        frame.write(&mut stream).await?;
        let receipt = timeout(IDLE_TIMEOUT, wire::read_item(&mut stream))
            .await
            .context("waiting for receipt")??;
        let receipt: Headers = crypto::cbor_decode(&receipt).context("decoding receipt")?;
        Ok(receipt.frame_type == TYPE_ACK && receipt.ack == msg.id)
    }

    /// Turn a queued message into a wire frame: fresh timestamp and nonce on
    /// every attempt, signed against the receiver's challenge.
    async fn seal(&self, msg: &QueuedMessage, challenge: &[u8]) -> Result<Frame> {
        let file = match &msg.file {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading attachment {}", path))?,
            ),
            None => None,
        };
        let mut headers = Headers {
            frame_type: TYPE_MSG.to_owned(),
            from: msg.sender.clone(),
            to: msg.recipient.clone(),
            service: msg.service.clone(),
            event: msg.event.clone(),
            id: msg.id.clone(),
            timestamp: unix_now(),
            nonce: nonce(),
            ..Default::default()
        };
        if !msg.sender.is_empty() {
            let identity = self
                .inner
                .identities
                .by_id(&msg.sender)?
                .ok_or_else(|| anyhow!("sender {} is not a local identity", msg.sender))?;
            headers.sign(&identity.keypair(), challenge, &msg.content, &msg.data);
        }
        Ok(Frame {
            headers,
            content: msg.content.clone(),
            data: msg.data.clone(),
            file,
        })
    }

    // ------------------------------------------------------------- receive

    /// Server half of the wire protocol; one task per inbound stream.
    pub async fn receive(self, mut stream: EventStream, peer: PeerId) {
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut challenge);
        if stream.write_all(&challenge).await.is_err() || stream.flush().await.is_err() {
            debug!(%peer, "stream closed before challenge");
            return;
        }
        loop {
            let frame = match timeout(IDLE_TIMEOUT, Frame::read(&mut stream)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => {
                    debug!(%peer, %err, "stream ended");
                    break;
                }
                Err(_) => {
                    debug!(%peer, "stream idle, closing");
                    self.inner.registry.disconnected(peer);
                    break;
                }
            };
            if frame.headers.frame_type == TYPE_BYE {
                self.inner.registry.disconnected(peer);
                break;
            }
            let id = frame.headers.id.clone();
            if let Err(tag) = self.admit(&frame, &challenge) {
                warn!(audit = tag, %peer, id = %id, "frame rejected");
                if frame.headers.is_msg() && self.reply(&mut stream, Headers::nack_for(&id)).await.is_err() {
                    break;
                }
                continue;
            }
            let nonce_value = frame.headers.nonce.clone();
            if !frame.headers.is_msg() {
                // lone ack/nack frames have nothing to dispatch
                self.record_nonce(&nonce_value);
                continue;
            }
            let (reply, panicked) = self.dispatch_frame(frame).await;
            self.record_nonce(&nonce_value);
            let headers = match reply {
                Reply::Ack => Headers::ack_for(&id),
                Reply::Nack(reason) => {
                    debug!(%peer, id = %id, %reason, "frame nacked");
                    Headers::nack_for(&id)
                }
            };
            if self.reply(&mut stream, headers).await.is_err() {
                break;
            }
            if panicked {
                // a broken handler forfeits the rest of the stream
                break;
            }
        }
    }

    async fn reply(&self, stream: &mut EventStream, headers: Headers) -> Result<()> {
        wire::write_item(stream, &crypto::cbor_encode(&headers)?).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Validation, signature and replay checks shared by streams and pubsub.
    fn admit(&self, frame: &Frame, challenge: &[u8]) -> Result<(), &'static str> {
        frame.headers.validate(unix_now())?;
        if frame.headers.frame_type == TYPE_BYE {
            return Ok(());
        }
        if !frame.headers.from.is_empty() && !frame.headers.verify(challenge, &frame.content, &frame.data) {
            return Err(audit::SIGNATURE_FAILED);
        }
        match self.inner.nonces.is_fresh(&frame.headers.nonce) {
            Ok(true) => Ok(()),
            Ok(false) => Err(audit::MESSAGE_REJECTED),
            Err(err) => {
                error!(%err, "nonce ledger unavailable");
                Err(audit::MESSAGE_REJECTED)
            }
        }
    }

    fn record_nonce(&self, nonce: &str) {
        if let Err(err) = self.inner.nonces.record(nonce, unix_now()) {
            error!(%err, "recording nonce failed");
        }
    }

    /// Resolve the recipient, find the handler and run it isolated from the
    /// stream task. The bool reports a handler panic.
    async fn dispatch_frame(&self, frame: Frame) -> (Reply, bool) {
        let user = if frame.headers.to.is_empty() {
            None
        } else {
            match self.inner.identities.by_address(&frame.headers.to) {
                Ok(Some(identity)) => Some(identity.user),
                Ok(None) => {
                    warn!(audit = audit::UNKNOWN_RECIPIENT, to = %frame.headers.to, "no such identity here");
                    return (Reply::Nack("unknown recipient".to_owned()), false);
                }
                Err(err) => {
                    error!(%err, "identity store unavailable");
                    return (Reply::Nack("internal error".to_owned()), false);
                }
            }
        };
        let handler = match self.inner.router.handler(&frame.headers.service, &frame.headers.event) {
            Some(handler) => handler,
            None => {
                warn!(
                    audit = audit::UNKNOWN_HANDLER,
                    service = %frame.headers.service,
                    event = %frame.headers.event,
                    "no handler registered"
                );
                return (Reply::Nack("no handler".to_owned()), false);
            }
        };
        let (event, slot) = Event::from_frame(frame, user);
        match tokio::spawn(handler(event)).await {
            Ok(Ok(())) => {
                let chosen = slot.lock().clone();
                (chosen.unwrap_or(Reply::Ack), false)
            }
            Ok(Err(err)) => {
                let chosen = slot.lock().clone();
                (chosen.unwrap_or(Reply::Nack(err.to_string())), false)
            }
            Err(err) => {
                error!(%err, "handler panicked");
                (Reply::Nack("handler failure".to_owned()), true)
            }
        }
    }

    // -------------------------------------------------------------- pubsub

    /// Publish a broadcast, deferring it to the queue while peers are
    /// insufficient or the mesh refuses it.
    pub async fn publish_event(&self, broadcast: QueuedBroadcast) -> Result<()> {
        if !self.inner.registry.sufficient() {
            return self.inner.queue.enqueue_broadcast(&broadcast);
        }
        match self.publish_now(&broadcast).await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(topic = %broadcast.topic, %err, "publish failed, deferring");
                self.inner.queue.enqueue_broadcast(&broadcast)
            }
        }
    }

    /// Sign (fresh timestamp and nonce, empty challenge) and hand the frame
    /// to gossipsub.
    pub(crate) async fn publish_now(&self, broadcast: &QueuedBroadcast) -> Result<()> {
        let mut headers = Headers {
            frame_type: TYPE_MSG.to_owned(),
            from: broadcast.sender.clone(),
            service: broadcast.service.clone(),
            event: broadcast.event.clone(),
            id: broadcast.id.clone(),
            timestamp: unix_now(),
            nonce: nonce(),
            ..Default::default()
        };
        if !broadcast.sender.is_empty() {
            let identity = self
                .inner
                .identities
                .by_id(&broadcast.sender)?
                .ok_or_else(|| anyhow!("sender {} is not a local identity", broadcast.sender))?;
            headers.sign(&identity.keypair(), b"", &broadcast.content, &broadcast.data);
        }
        let frame = Frame {
            headers,
            content: broadcast.content.clone(),
            data: broadcast.data.clone(),
            file: None,
        };
        self.inner.transport.publish(&broadcast.topic, frame.to_message()?).await
    }

    /// Inbound gossipsub message on one of our topics.
    pub async fn receive_gossip(&self, topic: String, source: Option<PeerId>, data: Vec<u8>) {
        if source == Some(self.inner.transport.local_peer_id()) {
            return;
        }
        let frame = match Frame::from_message(&data) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%topic, %err, "undecodable gossip message, skipping");
                return;
            }
        };
        if let Err(tag) = self.admit(&frame, b"") {
            warn!(audit = tag, %topic, "gossip message rejected");
            return;
        }
        let nonce_value = frame.headers.nonce.clone();
        match topic.as_str() {
            TOPIC_DIRECTORY => self.directory_gossip(frame).await,
            TOPIC_PEERS => self.peers_gossip(frame).await,
            _ => self.topic_gossip(&topic, frame).await,
        }
        self.record_nonce(&nonce_value);
    }

    async fn directory_gossip(&self, frame: Frame) {
        match frame.headers.event.as_str() {
            "publish" => {
                let entry: DirectoryEntry = match crypto::cbor_decode(&frame.content) {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!(%err, "undecodable directory entry");
                        return;
                    }
                };
                if !patterns::is_entity(&entry.id) {
                    warn!(audit = audit::INVALID_FROM, "directory entry with bad id");
                    return;
                }
                match self.inner.directory.apply_remote(&entry) {
                    Ok(true) => {
                        // knowing the hosting peer may unblock parked sends
                        if let Ok(peer) = PeerId::from_str(&entry.location) {
                            self.inner.registry.discovered(peer);
                        }
                        let engine = self.clone();
                        let entity = entry.id.clone();
                        tokio::spawn(async move {
                            if let Err(err) = engine.check_entity(&entity).await {
                                debug!(%err, "entity check after directory update failed");
                            }
                        });
                    }
                    Ok(false) => {}
                    Err(err) => error!(%err, "directory update failed"),
                }
            }
            "request" => {
                let id: String = match crypto::cbor_decode(&frame.content) {
                    Ok(id) => id,
                    Err(_) => return,
                };
                self.answer_directory_request(&id).await;
            }
            "download" => {
                // a fresh node asking for a seed snapshot
                self.answer_directory_download().await;
            }
            other => debug!(event = other, "unhandled directory event"),
        }
    }

    /// Respond to a lookup if the queried identity is one of our public ones.
    async fn answer_directory_request(&self, id: &str) {
        let identity = match self.inner.identities.by_address(id) {
            Ok(Some(identity)) if identity.privacy == Privacy::Public => identity,
            _ => return,
        };
        let entry = identity.directory_entry(self.inner.transport.local_peer_id().to_string());
        if let Err(err) = self.inner.directory.create(&entry) {
            error!(%err, "directory write failed");
            return;
        }
        if let Err(err) = self.publish_directory_entry(entry).await {
            debug!(%err, "directory response failed");
        }
    }

    async fn answer_directory_download(&self) {
        // `u64::MAX` makes every public identity due; the batch cap keeps the
        // response bounded
        let due = match self.inner.identities.republish_due(u64::MAX) {
            Ok(due) => due,
            Err(err) => {
                error!(%err, "identity scan failed");
                return;
            }
        };
        for identity in due.into_iter().take(DOWNLOAD_BATCH) {
            let entry = identity.directory_entry(self.inner.transport.local_peer_id().to_string());
            if let Err(err) = self.publish_directory_entry(entry).await {
                debug!(%err, "seed publish failed");
                break;
            }
        }
    }

    async fn peers_gossip(&self, frame: Frame) {
        match frame.headers.event.as_str() {
            "request" => {
                let wanted: String = match crypto::cbor_decode(&frame.content) {
                    Ok(id) => id,
                    Err(_) => return,
                };
                if wanted == self.inner.transport.local_peer_id().to_string() {
                    if let Err(err) = self.announce_self().await {
                        debug!(%err, "self announcement failed");
                    }
                }
            }
            "publish" => {
                let announcement: PeerAnnouncement = match crypto::cbor_decode(&frame.content) {
                    Ok(a) => a,
                    Err(_) => return,
                };
                let peer = match PeerId::from_str(&announcement.id) {
                    Ok(peer) => peer,
                    Err(_) => return,
                };
                for address in announcement.addresses {
                    if let Ok(address) = address.parse() {
                        self.inner.registry.discovered_address(peer, address);
                    }
                }
            }
            other => debug!(event = other, "unhandled peers event"),
        }
    }

    /// App traffic: the messages topic and any topic an app subscribed to.
    async fn topic_gossip(&self, topic: &str, frame: Frame) {
        let user = if frame.headers.to.is_empty() {
            None
        } else {
            match self.inner.identities.by_address(&frame.headers.to) {
                Ok(Some(identity)) => Some(identity.user),
                // addressed to somebody else; not ours to handle
                _ => return,
            }
        };
        let handler = self
            .inner
            .router
            .subscriber(topic)
            .or_else(|| self.inner.router.handler(&frame.headers.service, &frame.headers.event));
        let handler = match handler {
            Some(handler) => handler,
            None => {
                debug!(audit = audit::UNKNOWN_HANDLER, topic, "no subscriber");
                return;
            }
        };
        let (event, _slot) = Event::from_frame(frame, user);
        if let Err(err) = tokio::spawn(handler(event)).await.unwrap_or_else(|e| Err(anyhow!(e))) {
            warn!(topic, %err, "pubsub handler failed");
        }
    }

    // ------------------------------------------------------ lookups, queue

    fn fire_follow_up(&self, follow_up: FollowUp) {
        let engine = self.clone();
        tokio::spawn(async move {
            let result = match follow_up {
                FollowUp::RequestPeer(peer) => engine.publish_peer_request(&peer).await,
                FollowUp::RequestDirectory(id) => engine.publish_directory_request(&id).await,
            };
            if let Err(err) = result {
                debug!(%err, "lookup request failed");
            }
        });
    }

    pub async fn publish_directory_entry(&self, entry: DirectoryEntry) -> Result<()> {
        let sender = if self.inner.identities.by_id(&entry.id)?.is_some() {
            entry.id.clone()
        } else {
            String::new()
        };
        self.publish_event(QueuedBroadcast {
            id: message_id(),
            topic: TOPIC_DIRECTORY.to_owned(),
            sender,
            service: "directory".to_owned(),
            event: "publish".to_owned(),
            content: crypto::cbor_encode(&entry)?,
            data: Vec::new(),
            created: unix_now(),
        })
        .await
    }

    pub async fn publish_directory_request(&self, id: &str) -> Result<()> {
        self.publish_event(QueuedBroadcast {
            id: message_id(),
            topic: TOPIC_DIRECTORY.to_owned(),
            sender: String::new(),
            service: "directory".to_owned(),
            event: "request".to_owned(),
            content: crypto::cbor_encode(&id.to_owned())?,
            data: Vec::new(),
            created: unix_now(),
        })
        .await
    }

    pub async fn publish_directory_download(&self) -> Result<()> {
        self.publish_event(QueuedBroadcast {
            id: message_id(),
            topic: TOPIC_DIRECTORY.to_owned(),
            sender: String::new(),
            service: "directory".to_owned(),
            event: "download".to_owned(),
            content: Vec::new(),
            data: Vec::new(),
            created: unix_now(),
        })
        .await
    }

    pub async fn publish_peer_request(&self, peer: &str) -> Result<()> {
        self.publish_event(QueuedBroadcast {
            id: message_id(),
            topic: TOPIC_PEERS.to_owned(),
            sender: String::new(),
            service: "peers".to_owned(),
            event: "request".to_owned(),
            content: crypto::cbor_encode(&peer.to_owned())?,
            data: Vec::new(),
            created: unix_now(),
        })
        .await
    }

    async fn announce_self(&self) -> Result<()> {
        let announcement = PeerAnnouncement {
            id: self.inner.transport.local_peer_id().to_string(),
            addresses: self
                .inner
                .transport
                .listeners()
                .await
                .into_iter()
                .map(|a| a.to_string())
                .collect(),
        };
        self.publish_event(QueuedBroadcast {
            id: message_id(),
            topic: TOPIC_PEERS.to_owned(),
            sender: String::new(),
            service: "peers".to_owned(),
            event: "publish".to_owned(),
            content: crypto::cbor_encode(&announcement)?,
            data: Vec::new(),
            created: unix_now(),
        })
        .await
    }

    /// Retry everything parked for an entity whose location may have become
    /// known.
    pub async fn check_entity(&self, entity: &str) -> Result<()> {
        let inner = &self.inner;
        for msg in inner.queue.entity_rows(entity)? {
            let (location, follow_up) =
                locate(&inner.identities, &inner.directory, inner.registry.as_ref(), &msg.recipient)?;
            if let Some(follow_up) = follow_up {
                self.fire_follow_up(follow_up);
            }
            let peer = match location.method {
                Method::Local => inner.registry.local_peer_id(),
                Method::Libp2p => match PeerId::from_str(&location.location) {
                    Ok(peer) => peer,
                    Err(_) => continue,
                },
                Method::Peer | Method::Entity => continue,
            };
            match self.send_via_peer(peer, &msg).await {
                // a nack is permanent, retrying cannot help
                Ok(_) => inner.queue.delete_entity(entity, &msg.id)?,
                Err(err) => debug!(entity, id = %msg.id, %err, "still undeliverable"),
            }
        }
        Ok(())
    }

    /// Retry everything parked for a peer that was just seen.
    pub async fn check_peer(&self, peer: &str) -> Result<()> {
        let rows = self.inner.queue.peer_rows(peer)?;
        if rows.is_empty() {
            return Ok(());
        }
        let peer_id = PeerId::from_str(peer).map_err(|_| anyhow!("bad peer id {}", peer))?;
        for msg in rows {
            match self.send_via_peer(peer_id, &msg).await {
                Ok(_) => self.inner.queue.delete_peer(peer, &msg.id)?,
                Err(err) => {
                    debug!(peer, id = %msg.id, %err, "peer still unreachable");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Push out deferred broadcasts once peers are sufficient.
    pub async fn drain_broadcasts(&self) -> Result<()> {
        if !self.inner.registry.sufficient() {
            return Ok(());
        }
        for broadcast in self.inner.queue.broadcast_rows()? {
            match self.publish_now(&broadcast).await {
                Ok(()) => self.inner.queue.delete_broadcast(&broadcast.id)?,
                Err(err) => {
                    debug!(topic = %broadcast.topic, %err, "broadcast still blocked");
                    break;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ shutdown

    /// Best-effort `bye` to every connected peer.
    pub async fn shutdown(&self) {
        for peer in self.inner.registry.connected_peers() {
            let engine = self.clone();
            let result = timeout(BYE_TIMEOUT, async move {
                let mut stream = match engine.inner.registry.stream(peer).await? {
                    OpenedStream::Remote(stream) => stream,
                    OpenedStream::Loopback { .. } => return Ok(()),
                };
                let mut challenge = [0u8; CHALLENGE_LEN];
                stream.read_exact(&mut challenge).await?;
                let frame = Frame {
                    headers: Headers::bye(),
                    ..Default::default()
                };
                frame.write(&mut stream).await?;
                stream.close().await?;
                anyhow::Ok(())
            })
            .await;
            match result {
                Ok(Ok(())) => debug!(%peer, "bye sent"),
                Ok(Err(err)) => debug!(%peer, %err, "bye failed"),
                Err(_) => debug!(%peer, "bye timed out"),
            }
        }
    }
}
