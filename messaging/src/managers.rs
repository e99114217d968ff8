//! Long-lived background workers. Every loop logs failures and keeps going;
//! none of them can take the node down.

use crate::engine::Engine;
use futures::StreamExt;
use identity::DirectoryCommand;
use std::time::Duration;
use swarm::{IncomingStreams, PeerEvent, TransportEvent};
use tokio::{
    sync::mpsc::{Receiver, UnboundedReceiver},
    task::JoinHandle,
    time::sleep,
};
use tracing::*;
use util::unix_now;

pub const QUEUE_INTERVAL: Duration = Duration::from_secs(60);
pub const NONCE_GC_INTERVAL: Duration = Duration::from_secs(60);
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(60);
pub const PEER_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Spawn the full worker set. The handles are detached on drop; aborting
/// them is only needed on shutdown. `directory_ttl` is the retention for
/// cached remote identities, in seconds.
pub fn spawn_all(
    engine: Engine,
    transport_events: Receiver<TransportEvent>,
    peer_events: UnboundedReceiver<PeerEvent>,
    directory_commands: UnboundedReceiver<DirectoryCommand>,
    incoming: IncomingStreams,
    directory_ttl: u64,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(accept_loop(engine.clone(), incoming)),
        tokio::spawn(transport_pump(engine.clone(), transport_events)),
        tokio::spawn(peer_event_pump(engine.clone(), peer_events)),
        tokio::spawn(directory_pump(engine.clone(), directory_commands)),
        tokio::spawn(queue_manager(engine.clone())),
        tokio::spawn(nonce_gc(engine.clone())),
        tokio::spawn(republish_manager(engine.clone())),
        tokio::spawn(directory_cleanup(engine.clone(), directory_ttl)),
        tokio::spawn(peer_cleanup(engine)),
    ]
}

/// One handler task per accepted `/mochi/events/1` stream.
pub async fn accept_loop(engine: Engine, mut incoming: IncomingStreams) {
    while let Some((peer, stream)) = incoming.next().await {
        debug!(%peer, "inbound stream");
        tokio::spawn(engine.clone().receive(Box::new(stream), peer));
    }
    debug!("accept loop stopped");
}

/// Feed transport events into the registry and the gossip paths.
pub async fn transport_pump(engine: Engine, mut events: Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Gossip { topic, source, data } => {
                engine.receive_gossip(topic, source, data).await;
            }
            TransportEvent::PeerConnected(peer) => engine.registry().mark_connected(peer),
            TransportEvent::PeerDisconnected(peer) => engine.registry().disconnected(peer),
            TransportEvent::PeerDiscovered { peer, address } => {
                engine.registry().discovered_address(peer, address);
            }
        }
    }
    debug!("transport pump stopped");
}

/// Every discovery is a chance to drain that peer's parked sends.
pub async fn peer_event_pump(engine: Engine, mut events: UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Discovered(peer) | PeerEvent::Connected(peer) => {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(err) = engine.check_peer(&peer.to_string()).await {
                        debug!(%peer, %err, "peer queue check failed");
                    }
                });
            }
            PeerEvent::Disconnected(_) => {}
        }
    }
    debug!("peer event pump stopped");
}

/// Publish directory announcements and lookups requested by the stores.
pub async fn directory_pump(engine: Engine, mut commands: UnboundedReceiver<DirectoryCommand>) {
    while let Some(command) = commands.recv().await {
        let result = match command {
            DirectoryCommand::Publish(entry) => engine.publish_directory_entry(entry).await,
            DirectoryCommand::Request(id) => engine.publish_directory_request(&id).await,
        };
        if let Err(err) = result {
            warn!(%err, "directory publish failed");
        }
    }
    debug!("directory pump stopped");
}

/// Minute tick: nudge one random entity and one random peer target, drain
/// deferred broadcasts, then expire old queue rows and persistent nonces.
pub async fn queue_manager(engine: Engine) {
    loop {
        sleep(QUEUE_INTERVAL).await;
        if engine.registry().sufficient() {
            match engine.queue().random_entity() {
                Ok(Some(entity)) => {
                    if let Err(err) = engine.check_entity(&entity).await {
                        debug!(%entity, %err, "entity queue check failed");
                    }
                }
                Ok(None) => {}
                Err(err) => error!(%err, "queue unavailable"),
            }
            match engine.queue().random_peer() {
                Ok(Some(peer)) => {
                    if let Err(err) = engine.check_peer(&peer).await {
                        debug!(%peer, %err, "peer queue check failed");
                    }
                }
                Ok(None) => {}
                Err(err) => error!(%err, "queue unavailable"),
            }
            if let Err(err) = engine.drain_broadcasts().await {
                debug!(%err, "broadcast drain failed");
            }
        }
        let now = unix_now();
        if let Err(err) = engine.queue().prune(now) {
            error!(%err, "queue prune failed");
        }
        if let Err(err) = engine.queue().nonce_prune(now) {
            error!(%err, "nonce prune failed");
        }
    }
}

pub async fn nonce_gc(engine: Engine) {
    loop {
        sleep(NONCE_GC_INTERVAL).await;
        engine.nonces().gc();
    }
}

/// Minute poll for public identities that have not been announced for 30
/// days.
pub async fn republish_manager(engine: Engine) {
    let location = engine.transport().local_peer_id().to_string();
    loop {
        sleep(REPUBLISH_INTERVAL).await;
        match engine
            .identities()
            .republish_scan(engine.directory(), &location, unix_now())
        {
            Ok(0) => {}
            Ok(count) => info!(count, "identities republished"),
            Err(err) => error!(%err, "republish scan failed"),
        }
    }
}

pub async fn peer_cleanup(engine: Engine) {
    loop {
        sleep(PEER_CLEANUP_INTERVAL).await;
        if let Err(err) = engine.registry().prune(unix_now()) {
            error!(%err, "peer prune failed");
        }
    }
}

/// Expire cached remote identities that were not refreshed within the TTL.
pub async fn directory_cleanup(engine: Engine, ttl: u64) {
    loop {
        sleep(PEER_CLEANUP_INTERVAL).await;
        if let Err(err) = engine.directory().cleanup(ttl, unix_now()) {
            error!(%err, "directory cleanup failed");
        }
    }
}

/// First-install seed: a node with an empty directory asks the network for a
/// snapshot. Deferred through the broadcast queue until a peer is there.
pub async fn directory_download(engine: Engine) {
    let empty = match engine.directory().search("") {
        Ok(entries) => entries.is_empty(),
        Err(err) => {
            error!(%err, "directory unavailable");
            return;
        }
    };
    if empty {
        if let Err(err) = engine.publish_directory_download().await {
            warn!(%err, "seed download request failed");
        }
    }
}
