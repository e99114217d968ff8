use crate::transport::{EventStream, Transport};
use anyhow::{anyhow, Result};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::*;
use util::{
    db::{self, DbPath},
    unix_now,
};

/// Address sets are capped so a hostile peer cannot balloon the registry.
pub const MAX_ADDRESSES: usize = 20;

/// An in-memory peer record is flushed to the store at most this often.
const PERSIST_AFTER: u64 = 3600;

/// Persistent peer rows older than this are pruned.
pub const PEER_RETENTION: u64 = 30 * 86_400;

/// Buffer size of the self-send loopback pipe.
const LOOPBACK_BUFFER: usize = 1 << 18;

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub addresses: Vec<Multiaddr>,
    pub updated: u64,
    /// Ephemeral; never persisted.
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// New peer or new address; the queue uses this to retry parked sends.
    Discovered(PeerId),
    Connected(PeerId),
    Disconnected(PeerId),
}

/// A stream obtained for sending, either to a remote peer or looped back to
/// ourselves. For loopback the caller must spawn the usual inbound handler
/// on the server half.
pub enum OpenedStream {
    Remote(EventStream),
    Loopback { client: EventStream, server: EventStream },
}

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS peers (\
        id TEXT NOT NULL,\
        address TEXT NOT NULL,\
        updated INTEGER NOT NULL,\
        PRIMARY KEY (id, address)\
    );";

pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, Peer>>,
    conn: Arc<Mutex<Connection>>,
    events: UnboundedSender<PeerEvent>,
    transport: Transport,
    minimum: usize,
}

impl PeerRegistry {
    pub fn open(
        path: DbPath,
        transport: Transport,
        minimum: usize,
        events: UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let conn = db::open(path)?;
        db::ensure_schema(&conn, 1, SCHEMA)?;
        let registry = Self {
            peers: Mutex::new(HashMap::new()),
            conn: Arc::new(Mutex::new(conn)),
            events,
            transport,
            minimum,
        };
        let loaded = registry.load_all()?;
        if loaded > 0 {
            info!(peers = loaded, "peer registry loaded");
        }
        Ok(registry)
    }

    fn load_all(&self) -> Result<usize> {
        let mut restored: HashMap<PeerId, Peer> = HashMap::new();
        {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT id, address, updated FROM peers")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                ))
            })?;
            for row in rows {
                let (id, address, updated) = row?;
                let id = match PeerId::from_str(&id) {
                    Ok(id) => id,
                    Err(_) => {
                        warn!(%id, "dropping unparseable peer row");
                        continue;
                    }
                };
                let address: Multiaddr = match address.parse() {
                    Ok(a) => a,
                    Err(_) => continue,
                };
                let peer = restored.entry(id).or_insert_with(|| Peer {
                    id,
                    addresses: Vec::new(),
                    updated,
                    connected: false,
                });
                peer.updated = peer.updated.max(updated);
                if !peer.addresses.contains(&address) && peer.addresses.len() < MAX_ADDRESSES {
                    peer.addresses.push(address);
                }
            }
        }
        let count = restored.len();
        self.peers.lock().extend(restored);
        Ok(count)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    /// Seed a peer without connecting to it.
    pub fn add_known(&self, id: PeerId, addresses: Vec<Multiaddr>) {
        let mut peers = self.peers.lock();
        let peer = peers.entry(id).or_insert_with(|| Peer {
            id,
            addresses: Vec::new(),
            updated: unix_now(),
            connected: false,
        });
        for address in addresses {
            if !peer.addresses.contains(&address) && peer.addresses.len() < MAX_ADDRESSES {
                peer.addresses.push(address);
            }
        }
    }

    /// Look a peer up, falling back to the persistent store on a miss.
    pub fn by_id(&self, id: &PeerId) -> Option<Peer> {
        if let Some(peer) = self.peers.lock().get(id).cloned() {
            return Some(peer);
        }
        let rows: Vec<(String, u64)> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached("SELECT address, updated FROM peers WHERE id = ?")
                .ok()?;
            let rows = stmt
                .query_map(params![id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })
                .ok()?;
            rows.filter_map(|r| r.ok()).collect()
        };
        if rows.is_empty() {
            return None;
        }
        let mut peer = Peer {
            id: *id,
            addresses: Vec::new(),
            updated: 0,
            connected: false,
        };
        for (address, updated) in rows {
            peer.updated = peer.updated.max(updated);
            if let Ok(address) = address.parse() {
                if !peer.addresses.contains(&address) && peer.addresses.len() < MAX_ADDRESSES {
                    peer.addresses.push(address);
                }
            }
        }
        self.peers.lock().entry(*id).or_insert_with(|| peer.clone());
        Some(peer)
    }

    /// A peer surfaced without any address (e.g. named on a pubsub topic).
    pub fn discovered(&self, id: PeerId) {
        self.merge(id, None, unix_now());
    }

    /// Idempotent merge of a discovered address.
    pub fn discovered_address(&self, id: PeerId, address: Multiaddr) {
        self.merge(id, Some(address), unix_now());
    }

    fn merge(&self, id: PeerId, address: Option<Multiaddr>, now: u64) {
        let persist = {
            let mut peers = self.peers.lock();
            let peer = peers.entry(id).or_insert_with(|| Peer {
                id,
                addresses: Vec::new(),
                // forces the initial persist below
                updated: 0,
                connected: false,
            });
            if let Some(address) = address {
                if !peer.addresses.contains(&address) && peer.addresses.len() < MAX_ADDRESSES {
                    peer.addresses.push(address);
                }
            }
            if now.saturating_sub(peer.updated) > PERSIST_AFTER || peer.updated == 0 {
                peer.updated = now;
                Some(peer.addresses.clone())
            } else {
                None
            }
        };
        // store writes happen outside the peers lock
        if let Some(addresses) = persist {
            if let Err(err) = self.persist(&id, &addresses, now) {
                warn!(%id, %err, "persisting peer failed");
            }
        }
        self.events.send(PeerEvent::Discovered(id)).ok();
    }

    fn persist(&self, id: &PeerId, addresses: &[Multiaddr], now: u64) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("INSERT OR REPLACE INTO peers (id, address, updated) VALUES (?, ?, ?)")?;
        for address in addresses {
            stmt.execute(params![id.to_string(), address.to_string(), now])?;
        }
        Ok(())
    }

    /// True when the peer is connected, or a connection attempt succeeds.
    pub async fn connect(&self, id: PeerId) -> bool {
        let addresses = {
            let peers = self.peers.lock();
            match peers.get(&id) {
                Some(peer) if peer.connected => return true,
                Some(peer) => peer.addresses.clone(),
                None => Vec::new(),
            }
        };
        let connected = self.transport.dial(id, addresses).await;
        if connected {
            self.mark_connected(id);
        }
        connected
    }

    pub fn mark_connected(&self, id: PeerId) {
        let mut peers = self.peers.lock();
        let peer = peers.entry(id).or_insert_with(|| Peer {
            id,
            addresses: Vec::new(),
            updated: unix_now(),
            connected: false,
        });
        if !peer.connected {
            peer.connected = true;
            drop(peers);
            self.events.send(PeerEvent::Connected(id)).ok();
        }
    }

    pub fn disconnected(&self, id: PeerId) {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(&id) {
            if peer.connected {
                peer.connected = false;
                drop(peers);
                self.events.send(PeerEvent::Disconnected(id)).ok();
            }
        }
    }

    /// Gate for broadcasts: are enough peers connected?
    pub fn sufficient(&self) -> bool {
        self.peers.lock().values().filter(|p| p.connected).count() >= self.minimum
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.connected)
            .map(|p| p.id)
            .collect()
    }

    /// Obtain a bidirectional event stream to the peer, connecting if
    /// needed. Sending to ourselves short-circuits into an in-memory pipe.
    pub async fn stream(&self, id: PeerId) -> Result<OpenedStream> {
        if id == self.transport.local_peer_id() {
            let (client, server) = tokio::io::duplex(LOOPBACK_BUFFER);
            return Ok(OpenedStream::Loopback {
                client: Box::new(client.compat()),
                server: Box::new(server.compat()),
            });
        }
        if !self.connect(id).await {
            return Err(anyhow!("peer {} is unreachable", id));
        }
        let stream = self.transport.open_stream(id).await?;
        Ok(OpenedStream::Remote(Box::new(stream)))
    }

    /// Drop persistent rows that have not been refreshed in 30 days.
    pub fn prune(&self, now: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(PEER_RETENTION);
        let removed = self
            .conn
            .lock()
            .prepare_cached("DELETE FROM peers WHERE updated < ?")?
            .execute(params![cutoff])?;
        if removed > 0 {
            debug!(removed, "stale peer rows pruned");
        }
        Ok(removed)
    }
}

impl identity::PeerView for PeerRegistry {
    fn has_address(&self, peer: &str) -> bool {
        let id = match PeerId::from_str(peer) {
            Ok(id) => id,
            Err(_) => return false,
        };
        self.by_id(&id).map(|p| !p.addresses.is_empty()).unwrap_or(false)
    }
}
