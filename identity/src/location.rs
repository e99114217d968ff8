use crate::{Directory, IdentityStore};
use anyhow::Result;

/// How an event can reach a recipient right now, and where it should wait if
/// the attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// The recipient is owned by this node.
    Local,
    /// A stream can be opened to the hosting peer immediately.
    Libp2p,
    /// The hosting peer is known but no address is, yet.
    Peer,
    /// Nothing is known beyond the entity id.
    Entity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub method: Method,
    pub location: String,
    pub queue_method: Method,
    pub queue_location: String,
}

/// The slice of the peer registry that location resolution needs. Implemented
/// by `swarm::PeerRegistry`; kept as a trait so this crate stays below the
/// transport.
pub trait PeerView {
    /// Do we hold at least one dialable address for the peer?
    fn has_address(&self, peer: &str) -> bool;
}

/// Asynchronous work a resolution asks its caller to fire. Kept out of the
/// resolver so no network request ever happens under a store lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// Gossip a request for the peer's addresses.
    RequestPeer(String),
    /// Gossip a directory lookup for the identity.
    RequestDirectory(String),
}

/// Resolve where `id` lives. The quadruple tells the caller how to send now
/// (`method`/`location`) and which queue to park the message in if the send
/// fails (`queue_method`/`queue_location`).
pub fn locate(
    identities: &IdentityStore,
    directory: &Directory,
    peers: &dyn PeerView,
    id: &str,
) -> Result<(Location, Option<FollowUp>)> {
    if identities.by_address(id)?.is_some() {
        return Ok((
            Location {
                method: Method::Local,
                location: id.to_owned(),
                queue_method: Method::Local,
                queue_location: id.to_owned(),
            },
            None,
        ));
    }
    if let Some(entry) = directory.by_id(id)? {
        let peer = entry.location;
        if peers.has_address(&peer) {
            return Ok((
                Location {
                    method: Method::Libp2p,
                    location: peer.clone(),
                    queue_method: Method::Peer,
                    queue_location: peer,
                },
                None,
            ));
        }
        // known peer, unknown address: queue on the peer and go looking for it
        return Ok((
            Location {
                method: Method::Peer,
                location: peer.clone(),
                queue_method: Method::Peer,
                queue_location: peer.clone(),
            },
            Some(FollowUp::RequestPeer(peer)),
        ));
    }
    Ok((
        Location {
            method: Method::Entity,
            location: id.to_owned(),
            queue_method: Method::Entity,
            queue_location: id.to_owned(),
        },
        Some(FollowUp::RequestDirectory(id.to_owned())),
    ))
}
