//! The transport layer: a libp2p host plus the peer registry built on it.
//!
//! The swarm object lives on its own task; everything else talks to it
//! through [`Transport`] (command channel + stream control) and consumes
//! [`TransportEvent`]s from the event channel. Inbound `/mochi/events/1`
//! streams arrive on a separate accept stream so that per-stream handler
//! tasks never block the swarm loop.

mod bootstrap;
mod peers;
mod transport;

pub use bootstrap::{seed_known_peers, BOOTSTRAP};
pub use peers::{OpenedStream, Peer, PeerEvent, PeerRegistry, MAX_ADDRESSES, PEER_RETENTION};
pub use transport::{
    host_keypair, start, DuplexStream, EventStream, IncomingStream, IncomingStreams, Transport,
    TransportConfig, TransportEvent, EVENTS_PROTOCOL,
};

/// Minimum number of connected peers before broadcasts are let through,
/// unless overridden in the configuration.
pub const PEERS_MINIMUM: usize = 1;
