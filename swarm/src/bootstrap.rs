use crate::peers::PeerRegistry;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use rand::seq::SliceRandom;
use tracing::*;

/// Compile-time seed peers as (peer id, multiaddr) pairs. Deployment-specific
/// seeds come in through `p2p.bootstrap` in the configuration and are merged
/// with this list.
pub const BOOTSTRAP: &[(&str, &str)] = &[];

/// Parse a configured bootstrap entry: a multiaddr ending in `/p2p/<peer>`.
fn parse_entry(entry: &str) -> Option<(PeerId, Multiaddr)> {
    let mut addr: Multiaddr = entry.parse().ok()?;
    match addr.pop() {
        Some(Protocol::P2p(peer)) => Some((peer, addr)),
        _ => None,
    }
}

/// Seed the registry with the compile-time list plus the configured entries,
/// in random order so every node does not hammer the same seed first.
pub fn seed_known_peers(registry: &PeerRegistry, configured: &[String]) -> usize {
    let mut entries: Vec<(PeerId, Multiaddr)> = Vec::new();
    for (id, addr) in BOOTSTRAP {
        match (id.parse(), addr.parse()) {
            (Ok(id), Ok(addr)) => entries.push((id, addr)),
            _ => warn!(id = %id, addr = %addr, "skipping malformed built-in bootstrap entry"),
        }
    }
    for entry in configured {
        match parse_entry(entry) {
            Some(parsed) => entries.push(parsed),
            None => warn!(entry = %entry, "skipping malformed bootstrap entry, expected …/p2p/<peer>"),
        }
    }
    entries.shuffle(&mut rand::thread_rng());
    for (id, addr) in &entries {
        registry.add_known(*id, vec![addr.clone()]);
    }
    entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_p2p_suffixed_multiaddr() {
        let peer: PeerId = crypto::KeyPair::generate().into();
        let entry = format!("/ip4/10.0.0.1/tcp/1443/p2p/{}", peer);
        let (id, addr) = parse_entry(&entry).unwrap();
        assert_eq!(id, peer);
        assert_eq!(addr, "/ip4/10.0.0.1/tcp/1443".parse::<Multiaddr>().unwrap());
    }

    #[test]
    fn rejects_entry_without_peer() {
        assert!(parse_entry("/ip4/10.0.0.1/tcp/1443").is_none());
        assert!(parse_entry("not a multiaddr").is_none());
    }
}
