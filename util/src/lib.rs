pub mod db;
pub mod formats;
pub mod patterns;

use anyhow::{bail, Result};
use libp2p::multiaddr::{Multiaddr, Protocol};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    num::NonZeroU16,
};
use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber (stderr, `RUST_LOG`-controlled) and route
/// panics through it. Later calls are no-ops.
pub fn setup_logger() {
    tracing_log::LogTracer::init().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

/// Wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_secs()
}

/// The socket addresses a node binds its transport to.
///
/// The configuration names listeners as a host/IP plus port or as a TCP
/// multiaddr, while the swarm wants multiaddrs; this is the bridge between
/// the two notations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindAddrs {
    addrs: Vec<SocketAddr>,
}

impl BindAddrs {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolve a host name or IP, attaching `port` where the input names
    /// none.
    pub fn from_host(host: &str, port: NonZeroU16) -> Result<Self> {
        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let addrs: Vec<_> = (host, port.get()).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            bail!("{} does not resolve to any address", host);
        }
        Ok(Self { addrs })
    }

    /// Accept a plain TCP listener multiaddr, `/ip4/<ip>/tcp/<port>` or its
    /// ip6 twin. Host names belong in [`BindAddrs::from_host`].
    pub fn parse_multiaddr(text: &str) -> Result<Self> {
        let addr: Multiaddr = text.parse()?;
        let mut parts = addr.iter();
        let ip = match parts.next() {
            Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
            Some(Protocol::Ip6(ip)) => IpAddr::V6(ip),
            other => bail!("unsupported listen protocol {:?}", other),
        };
        let port = match parts.next() {
            Some(Protocol::Tcp(port)) => port,
            other => bail!("only tcp listeners are supported, got {:?}", other),
        };
        if parts.next().is_some() {
            bail!("unexpected trailing protocols in {}", text);
        }
        Ok(SocketAddr::from((ip, port)).into())
    }

    /// The wildcard address at `port`, on both IP families.
    pub fn unspecified(port: u16) -> Self {
        Self {
            addrs: vec![
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            ],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addrs.iter().copied()
    }

    pub fn to_multiaddrs(&self) -> impl Iterator<Item = Multiaddr> + '_ {
        self.iter().map(|addr| {
            let ip = match addr.ip() {
                IpAddr::V4(ip) => Protocol::Ip4(ip),
                IpAddr::V6(ip) => Protocol::Ip6(ip),
            };
            Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
        })
    }
}

impl From<SocketAddr> for BindAddrs {
    fn from(addr: SocketAddr) -> Self {
        Self { addrs: vec![addr] }
    }
}
