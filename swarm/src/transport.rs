use anyhow::{anyhow, Context, Result};
use crypto::{KeyPair, PrivateKey};
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, TopicHash},
    identify, mdns, noise, ping,
    swarm::{behaviour::toggle::Toggle, dial_opts::DialOpts, DialError, NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol,
};
use std::{collections::HashMap, path::Path, str::FromStr, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::*;
use util::BindAddrs;

/// Protocol tag for peer-to-peer event streams.
pub const EVENTS_PROTOCOL: StreamProtocol = StreamProtocol::new("/mochi/events/1");

pub use libp2p_stream::IncomingStreams;

/// Largest gossipsub payload we are willing to move.
const MAX_BROADCAST_BYTES: usize = 1_000_000;

/// Anything the protocol engine can read and write frames on. Remote streams
/// and the self-send loopback pipe both end up behind this.
pub trait DuplexStream: futures::AsyncRead + futures::AsyncWrite + Unpin + Send {}
impl<T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type EventStream = Box<dyn DuplexStream>;

/// An accepted inbound stream with the peer that opened it.
pub type IncomingStream = (PeerId, libp2p::Stream);

#[derive(Debug)]
pub enum TransportEvent {
    /// A gossipsub message from another peer on one of our topics.
    Gossip {
        topic: String,
        source: Option<PeerId>,
        data: Vec<u8>,
    },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// mDNS or identify told us where a peer lives.
    PeerDiscovered { peer: PeerId, address: Multiaddr },
}

#[derive(Debug)]
enum Command {
    Dial {
        peer: PeerId,
        addresses: Vec<Multiaddr>,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Listeners {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// Handle for talking to the swarm task. Cheap to clone; all methods are
/// safe to call from any task.
#[derive(Clone)]
pub struct Transport {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
}

impl Transport {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dial a peer at the given addresses; true once a connection exists.
    pub async fn dial(&self, peer: PeerId, addresses: Vec<Multiaddr>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Dial { peer, addresses, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Publish raw bytes on a gossipsub topic.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                topic: topic.to_owned(),
                data,
                reply,
            })
            .await
            .map_err(|_| anyhow!("swarm task is gone"))?;
        rx.await.map_err(|_| anyhow!("swarm task is gone"))?
    }

    /// Open a fresh `/mochi/events/1` stream to a connected peer.
    pub async fn open_stream(&self, peer: PeerId) -> Result<libp2p::Stream> {
        let mut control = self.control.clone();
        control
            .open_stream(peer, EVENTS_PROTOCOL)
            .await
            .map_err(|e| anyhow!("open stream to {}: {}", peer, e))
    }

    pub async fn listeners(&self) -> Vec<Multiaddr> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Listeners { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
    ping: ping::Behaviour,
    identify: identify::Behaviour,
    stream: libp2p_stream::Behaviour,
}

pub struct TransportConfig {
    pub keypair: KeyPair,
    pub listen: BindAddrs,
    pub topics: Vec<String>,
    /// Local-network discovery; off only in tests and locked-down deployments.
    pub enable_mdns: bool,
    pub idle_timeout: Duration,
}

/// Load the host identity key, generating one on first start.
pub fn host_keypair(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let private = PrivateKey::from_str(text.trim())
            .with_context(|| format!("{} does not hold a usable private key", path.display()))?;
        Ok(private.into())
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pair = KeyPair::generate();
        std::fs::write(path, format!("{}\n", pair.private_key()))
            .with_context(|| format!("writing {}", path.display()))?;
        info!(peer = %PeerId::from(pair), "generated host identity");
        Ok(pair)
    }
}

/// Start the libp2p host: bind listeners, join topics, register the events
/// protocol, and spawn the swarm loop. Returns the command handle, the
/// transport event channel and the inbound stream acceptor.
pub async fn start(
    config: TransportConfig,
) -> Result<(
    Transport,
    mpsc::Receiver<TransportEvent>,
    libp2p_stream::IncomingStreams,
)> {
    let keypair: libp2p::identity::Keypair = config.keypair.into();
    let local_peer_id = keypair.public().to_peer_id();

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|key| {
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .validation_mode(gossipsub::ValidationMode::Strict)
                .max_transmit_size(MAX_BROADCAST_BYTES)
                .build()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            let mdns = if config.enable_mdns {
                Some(mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?)
            } else {
                None
            };
            Ok(Behaviour {
                gossipsub: gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?,
                mdns: mdns.into(),
                ping: ping::Behaviour::new(ping::Config::new()),
                identify: identify::Behaviour::new(identify::Config::new(
                    "/mochi/1.0.0".to_owned(),
                    key.public(),
                )),
                stream: libp2p_stream::Behaviour::new(),
            })
        })
        .map_err(|e| anyhow!("building behaviour: {}", e))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_timeout))
        .build();

    let mut topics = HashMap::new();
    for name in &config.topics {
        let topic = gossipsub::IdentTopic::new(name.clone());
        topics.insert(topic.hash(), name.clone());
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| anyhow!("subscribing to {}: {:?}", name, e))?;
    }

    for addr in config.listen.to_multiaddrs() {
        swarm
            .listen_on(addr.clone())
            .with_context(|| format!("listening on {}", addr))?;
    }

    let mut control = swarm.behaviour().stream.new_control();
    let incoming = control
        .accept(EVENTS_PROTOCOL)
        .map_err(|e| anyhow!("registering {}: {:?}", EVENTS_PROTOCOL, e))?;

    let (event_tx, event_rx) = mpsc::channel(256);
    let (command_tx, command_rx) = mpsc::channel(64);
    tokio::spawn(run_swarm(swarm, command_rx, event_tx, topics));

    Ok((
        Transport {
            local_peer_id,
            commands: command_tx,
            control,
        },
        event_rx,
        incoming,
    ))
}

async fn run_swarm(
    mut swarm: Swarm<Behaviour>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<TransportEvent>,
    topics: HashMap<TopicHash, String>,
) {
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<bool>>> = HashMap::new();
    loop {
        tokio::select! {
            event = swarm.select_next_some() => {
                handle_swarm_event(&events, &topics, &mut pending_dials, event).await;
            }
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut swarm, &mut pending_dials, command),
                // all Transport handles dropped, we are shutting down
                None => break,
            },
        }
    }
    debug!("swarm loop stopped");
}

async fn handle_swarm_event(
    events: &mpsc::Sender<TransportEvent>,
    topics: &HashMap<TopicHash, String>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<bool>>>,
    event: SwarmEvent<BehaviourEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(%address, "listening");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            for reply in pending_dials.remove(&peer_id).unwrap_or_default() {
                reply.send(true).ok();
            }
            events.send(TransportEvent::PeerConnected(peer_id)).await.ok();
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            if num_established == 0 {
                events.send(TransportEvent::PeerDisconnected(peer_id)).await.ok();
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            debug!(?peer_id, %error, "outgoing connection failed");
            if let Some(peer) = peer_id {
                for reply in pending_dials.remove(&peer).unwrap_or_default() {
                    reply.send(false).ok();
                }
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message, ..
        })) => {
            let topic = match topics.get(&message.topic) {
                Some(name) => name.clone(),
                None => {
                    debug!(topic = %message.topic, "message on unknown topic");
                    return;
                }
            };
            events
                .send(TransportEvent::Gossip {
                    topic,
                    source: message.source,
                    data: message.data,
                })
                .await
                .ok();
        }
        SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer, address) in peers {
                debug!(%peer, %address, "mdns discovered");
                events
                    .send(TransportEvent::PeerDiscovered { peer, address })
                    .await
                    .ok();
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            for address in info.listen_addrs {
                events
                    .send(TransportEvent::PeerDiscovered {
                        peer: peer_id,
                        address,
                    })
                    .await
                    .ok();
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Ping(ping::Event { peer, result, .. })) => {
            if let Err(err) = result {
                debug!(%peer, %err, "ping failure");
            }
        }
        _ => {}
    }
}

fn handle_command(
    swarm: &mut Swarm<Behaviour>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<bool>>>,
    command: Command,
) {
    match command {
        Command::Dial { peer, addresses, reply } => {
            if swarm.is_connected(&peer) {
                reply.send(true).ok();
                return;
            }
            let opts = DialOpts::peer_id(peer).addresses(addresses).build();
            match swarm.dial(opts) {
                Ok(()) => pending_dials.entry(peer).or_default().push(reply),
                // another dial to the peer is already in flight
                Err(DialError::DialPeerConditionFalse(_)) => {
                    pending_dials.entry(peer).or_default().push(reply);
                }
                Err(err) => {
                    debug!(%peer, %err, "dial rejected");
                    reply.send(false).ok();
                }
            }
        }
        Command::Publish { topic, data, reply } => {
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .publish(gossipsub::IdentTopic::new(topic), data)
                .map(|_| ())
                .map_err(|e| anyhow!("publish: {:?}", e));
            reply.send(result).ok();
        }
        Command::Listeners { reply } => {
            reply.send(swarm.listeners().cloned().collect()).ok();
        }
    }
}
