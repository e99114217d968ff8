use crate::config::Config;
use anyhow::{Context, Result};
use messaging::{managers, Engine, NonceLedger, Queue, Router};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::*;
use util::db::DbPath;

/// Stream idle timeout; also bounds how long an idle connection is kept.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A running node: the engine plus its background workers.
pub struct Node {
    pub engine: Engine,
    workers: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bring the whole stack up: stores, host identity, transport, registry,
    /// engine and managers. Any error here is fatal for the process.
    pub async fn start(config: Config) -> Result<Node> {
        let db_dir = config.data_dir.join("db");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("data directory {} is unusable", config.data_dir.display()))?;

        let keypair = swarm::host_keypair(&config.data_dir.join("p2p").join("private.key"))?;

        let (transport, transport_events, incoming) = swarm::start(swarm::TransportConfig {
            keypair,
            listen: config.listen_addrs()?,
            topics: messaging::TOPICS.iter().map(|t| t.to_string()).collect(),
            enable_mdns: config.mdns,
            idle_timeout: IDLE_TIMEOUT,
        })
        .await
        .context("starting the p2p host")?;
        info!(peer = %transport.local_peer_id(), "transport started");

        let (directory_tx, directory_rx) = tokio::sync::mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = tokio::sync::mpsc::unbounded_channel();

        let identities = identity::IdentityStore::open(DbPath::File(db_dir.join("users.db")))?;
        let directory = identity::Directory::open(DbPath::File(db_dir.join("directory.db")), directory_tx)?;
        let queue = Queue::open(DbPath::File(db_dir.join("queue.db")))?;
        let nonces = NonceLedger::new(queue.clone());
        let registry = Arc::new(swarm::PeerRegistry::open(
            DbPath::File(db_dir.join("peers.db")),
            transport.clone(),
            config.peers_minimum,
            peer_tx,
        )?);

        let seeded = swarm::seed_known_peers(&registry, &config.bootstrap);
        if seeded > 0 {
            info!(seeded, "bootstrap peers added");
        }

        let engine = Engine::new(
            identities,
            directory,
            registry,
            queue,
            nonces,
            Router::new(),
            transport,
        );

        let workers = managers::spawn_all(
            engine.clone(),
            transport_events,
            peer_rx,
            directory_rx,
            incoming,
            config.directory_ttl,
        );
        // ask the network for a directory snapshot on first install
        tokio::spawn(managers::directory_download(engine.clone()));

        Ok(Node { engine, workers })
    }

    /// Graceful shutdown: `bye` to connected peers, then stop the workers.
    pub async fn shutdown(self) {
        self.engine.shutdown().await;
        for worker in self.workers {
            worker.abort();
        }
        info!("node stopped");
    }
}
