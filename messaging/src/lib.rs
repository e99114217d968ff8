//! The federated messaging engine: framing, replay defence, dispatch and
//! durable outbound queues on top of the swarm transport.
//!
//! Apps see three things: [`Router`] registration at startup,
//! [`Engine::send`]/[`Engine::publish_event`] for outbound traffic, and the
//! [`Event`] their handlers receive. Everything else in here keeps the
//! at-most-once promise under flaky peers: per-connection challenges, the
//! two-layer nonce ledger, and re-signed retries out of `db/queue.db`.

pub mod engine;
pub mod event;
pub mod headers;
pub mod managers;
pub mod nonce;
pub mod queue;
pub mod router;
pub mod wire;

pub use engine::{Engine, IDLE_TIMEOUT, TOPICS, TOPIC_DIRECTORY, TOPIC_MESSAGES, TOPIC_PEERS};
pub use event::{message_id, Event, OutboundEvent, Reply};
pub use headers::{Headers, MAX_ID_LEN, TIMESTAMP_WINDOW};
pub use nonce::{nonce, NonceLedger};
pub use queue::{Queue, QueuedBroadcast, QueuedMessage, MAX_QUEUE_TIME};
pub use router::{App, Handler, Router};
pub use wire::{Frame, CHALLENGE_LEN};
