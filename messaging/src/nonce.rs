use crate::queue::Queue;
use anyhow::Result;
use crypto::base58_encode;
use parking_lot::Mutex;
use rand::RngCore;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::*;

/// In-memory nonce retention; covers replays inside a connection's lifetime.
pub const NONCE_TTL: Duration = Duration::from_secs(600);

const NONCE_BYTES: usize = 24;

/// Generate a fresh message nonce.
pub fn nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base58_encode(&bytes)
}

/// Two-layer replay defence: a fast in-memory map with a 10 minute TTL and
/// the persistent `seen_nonces` table (24 hours) for cross-restart dedup.
pub struct NonceLedger {
    seen: Mutex<HashMap<String, Instant>>,
    queue: Queue,
}

impl NonceLedger {
    pub fn new(queue: Queue) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            queue,
        }
    }

    /// Has this nonce never been seen, in memory or on disk?
    pub fn is_fresh(&self, nonce: &str) -> Result<bool> {
        if self.seen.lock().contains_key(nonce) {
            return Ok(false);
        }
        // the map lock is released before the store is consulted
        Ok(!self.queue.nonce_seen(nonce)?)
    }

    pub fn record(&self, nonce: &str, now: u64) -> Result<()> {
        self.seen.lock().insert(nonce.to_owned(), Instant::now());
        self.queue.nonce_record(nonce, now)
    }

    /// Expire in-memory entries older than [`NONCE_TTL`].
    pub fn gc(&self) {
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, at| at.elapsed() < NONCE_TTL);
        let expired = before - seen.len();
        if expired > 0 {
            trace!(expired, "nonces expired from memory");
        }
    }
}
