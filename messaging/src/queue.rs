use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::*;
use util::db::{self, DbPath};

/// Queued sends older than this are dropped unsent.
pub const MAX_QUEUE_TIME: u64 = 7 * 86_400;

/// Persistent nonce rows are kept this long.
pub const NONCE_RETENTION: u64 = 86_400;

/// A send awaiting delivery. Deliberately has no signature, timestamp or
/// nonce: those are regenerated on every attempt so the freshness window
/// holds.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub service: String,
    pub event: String,
    pub content: Vec<u8>,
    pub data: Vec<u8>,
    pub file: Option<String>,
    pub created: u64,
}

/// A deferred pubsub publish.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedBroadcast {
    pub id: String,
    pub topic: String,
    pub sender: String,
    pub service: String,
    pub event: String,
    pub content: Vec<u8>,
    pub data: Vec<u8>,
    pub created: u64,
}

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS entities (\
        entity TEXT NOT NULL,\
        id TEXT NOT NULL,\
        sender TEXT NOT NULL,\
        recipient TEXT NOT NULL,\
        service TEXT NOT NULL,\
        event TEXT NOT NULL,\
        content BLOB NOT NULL,\
        data BLOB NOT NULL,\
        file TEXT,\
        created INTEGER NOT NULL,\
        PRIMARY KEY (entity, id)\
    );\n\
    CREATE TABLE IF NOT EXISTS peers (\
        peer TEXT NOT NULL,\
        id TEXT NOT NULL,\
        sender TEXT NOT NULL,\
        recipient TEXT NOT NULL,\
        service TEXT NOT NULL,\
        event TEXT NOT NULL,\
        content BLOB NOT NULL,\
        data BLOB NOT NULL,\
        file TEXT,\
        created INTEGER NOT NULL,\
        PRIMARY KEY (peer, id)\
    );\n\
    CREATE TABLE IF NOT EXISTS broadcasts (\
        id TEXT PRIMARY KEY,\
        topic TEXT NOT NULL,\
        sender TEXT NOT NULL,\
        service TEXT NOT NULL,\
        event TEXT NOT NULL,\
        content BLOB NOT NULL,\
        data BLOB NOT NULL,\
        created INTEGER NOT NULL\
    );\n\
    CREATE TABLE IF NOT EXISTS seen_nonces (\
        nonce TEXT PRIMARY KEY,\
        created INTEGER NOT NULL\
    );";

/// The three outbound queues plus the persistent nonce ledger, all in
/// `db/queue.db`.
#[derive(Clone)]
pub struct Queue {
    conn: Arc<Mutex<Connection>>,
}

impl Queue {
    pub fn open(path: DbPath) -> Result<Self> {
        let conn = db::open(path)?;
        db::ensure_schema(&conn, 1, SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::open(DbPath::Memory).expect("unable to create in memory queue")
    }

    pub fn enqueue_entity(&self, entity: &str, msg: &QueuedMessage) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached(
                "INSERT OR REPLACE INTO entities \
                 (entity, id, sender, recipient, service, event, content, data, file, created) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                entity, msg.id, msg.sender, msg.recipient, msg.service, msg.event, msg.content, msg.data,
                msg.file, msg.created,
            ])?;
        debug!(entity, id = %msg.id, "queued for entity");
        Ok(())
    }

    pub fn enqueue_peer(&self, peer: &str, msg: &QueuedMessage) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached(
                "INSERT OR REPLACE INTO peers \
                 (peer, id, sender, recipient, service, event, content, data, file, created) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                peer, msg.id, msg.sender, msg.recipient, msg.service, msg.event, msg.content, msg.data,
                msg.file, msg.created,
            ])?;
        debug!(peer, id = %msg.id, "queued for peer");
        Ok(())
    }

    pub fn enqueue_broadcast(&self, broadcast: &QueuedBroadcast) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached(
                "INSERT OR REPLACE INTO broadcasts \
                 (id, topic, sender, service, event, content, data, created) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                broadcast.id, broadcast.topic, broadcast.sender, broadcast.service, broadcast.event,
                broadcast.content, broadcast.data, broadcast.created,
            ])?;
        debug!(topic = %broadcast.topic, id = %broadcast.id, "broadcast deferred");
        Ok(())
    }

    pub fn entity_rows(&self, entity: &str) -> Result<Vec<QueuedMessage>> {
        self.rows("SELECT * FROM entities WHERE entity = ? ORDER BY created", entity)
    }

    pub fn peer_rows(&self, peer: &str) -> Result<Vec<QueuedMessage>> {
        self.rows("SELECT * FROM peers WHERE peer = ? ORDER BY created", peer)
    }

    fn rows(&self, sql: &str, key: &str) -> Result<Vec<QueuedMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![key], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn broadcast_rows(&self) -> Result<Vec<QueuedBroadcast>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM broadcasts ORDER BY created")?;
        let rows = stmt.query_map([], |row| {
            Ok(QueuedBroadcast {
                id: row.get("id")?,
                topic: row.get("topic")?,
                sender: row.get("sender")?,
                service: row.get("service")?,
                event: row.get("event")?,
                content: row.get("content")?,
                data: row.get("data")?,
                created: row.get("created")?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_entity(&self, entity: &str, id: &str) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached("DELETE FROM entities WHERE entity = ? AND id = ?")?
            .execute(params![entity, id])?;
        Ok(())
    }

    pub fn delete_peer(&self, peer: &str, id: &str) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached("DELETE FROM peers WHERE peer = ? AND id = ?")?
            .execute(params![peer, id])?;
        Ok(())
    }

    pub fn delete_broadcast(&self, id: &str) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached("DELETE FROM broadcasts WHERE id = ?")?
            .execute(params![id])?;
        Ok(())
    }

    /// A random entity with pending rows. The random pick keeps one stuck
    /// target from starving the others.
    pub fn random_entity(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let result = conn
            .prepare_cached("SELECT entity FROM entities ORDER BY RANDOM() LIMIT 1")?
            .query_row([], |row| row.get(0))
            .optional()?;
        Ok(result)
    }

    pub fn random_peer(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let result = conn
            .prepare_cached("SELECT peer FROM peers ORDER BY RANDOM() LIMIT 1")?
            .query_row([], |row| row.get(0))
            .optional()?;
        Ok(result)
    }

    /// Drop rows older than [`MAX_QUEUE_TIME`] from all three queues.
    pub fn prune(&self, now: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(MAX_QUEUE_TIME);
        let conn = self.conn.lock();
        let mut removed = 0;
        for table in ["entities", "peers", "broadcasts"] {
            removed += conn.execute(&format!("DELETE FROM {} WHERE created < ?", table), params![cutoff])?;
        }
        if removed > 0 {
            debug!(removed, "expired queue rows dropped");
        }
        Ok(removed)
    }

    pub fn nonce_seen(&self, nonce: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let result = conn
            .prepare_cached("SELECT 1 FROM seen_nonces WHERE nonce = ?")?
            .query_row(params![nonce], |_| Ok(()))
            .optional()?
            .is_some();
        Ok(result)
    }

    pub fn nonce_record(&self, nonce: &str, now: u64) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached("INSERT OR REPLACE INTO seen_nonces (nonce, created) VALUES (?, ?)")?
            .execute(params![nonce, now])?;
        Ok(())
    }

    pub fn nonce_prune(&self, now: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(NONCE_RETENTION);
        Ok(self
            .conn
            .lock()
            .prepare_cached("DELETE FROM seen_nonces WHERE created < ?")?
            .execute(params![cutoff])?)
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<QueuedMessage> {
    Ok(QueuedMessage {
        id: row.get("id")?,
        sender: row.get("sender")?,
        recipient: row.get("recipient")?,
        service: row.get("service")?,
        event: row.get("event")?,
        content: row.get("content")?,
        data: row.get("data")?,
        file: row.get("file")?,
        created: row.get("created")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use util::unix_now;

    fn message(id: &str, created: u64) -> QueuedMessage {
        QueuedMessage {
            id: id.to_owned(),
            sender: "sender-id".to_owned(),
            recipient: "recipient-id".to_owned(),
            service: "friends".to_owned(),
            event: "invite".to_owned(),
            content: b"{}".to_vec(),
            data: Vec::new(),
            file: None,
            created,
        }
    }

    #[test]
    fn entity_queue_roundtrip() {
        let queue = Queue::in_memory();
        let msg = message("m-1", unix_now());
        queue.enqueue_entity("entity-1", &msg).unwrap();
        assert_eq!(queue.entity_rows("entity-1").unwrap(), vec![msg]);
        assert_eq!(queue.random_entity().unwrap().as_deref(), Some("entity-1"));
        queue.delete_entity("entity-1", "m-1").unwrap();
        assert!(queue.entity_rows("entity-1").unwrap().is_empty());
        assert_eq!(queue.random_entity().unwrap(), None);
    }

    #[test]
    fn enqueue_is_idempotent_per_id() {
        let queue = Queue::in_memory();
        let msg = message("m-1", unix_now());
        queue.enqueue_peer("peer-1", &msg).unwrap();
        queue.enqueue_peer("peer-1", &msg).unwrap();
        assert_eq!(queue.peer_rows("peer-1").unwrap().len(), 1);
    }

    #[test]
    fn prune_drops_expired_rows() {
        let queue = Queue::in_memory();
        let now = unix_now();
        queue.enqueue_entity("e", &message("old", now - MAX_QUEUE_TIME - 1)).unwrap();
        queue.enqueue_entity("e", &message("new", now)).unwrap();
        queue
            .enqueue_broadcast(&QueuedBroadcast {
                id: "b-old".to_owned(),
                topic: "directory".to_owned(),
                sender: String::new(),
                service: "directory".to_owned(),
                event: "publish".to_owned(),
                content: Vec::new(),
                data: Vec::new(),
                created: now - MAX_QUEUE_TIME - 1,
            })
            .unwrap();
        assert_eq!(queue.prune(now).unwrap(), 2);
        let left = queue.entity_rows("e").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "new");
        assert!(queue.broadcast_rows().unwrap().is_empty());
    }

    #[test]
    fn nonce_ledger_roundtrip() {
        let queue = Queue::in_memory();
        let now = unix_now();
        assert!(!queue.nonce_seen("n-1").unwrap());
        queue.nonce_record("n-1", now).unwrap();
        assert!(queue.nonce_seen("n-1").unwrap());
        // still inside the retention window
        assert_eq!(queue.nonce_prune(now + NONCE_RETENTION - 10).unwrap(), 0);
        assert_eq!(queue.nonce_prune(now + NONCE_RETENTION + 10).unwrap(), 1);
        assert!(!queue.nonce_seen("n-1").unwrap());
    }
}
