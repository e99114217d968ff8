use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::*;
use util::db::{self, DbPath};

/// Default seconds of inactivity after which a cached remote identity is
/// dropped again.
pub const DEFAULT_TTL: u64 = 30 * 86_400;

/// A remote identity as last seen on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub fingerprint: String,
    pub name: String,
    pub class: String,
    /// Peer currently hosting the identity.
    pub location: String,
    pub data: serde_json::Value,
    pub updated: u64,
}

/// Work the directory hands to the pubsub publisher. The directory itself
/// never touches the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryCommand {
    /// Announce one of our entries on the directory topic.
    Publish(DirectoryEntry),
    /// Ask the network who hosts the given identity.
    Request(String),
}

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS directory (\
        id TEXT PRIMARY KEY,\
        fingerprint TEXT NOT NULL,\
        name TEXT NOT NULL,\
        class TEXT NOT NULL,\
        location TEXT NOT NULL,\
        data TEXT NOT NULL,\
        updated INTEGER NOT NULL\
    );\n\
    CREATE INDEX IF NOT EXISTS directory_name ON directory(name);";

#[derive(Clone)]
pub struct Directory {
    conn: Arc<Mutex<Connection>>,
    commands: UnboundedSender<DirectoryCommand>,
}

impl Directory {
    pub fn open(path: DbPath, commands: UnboundedSender<DirectoryCommand>) -> Result<Self> {
        let conn = db::open(path)?;
        db::ensure_schema(&conn, 1, SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            commands,
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> (Self, tokio::sync::mpsc::UnboundedReceiver<DirectoryCommand>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self::open(DbPath::Memory, tx).unwrap(), rx)
    }

    pub fn by_id(&self, id: &str) -> Result<Option<DirectoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM directory WHERE id = ?")?;
        Ok(stmt.query_row(params![id], row_to_entry).optional()?)
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Result<Option<DirectoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM directory WHERE fingerprint = ?")?;
        Ok(stmt.query_row(params![fingerprint], row_to_entry).optional()?)
    }

    pub fn search(&self, query: &str) -> Result<Vec<DirectoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM directory WHERE name LIKE ? ORDER BY name")?;
        let pattern = format!("%{}%", query.replace('%', ""));
        let rows = stmt.query_map(params![pattern], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert or overwrite an entry we own.
    pub fn create(&self, entry: &DirectoryEntry) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached(
                "INSERT OR REPLACE INTO directory \
                 (id, fingerprint, name, class, location, data, updated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                entry.id,
                entry.fingerprint,
                entry.name,
                entry.class,
                entry.location,
                entry.data.to_string(),
                entry.updated,
            ])?;
        Ok(())
    }

    /// Announce an entry on the directory topic (fire and forget).
    pub fn publish(&self, entry: DirectoryEntry) {
        if self.commands.send(DirectoryCommand::Publish(entry)).is_err() {
            warn!("directory publisher is gone, announcement dropped");
        }
    }

    /// Ask the network for an identity we have no entry for.
    pub fn request(&self, id: &str) {
        if self.commands.send(DirectoryCommand::Request(id.to_owned())).is_err() {
            warn!("directory publisher is gone, request dropped");
        }
    }

    /// Merge an entry received from a peer; `updated` only moves forward.
    pub fn apply_remote(&self, entry: &DirectoryEntry) -> Result<bool> {
        if let Some(existing) = self.by_id(&entry.id)? {
            if existing.updated >= entry.updated {
                return Ok(false);
            }
        }
        self.create(entry)?;
        debug!(id = %entry.id, location = %entry.location, "directory entry updated");
        Ok(true)
    }

    /// Drop entries not refreshed within `ttl` seconds.
    pub fn cleanup(&self, ttl: u64, now: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(ttl);
        let removed = self
            .conn
            .lock()
            .prepare_cached("DELETE FROM directory WHERE updated < ?")?
            .execute(params![cutoff])?;
        if removed > 0 {
            debug!(removed, "directory entries expired");
        }
        Ok(removed)
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<DirectoryEntry> {
    let data: String = row.get("data")?;
    Ok(DirectoryEntry {
        id: row.get("id")?,
        fingerprint: row.get("fingerprint")?,
        name: row.get("name")?,
        class: row.get("class")?,
        location: row.get("location")?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        updated: row.get("updated")?,
    })
}
