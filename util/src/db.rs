//! Shared sqlite plumbing for the persistent stores.
//!
//! Every store keeps its own database file under `db/` in the data directory
//! and versions its schema through a `settings(name='schema')` row.

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;
use tracing::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbPath {
    File(PathBuf),
    Memory,
}

pub fn open(path: DbPath) -> Result<Connection> {
    debug!("opening database {:?}", path);
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = match path {
        DbPath::File(path) => {
            Connection::open_with_flags(&path, flags).with_context(|| format!("opening {}", path.display()))?
        }
        DbPath::Memory => Connection::open(":memory:")?,
    };
    // `PRAGMA journal_mode = WAL;` returns the new journal mode, so check it took
    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| {
        let res: String = row.get(0)?;
        match res.as_str() {
            "wal" => Ok("wal"),
            "memory" => Ok("memory"), // there is no WAL for memory databases
            _other => Err(rusqlite::Error::InvalidQuery),
        }
    })?;
    conn.execute("PRAGMA synchronous = NORMAL;", [])?;
    Ok(conn)
}

/// Apply `schema` unless the stored schema version is already `version` or
/// newer. The statements must be idempotent (`CREATE TABLE IF NOT EXISTS`)
/// since they re-run on upgrades from any older version.
pub fn ensure_schema(conn: &Connection, version: u32, schema: &str) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings \
         (name TEXT PRIMARY KEY, value TEXT) WITHOUT ROWID;",
    )?;
    let current: u32 = conn
        .query_row("SELECT value FROM settings WHERE name = 'schema'", [], |row| {
            row.get::<_, String>(0)
        })
        .optional()?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if current < version {
        conn.execute_batch(&format!("BEGIN;\n{}\nCOMMIT;", schema))?;
        conn.execute(
            "INSERT OR REPLACE INTO settings VALUES ('schema', ?)",
            [version.to_string()],
        )?;
        info!("schema upgraded from {} to {}", current, version);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_version_is_recorded() {
        let conn = open(DbPath::Memory).unwrap();
        ensure_schema(&conn, 1, "CREATE TABLE IF NOT EXISTS t (x INTEGER);").unwrap();
        let v: String = conn
            .query_row("SELECT value FROM settings WHERE name = 'schema'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(v, "1");
        // re-running with the same version is a no-op
        ensure_schema(&conn, 1, "CREATE TABLE IF NOT EXISTS t (x INTEGER);").unwrap();
    }
}
