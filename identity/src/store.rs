use crate::{directory::Directory, DirectoryEntry, REPUBLISH_AFTER};
use anyhow::{bail, Result};
use crypto::{KeyPair, PrivateKey};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tracing::*;
use util::{
    db::{self, DbPath},
    patterns, unix_now,
};

/// How often identity creation retries on an id or fingerprint collision
/// before giving up. Collisions require either a broken RNG or an attack on
/// the store, so running into the limit is a hard error.
const CREATE_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Private,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Private => "private",
        }
    }
}

impl FromStr for Privacy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Privacy::Public),
            "private" => Ok(Privacy::Private),
            other => bail!("unknown privacy {:?}", other),
        }
    }
}

/// An entity owned by a user of this node. The id doubles as the public key;
/// `private` never leaves the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub fingerprint: String,
    #[serde(skip_serializing)]
    pub private: PrivateKey,
    pub user: String,
    pub parent: Option<String>,
    pub class: String,
    pub name: String,
    pub privacy: Privacy,
    pub data: serde_json::Value,
    pub published: u64,
}

impl Identity {
    pub fn keypair(&self) -> KeyPair {
        self.private.into()
    }

    /// The directory record announcing this identity.
    pub fn directory_entry(&self, location: String) -> DirectoryEntry {
        DirectoryEntry {
            id: self.id.clone(),
            fingerprint: self.fingerprint.clone(),
            name: self.name.clone(),
            class: self.class.clone(),
            location,
            data: self.data.clone(),
            updated: unix_now(),
        }
    }
}

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS identities (\
        id TEXT PRIMARY KEY,\
        fingerprint TEXT UNIQUE NOT NULL,\
        private TEXT NOT NULL,\
        user TEXT NOT NULL,\
        parent TEXT,\
        class TEXT NOT NULL,\
        name TEXT NOT NULL,\
        privacy TEXT NOT NULL,\
        data TEXT NOT NULL,\
        published INTEGER NOT NULL DEFAULT 0\
    );\n\
    CREATE INDEX IF NOT EXISTS identities_user ON identities(user);";

#[derive(Clone)]
pub struct IdentityStore {
    conn: Arc<Mutex<Connection>>,
}

impl IdentityStore {
    pub fn open(path: DbPath) -> Result<Self> {
        let conn = db::open(path)?;
        db::ensure_schema(&conn, 1, SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::open(DbPath::Memory).expect("unable to create in memory storage")
    }

    /// Create a fresh identity for `user`.
    ///
    /// Generates an Ed25519 keypair, retrying on id/fingerprint collision.
    /// Public identities are announced through the directory by the caller
    /// (see `Directory::publish`).
    pub fn create(
        &self,
        user: &str,
        class: &str,
        name: &str,
        privacy: Privacy,
        data: serde_json::Value,
    ) -> Result<Identity> {
        self.create_with_keygen(user, class, name, privacy, data, KeyPair::generate)
    }

    /// Keygen is injectable so collision handling stays testable.
    pub fn create_with_keygen(
        &self,
        user: &str,
        class: &str,
        name: &str,
        privacy: Privacy,
        data: serde_json::Value,
        mut keygen: impl FnMut() -> KeyPair,
    ) -> Result<Identity> {
        if !patterns::is_constant(user) {
            bail!("invalid user {:?}", user);
        }
        if !patterns::is_constant(class) {
            bail!("invalid class {:?}", class);
        }
        if !patterns::is_name(name) {
            bail!("invalid name {:?}", name);
        }
        for _ in 0..CREATE_ATTEMPTS {
            let pair = keygen();
            let id = pair.pub_key().to_string();
            let fingerprint = pair.pub_key().fingerprint();
            let identity = Identity {
                id,
                fingerprint,
                private: pair.private_key(),
                user: user.to_owned(),
                parent: None,
                class: class.to_owned(),
                name: name.to_owned(),
                privacy,
                data: data.clone(),
                published: 0,
            };
            match self.insert(&identity) {
                Ok(()) => {
                    debug!(id = %identity.id, user, "identity created");
                    return Ok(identity);
                }
                Err(err) if is_unique_violation(&err) => {
                    warn!(id = %identity.id, "id or fingerprint collision, regenerating");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        bail!("unable to create identity for {:?} after {} attempts", user, CREATE_ATTEMPTS)
    }

    fn insert(&self, identity: &Identity) -> rusqlite::Result<()> {
        self.conn
            .lock()
            .prepare_cached(
                "INSERT INTO identities \
                 (id, fingerprint, private, user, parent, class, name, privacy, data, published) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                identity.id,
                identity.fingerprint,
                identity.private.to_string(),
                identity.user,
                identity.parent,
                identity.class,
                identity.name,
                identity.privacy.as_str(),
                identity.data.to_string(),
                identity.published,
            ])?;
        Ok(())
    }

    pub fn by_id(&self, id: &str) -> Result<Option<Identity>> {
        self.select("SELECT * FROM identities WHERE id = ?", params![id])
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Result<Option<Identity>> {
        self.select("SELECT * FROM identities WHERE fingerprint = ?", params![fingerprint])
    }

    pub fn by_user_id(&self, user: &str, id: &str) -> Result<Option<Identity>> {
        self.select("SELECT * FROM identities WHERE user = ? AND id = ?", params![user, id])
    }

    /// Either address form: entity id or fingerprint.
    pub fn by_address(&self, address: &str) -> Result<Option<Identity>> {
        if patterns::is_fingerprint(address) {
            self.by_fingerprint(address)
        } else {
            self.by_id(address)
        }
    }

    pub fn for_user(&self, user: &str) -> Result<Vec<Identity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM identities WHERE user = ?")?;
        let rows = stmt.query_map(params![user], row_to_identity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn select(&self, sql: &str, args: impl rusqlite::Params) -> Result<Option<Identity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        Ok(stmt.query_row(args, row_to_identity).optional()?)
    }

    /// Public identities whose last announcement is older than 30 days.
    pub fn republish_due(&self, now: u64) -> Result<Vec<Identity>> {
        let cutoff = now.saturating_sub(REPUBLISH_AFTER);
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM identities WHERE privacy = 'public' AND published < ?")?;
        let rows = stmt.query_map(params![cutoff], row_to_identity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn mark_published(&self, id: &str, now: u64) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached("UPDATE identities SET published = ? WHERE id = ?")?
            .execute(params![now, id])?;
        Ok(())
    }

    /// Republish pass: stamp due identities and push them to the directory.
    /// Returns the number of identities announced.
    pub fn republish_scan(&self, directory: &Directory, location: &str, now: u64) -> Result<usize> {
        let due = self.republish_due(now)?;
        for identity in &due {
            self.mark_published(&identity.id, now)?;
            let entry = identity.directory_entry(location.to_owned());
            directory.create(&entry)?;
            directory.publish(entry);
        }
        Ok(due.len())
    }
}

fn row_to_identity(row: &rusqlite::Row) -> rusqlite::Result<Identity> {
    let private: String = row.get("private")?;
    let privacy: String = row.get("privacy")?;
    let data: String = row.get("data")?;
    Ok(Identity {
        id: row.get("id")?,
        fingerprint: row.get("fingerprint")?,
        private: PrivateKey::from_str(&private)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into()))?,
        user: row.get("user")?,
        parent: row.get("parent")?,
        class: row.get("class")?,
        name: row.get("name")?,
        privacy: Privacy::from_str(&privacy)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into()))?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        published: row.get("published")?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                ..
            },
            ..
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdentityStore {
        IdentityStore::in_memory()
    }

    #[test]
    fn create_and_lookup() {
        let store = store();
        let identity = store
            .create("alice", "person", "Alice", Privacy::Private, serde_json::json!({}))
            .unwrap();
        assert_eq!(store.by_id(&identity.id).unwrap().unwrap().user, "alice");
        assert_eq!(
            store.by_fingerprint(&identity.fingerprint).unwrap().unwrap().id,
            identity.id
        );
        assert_eq!(
            store.by_user_id("alice", &identity.id).unwrap().unwrap().name,
            "Alice"
        );
        assert!(store.by_user_id("bob", &identity.id).unwrap().is_none());
    }

    #[test]
    fn create_validates_arguments() {
        let store = store();
        assert!(store
            .create("Not Valid", "person", "Alice", Privacy::Private, serde_json::json!({}))
            .is_err());
        assert!(store
            .create("alice", "Person", "Alice", Privacy::Private, serde_json::json!({}))
            .is_err());
        assert!(store
            .create("alice", "person", "", Privacy::Private, serde_json::json!({}))
            .is_err());
    }

    #[test]
    fn collision_retries_with_fresh_keys() {
        let store = store();
        let stuck = KeyPair::generate();
        let mut calls = 0;
        // keygen yields the same pair three times before producing fresh ones
        let first = store
            .create_with_keygen("alice", "person", "A", Privacy::Private, serde_json::json!({}), || {
                calls += 1;
                stuck
            })
            .unwrap();
        let second = store
            .create_with_keygen("alice", "person", "B", Privacy::Private, serde_json::json!({}), || {
                calls += 1;
                if calls < 5 {
                    stuck
                } else {
                    KeyPair::generate()
                }
            })
            .unwrap();
        assert_eq!(first.id, stuck.pub_key().to_string());
        assert_ne!(second.id, first.id);
        assert_ne!(second.fingerprint, first.fingerprint);
    }

    #[test]
    fn republish_due_honors_cutoff() {
        let store = store();
        let public = store
            .create("alice", "person", "A", Privacy::Public, serde_json::json!({}))
            .unwrap();
        store
            .create("alice", "person", "B", Privacy::Private, serde_json::json!({}))
            .unwrap();
        let now = unix_now();
        // freshly created, published = 0, so due immediately
        let due = store.republish_due(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, public.id);

        store.mark_published(&public.id, now).unwrap();
        assert!(store.republish_due(now).unwrap().is_empty());
        assert_eq!(store.republish_due(now + REPUBLISH_AFTER + 1).unwrap().len(), 1);
    }
}
