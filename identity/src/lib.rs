//! Identity issuance, lookup and location for the messaging substrate.
//!
//! Local identities (keypairs owned by users of this node) live in
//! `db/users.db`; remote identities seen on the network are cached in the
//! directory (`db/directory.db`). Location resolution ties the two together
//! with the peer registry to decide how an event can reach its recipient.

mod directory;
mod location;
mod store;

pub use directory::{Directory, DirectoryCommand, DirectoryEntry, DEFAULT_TTL as DIRECTORY_TTL};
pub use location::{locate, FollowUp, Location, Method, PeerView};
pub use store::{Identity, IdentityStore, Privacy};

/// Seconds after which a public identity is announced again.
pub const REPUBLISH_AFTER: u64 = 30 * 86_400;
