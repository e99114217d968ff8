use crate::{private::PrivateKey, public::PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The Ed25519 signing pair behind one entity (or the host itself).
///
/// Equality is decided by the public half alone; two pairs with the same
/// public key are the same identity.
#[derive(Serialize, Deserialize, Clone, Copy)]
pub struct KeyPair {
    pub(crate) public: PublicKey,
    pub(crate) private: PrivateKey,
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the private half stays out of logs and debug dumps
        write!(f, "KeyPair({})", self.public)
    }
}

impl From<KeyPair> for libp2p::identity::Keypair {
    fn from(kp: KeyPair) -> libp2p::identity::Keypair {
        let mut bytes = kp.private.to_bytes();
        libp2p::identity::Keypair::ed25519_from_bytes(&mut bytes)
            .expect("ed25519 encoding format changed between libp2p and crypto")
    }
}

impl From<KeyPair> for libp2p::PeerId {
    fn from(kp: KeyPair) -> Self {
        libp2p::identity::Keypair::from(kp).public().to_peer_id()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        PrivateKey::generate().into()
    }

    pub fn pub_key(&self) -> PublicKey {
        self.public
    }

    pub fn private_key(&self) -> PrivateKey {
        self.private
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer;
        self.private.to_ed25519().sign(message).to_bytes()
    }
}
