use crate::{base58::base58_check_encode, fingerprint::fingerprint};
use anyhow::Result;
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Debug, Display};

/// A public key, which also serves as identifier for the corresponding private key
///
/// It consists of 32 octets which are actually the same bytes as the underlying
/// `ed25519_dalek::VerifyingKey`. Thus it's possible to derive all sorts of other
/// identifier from this structure, like a `libp2p::PeerId`.
///
/// The canonical representation is the base58-check encoding of the bytes, which is
/// also the entity id used in frame headers and the directory (49 to 51 characters).
#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PublicKey(pub(crate) [u8; 32]);

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", base58_check_encode(&self.0))
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string())
    }
}

impl std::str::FromStr for PublicKey {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).with_check(None).into_vec()?;
        Self::from_bytes(&bytes)
    }
}

impl PublicKey {
    /// Gets the underlying ed25519 public key for interop with rust crypto libs
    pub fn to_ed25519(self) -> ed25519_dalek::VerifyingKey {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0).expect("PublicKey is validated on construction")
    }
    pub fn to_bytes(self) -> [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] {
        self.0
    }
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected {} key bytes, received {}", ed25519_dalek::PUBLIC_KEY_LENGTH, bytes.len()))?;
        let ed25519 = ed25519_dalek::VerifyingKey::from_bytes(&bytes)?;
        Ok(ed25519.into())
    }
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let signature = if let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) {
            sig
        } else {
            return false;
        };
        use ed25519_dalek::Verifier;
        self.to_ed25519().verify(message, &signature).is_ok()
    }
    /// Nine-character human-facing handle for this key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl From<PublicKey> for libp2p::PeerId {
    fn from(pk: PublicKey) -> libp2p::PeerId {
        let public: libp2p::identity::PublicKey = pk.into();
        public.to_peer_id()
    }
}

impl From<PublicKey> for libp2p::identity::PublicKey {
    fn from(pk: PublicKey) -> libp2p::identity::PublicKey {
        libp2p::identity::ed25519::PublicKey::try_from_bytes(&pk.0)
            .expect("ed25519 encoding format changed between libp2p and crypto")
            .into()
    }
}

impl From<libp2p::identity::ed25519::PublicKey> for PublicKey {
    fn from(o: libp2p::identity::ed25519::PublicKey) -> Self {
        Self(o.to_bytes())
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<ed25519_dalek::VerifyingKey> for PublicKey {
    fn from(key: ed25519_dalek::VerifyingKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = PublicKey;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("PublicKey")
            }
            fn visit_str<E: serde::de::Error>(self, string: &str) -> Result<Self::Value, E> {
                use std::str::FromStr;
                PublicKey::from_str(string).map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(V)
    }
}

#[cfg(test)]
mod tests {
    use super::PublicKey;
    use crate::PrivateKey;
    use std::str::FromStr;

    #[test]
    fn str_roundtrip() {
        let private = PrivateKey::generate();
        let p: PublicKey = private.into();
        let str = format!("{}", p);
        let round_tripped = PublicKey::from_str(&str).unwrap();
        assert_eq!(p, round_tripped);
    }

    #[test]
    fn id_length_is_wire_safe() {
        for _ in 0..16 {
            let p: PublicKey = PrivateKey::generate().into();
            let id = p.to_string();
            assert!((49..=51).contains(&id.len()), "unexpected id length {}", id.len());
        }
    }
}
