use crate::{base58::base58_check_encode, pair::KeyPair, public::PublicKey};
use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Debug, Display};

/// A Mochi private key.
///
/// Currently this is just a newtype wrapper around an ed25519 private key, but this may
/// change if we ever have the need for another encryption standard.
///
/// It seems like SecretKey is often used in the context of symmetric encryption, so we
/// call this PrivateKey, unlike the wrapped type.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PrivateKey(pub(crate) [u8; 32]);

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "secret")
    }
}

impl Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58_check_encode(&self.0))
    }
}

impl std::str::FromStr for PrivateKey {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).with_check(None).into_vec()?;
        Self::from_bytes(&bytes)
    }
}

impl From<PrivateKey> for KeyPair {
    fn from(private: PrivateKey) -> KeyPair {
        let public: PublicKey = private.into();
        KeyPair { public, private }
    }
}

impl From<PrivateKey> for PublicKey {
    fn from(private: PrivateKey) -> PublicKey {
        private.to_ed25519().verifying_key().into()
    }
}

impl PrivateKey {
    pub fn to_ed25519(self) -> ed25519_dalek::SigningKey {
        ed25519_dalek::SigningKey::from_bytes(&self.0)
    }
    pub fn to_bytes(&self) -> [u8; ed25519_dalek::SECRET_KEY_LENGTH] {
        self.0
    }
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; ed25519_dalek::SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| anyhow!("expected {} key bytes, received {}", ed25519_dalek::SECRET_KEY_LENGTH, bytes.len()))?;
        Ok(Self(bytes))
    }
    pub fn generate() -> Self {
        let k = ed25519_dalek::SigningKey::generate(&mut OsRng);
        Self(k.to_bytes())
    }
}

impl Serialize for PrivateKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = PrivateKey;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("PrivateKey")
            }
            fn visit_str<E: serde::de::Error>(self, string: &str) -> Result<Self::Value, E> {
                use std::str::FromStr;
                PrivateKey::from_str(string).map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(V)
    }
}
