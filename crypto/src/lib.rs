mod base58;
mod codec;
mod fingerprint;
mod pair;
mod private;
mod public;

pub use base58::{base58_check_decode, base58_check_encode, base58_decode, base58_encode};
pub use codec::{cbor_decode, cbor_encode};
pub use fingerprint::fingerprint;
pub use pair::KeyPair;
pub use private::PrivateKey;
pub use public::PublicKey;
