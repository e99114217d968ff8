use sha1::{Digest, Sha1};

/// Length of a fingerprint in characters.
pub const FINGERPRINT_LEN: usize = 9;

/// Short human-facing handle for a public key: base58 of its SHA-1 digest,
/// truncated to nine characters. Collision resistance is weak; the full id
/// stays authoritative.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha1::digest(public_key);
    bs58::encode(digest).into_string()[..FINGERPRINT_LEN].to_owned()
}
