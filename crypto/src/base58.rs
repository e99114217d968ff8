use tracing::*;

/// Plain base58, used for signatures and other values that carry their own
/// integrity.
pub fn base58_encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

pub fn base58_decode(string: &str) -> anyhow::Result<Vec<u8>> {
    Ok(bs58::decode(string).into_vec()?)
}

/// Encode `bytes` as base58 with a trailing 4-byte double-SHA-256 checksum.
pub fn base58_check_encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).with_check().into_string()
}

/// Decode a base58-check string.
///
/// Malformed input or a checksum mismatch yields `default`; the failure is
/// only logged because wire input routinely contains garbage.
pub fn base58_check_decode(string: &str, default: &[u8]) -> Vec<u8> {
    match bs58::decode(string).with_check(None).into_vec() {
        Ok(bytes) => bytes,
        Err(err) => {
            info!("base58 decode of {:?} failed: {}", string, err);
            default.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let bytes = [7u8; 32];
        let encoded = base58_check_encode(&bytes);
        assert_eq!(base58_check_decode(&encoded, &[]), bytes.to_vec());
    }

    #[test]
    fn bad_checksum_yields_default() {
        let mut encoded = base58_check_encode(&[7u8; 32]);
        // flip the last character to break the checksum
        let last = if encoded.ends_with('x') { 'y' } else { 'x' };
        encoded.pop();
        encoded.push(last);
        assert_eq!(base58_check_decode(&encoded, &[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn garbage_yields_default() {
        assert_eq!(base58_check_decode("not!base58", &[]), Vec::<u8>::new());
    }
}
