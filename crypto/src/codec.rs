use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};

/// CBOR-encode any serde record.
pub fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_cbor::to_vec(value)?)
}

/// Decode a CBOR item into the given record type.
pub fn cbor_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_cbor::from_slice(bytes)?)
}
