use crypto::{base58_decode, base58_encode, KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use util::{formats::audit, patterns};

/// Maximum length of message and ack ids.
pub const MAX_ID_LEN: usize = 64;

/// Accepted clock skew for signed frames, in seconds, in both directions.
pub const TIMESTAMP_WINDOW: u64 = 300;

pub const TYPE_MSG: &str = "msg";
pub const TYPE_ACK: &str = "ack";
pub const TYPE_NACK: &str = "nack";
pub const TYPE_BYE: &str = "bye";

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// The CBOR header record leading every frame. An empty `type` means `msg`;
/// an empty `from` means anonymous, in which case there is no signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ack: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl Headers {
    pub fn is_msg(&self) -> bool {
        self.frame_type.is_empty() || self.frame_type == TYPE_MSG
    }

    pub fn ack_for(id: &str) -> Self {
        Headers {
            frame_type: TYPE_ACK.to_owned(),
            ack: id.to_owned(),
            ..Default::default()
        }
    }

    pub fn nack_for(id: &str) -> Self {
        Headers {
            frame_type: TYPE_NACK.to_owned(),
            ack: id.to_owned(),
            ..Default::default()
        }
    }

    pub fn bye() -> Self {
        Headers {
            frame_type: TYPE_BYE.to_owned(),
            ..Default::default()
        }
    }

    /// The byte string covered by the signature. The receiver's challenge is
    /// mixed in (empty for pubsub) so a captured signature dies with its
    /// connection; timestamp and nonce are covered so freshness and dedup
    /// cannot be stripped, and the payload is covered so it cannot be
    /// swapped under a valid header.
    pub fn signable(&self, challenge: &[u8], content: &[u8], data: &[u8]) -> Vec<u8> {
        crypto::cbor_encode(&(
            &self.frame_type,
            &self.from,
            &self.to,
            &self.service,
            &self.event,
            &self.id,
            &self.ack,
            self.timestamp,
            &self.nonce,
            challenge,
            content,
            data,
        ))
        .expect("header tuple always encodes")
    }

    /// Sign the headers with the sender's key against the given challenge.
    pub fn sign(&mut self, pair: &KeyPair, challenge: &[u8], content: &[u8], data: &[u8]) {
        self.signature = base58_encode(&pair.sign(&self.signable(challenge, content, data)));
    }

    /// Verify the signature against the `from` entity and the challenge.
    pub fn verify(&self, challenge: &[u8], content: &[u8], data: &[u8]) -> bool {
        let key = match PublicKey::from_str(&self.from) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = match base58_decode(&self.signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        key.verify(&self.signable(challenge, content, data), &signature)
    }

    /// Structural validation; returns the audit tag of the first violation.
    ///
    /// Freshness (timestamp window) is part of this check; nonce dedup and
    /// signature verification need state and are the engine's job.
    pub fn validate(&self, now: u64) -> Result<(), &'static str> {
        match self.frame_type.as_str() {
            "" | TYPE_MSG | TYPE_ACK | TYPE_NACK | TYPE_BYE => {}
            _ => return Err(audit::INVALID_TYPE),
        }
        if self.frame_type == TYPE_BYE {
            return Ok(());
        }
        if self.id.len() > MAX_ID_LEN || self.ack.len() > MAX_ID_LEN {
            return Err(audit::INVALID_ID);
        }
        if (self.frame_type == TYPE_ACK || self.frame_type == TYPE_NACK) && self.ack.is_empty() {
            return Err(audit::INVALID_ID);
        }
        if !self.from.is_empty() && !patterns::is_entity(&self.from) {
            return Err(audit::INVALID_FROM);
        }
        if !self.to.is_empty() && !patterns::is_address(&self.to) {
            return Err(audit::INVALID_TO);
        }
        if self.is_msg() {
            if !patterns::is_constant(&self.service) {
                return Err(audit::INVALID_SERVICE);
            }
            if !patterns::is_constant(&self.event) {
                return Err(audit::INVALID_EVENT);
            }
            if self.id.is_empty() {
                return Err(audit::INVALID_ID);
            }
        }
        if self.nonce.is_empty() {
            return Err(audit::MESSAGE_REJECTED);
        }
        let skew = if now > self.timestamp {
            now - self.timestamp
        } else {
            self.timestamp - now
        };
        if skew > TIMESTAMP_WINDOW {
            return Err(audit::MESSAGE_REJECTED);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use util::unix_now;

    fn signed_headers(pair: &KeyPair, challenge: &[u8]) -> Headers {
        let mut headers = Headers {
            frame_type: TYPE_MSG.to_owned(),
            from: pair.pub_key().to_string(),
            to: pair.pub_key().to_string(),
            service: "friends".to_owned(),
            event: "invite".to_owned(),
            id: "m-1".to_owned(),
            timestamp: unix_now(),
            nonce: "n-1".to_owned(),
            ..Default::default()
        };
        headers.sign(pair, challenge, b"{\"name\":\"Bob\"}", b"");
        headers
    }

    #[test]
    fn signature_roundtrip() {
        let pair = KeyPair::generate();
        let challenge = [9u8; 32];
        let headers = signed_headers(&pair, &challenge);
        assert!(headers.verify(&challenge, b"{\"name\":\"Bob\"}", b""));
    }

    #[test]
    fn altered_header_fails_verification() {
        let pair = KeyPair::generate();
        let challenge = [9u8; 32];
        let mut headers = signed_headers(&pair, &challenge);
        headers.event = "uninvite".to_owned();
        assert!(!headers.verify(&challenge, b"{\"name\":\"Bob\"}", b""));
    }

    #[test]
    fn altered_content_fails_verification() {
        let pair = KeyPair::generate();
        let challenge = [9u8; 32];
        let headers = signed_headers(&pair, &challenge);
        assert!(!headers.verify(&challenge, b"{\"name\":\"Bub\"}", b""));
    }

    #[test]
    fn different_challenge_fails_verification() {
        let pair = KeyPair::generate();
        let headers = signed_headers(&pair, &[9u8; 32]);
        assert!(!headers.verify(&[10u8; 32], b"{\"name\":\"Bob\"}", b""));
    }

    #[test]
    fn timestamp_window_is_enforced() {
        let pair = KeyPair::generate();
        let now = unix_now();
        let mut headers = signed_headers(&pair, b"");
        headers.timestamp = now - TIMESTAMP_WINDOW + 5;
        assert!(headers.validate(now).is_ok());
        headers.timestamp = now - TIMESTAMP_WINDOW - 1;
        assert_eq!(headers.validate(now), Err(audit::MESSAGE_REJECTED));
        headers.timestamp = now + TIMESTAMP_WINDOW + 1;
        assert_eq!(headers.validate(now), Err(audit::MESSAGE_REJECTED));
    }

    #[test]
    fn validation_catches_field_violations() {
        let now = unix_now();
        let pair = KeyPair::generate();
        let good = signed_headers(&pair, b"");

        let mut h = good.clone();
        h.frame_type = "hello".to_owned();
        assert_eq!(h.validate(now), Err(audit::INVALID_TYPE));

        let mut h = good.clone();
        h.id = "x".repeat(MAX_ID_LEN + 1);
        assert_eq!(h.validate(now), Err(audit::INVALID_ID));

        let mut h = good.clone();
        h.from = "not an entity".to_owned();
        assert_eq!(h.validate(now), Err(audit::INVALID_FROM));

        let mut h = good.clone();
        h.to = "abc".to_owned();
        assert_eq!(h.validate(now), Err(audit::INVALID_TO));

        let mut h = good.clone();
        h.service = "Friends".to_owned();
        assert_eq!(h.validate(now), Err(audit::INVALID_SERVICE));

        let mut h = good.clone();
        h.event = String::new();
        assert_eq!(h.validate(now), Err(audit::INVALID_EVENT));

        let mut h = good;
        h.nonce = String::new();
        assert_eq!(h.validate(now), Err(audit::MESSAGE_REJECTED));
    }

    #[test]
    fn ack_requires_ack_id() {
        let now = unix_now();
        let mut h = Headers {
            frame_type: TYPE_ACK.to_owned(),
            timestamp: now,
            nonce: "n".to_owned(),
            ..Default::default()
        };
        assert_eq!(h.validate(now), Err(audit::INVALID_ID));
        h.ack = "m-1".to_owned();
        assert!(h.validate(now).is_ok());
    }

    #[test]
    fn bye_frames_skip_field_checks() {
        assert!(Headers::bye().validate(unix_now()).is_ok());
    }

    #[test]
    fn anonymous_msg_validates_without_from() {
        let now = unix_now();
        let h = Headers {
            service: "directory".to_owned(),
            event: "request".to_owned(),
            id: "m-2".to_owned(),
            timestamp: now,
            nonce: "n-2".to_owned(),
            ..Default::default()
        };
        assert!(h.validate(now).is_ok());
    }
}
