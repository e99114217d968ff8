//! Named validation patterns for wire input and identity attributes.
//!
//! Everything that crosses the wire or ends up in a primary key is matched
//! against one of these before use.

use once_cell::sync::Lazy;
use regex::Regex;

/// Entity id: base58-check of an Ed25519 public key, 49 to 51 characters.
static ENTITY: Lazy<Regex> = Lazy::new(|| Regex::new("^[1-9A-HJ-NP-Za-km-z]{49,51}$").unwrap());

/// Fingerprint: 9 characters of base58.
static FINGERPRINT: Lazy<Regex> = Lazy::new(|| Regex::new("^[1-9A-HJ-NP-Za-km-z]{9}$").unwrap());

/// Constant: service/event names and tags, 1 to 100 chars of `[0-9a-z-/]`.
static CONSTANT: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-z/-]{1,100}$").unwrap());

/// Free-form names: 1 to 100 chars, no control characters.
static NAME: Lazy<Regex> = Lazy::new(|| Regex::new("^[^\\p{Cc}]{1,100}$").unwrap());

pub fn is_entity(s: &str) -> bool {
    ENTITY.is_match(s)
}

pub fn is_fingerprint(s: &str) -> bool {
    FINGERPRINT.is_match(s)
}

/// Entity id or fingerprint, the two accepted recipient address forms.
pub fn is_address(s: &str) -> bool {
    is_entity(s) || is_fingerprint(s)
}

pub fn is_constant(s: &str) -> bool {
    CONSTANT.is_match(s)
}

pub fn is_name(s: &str) -> bool {
    NAME.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants() {
        assert!(is_constant("friends"));
        assert!(is_constant("messages/1"));
        assert!(is_constant("a"));
        assert!(!is_constant(""));
        assert!(!is_constant("Friends"));
        assert!(!is_constant("with space"));
        assert!(!is_constant(&"x".repeat(101)));
    }

    #[test]
    fn fingerprints() {
        assert!(is_fingerprint("2u5eW2BQk"));
        assert!(!is_fingerprint("2u5eW2BQ"));
        assert!(!is_fingerprint("2u5eW2BQk3"));
        // 0, O, I and l are not base58
        assert!(!is_fingerprint("0u5eW2BQk"));
    }

    #[test]
    fn entities() {
        for len in [49usize, 50, 51] {
            let id = "4".repeat(len);
            assert!(is_entity(&id), "length {} did not match", len);
            assert!(is_address(&id));
        }
        assert!(!is_entity(&"4".repeat(48)));
        assert!(!is_entity(&"4".repeat(52)));
        assert!(!is_entity(&"O".repeat(50)));
        assert!(!is_entity("too-short"));
    }

    #[test]
    fn names() {
        assert!(is_name("Alice Example"));
        assert!(!is_name(""));
        assert!(!is_name("line\nbreak"));
    }
}
