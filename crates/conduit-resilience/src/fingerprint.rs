//! Cache keys for chat requests.
//!
//! # Format (v1)
//!
//! ```text
//! v1:<hex sha256 of canonical JSON>
//!
//! {"capabilities":<signature>,"model":<model>,"read_only":<bool>,"text":<normalized>,"v":1}
//! ```
//!
//! Keys are serialized from a `BTreeMap`, so field order is fixed. The text
//! is normalized first: trimmed, internal whitespace runs collapsed to one
//! space, lowercased. Any change to these inputs or to normalization must bump
//! the version prefix.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// Version tag embedded in every fingerprint.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Deterministic cache key for a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a request from its semantically relevant inputs.
    pub fn compute(text: &str, read_only: bool, capabilities: &str, model: &str) -> Self {
        let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
        fields.insert("v", json!(FINGERPRINT_VERSION));
        fields.insert("text", json!(normalize(text)));
        fields.insert("read_only", json!(read_only));
        fields.insert("capabilities", json!(capabilities));
        fields.insert("model", json!(model));

        // A map of plain JSON values always serializes.
        let canonical = serde_json::to_string(&fields).unwrap_or_default();
        Self(format!("v{}:{}", FINGERPRINT_VERSION, sha256_hex(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Normalize request text for fingerprinting and cache labels.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Hello   \t World\n"), "hello world");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_format() {
        let fp = Fingerprint::compute("hi", false, "sig", "llama3");
        let s = fp.as_str();
        assert!(s.starts_with("v1:"));
        assert_eq!(s.len(), 3 + 64);
        assert!(s[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_canonical_json_digest() {
        let expected = sha256_hex(
            br#"{"capabilities":"sig","model":"m","read_only":true,"text":"hi there","v":1}"#,
        );
        let fp = Fingerprint::compute("  HI   there ", true, "sig", "m");
        assert_eq!(fp.as_str(), format!("v1:{expected}"));
    }

    #[test]
    fn test_equivalent_text_same_fingerprint() {
        let a = Fingerprint::compute("List  tools", false, "sig", "m");
        let b = Fingerprint::compute("list tools ", false, "sig", "m");
        assert_eq!(a, b);
    }

    #[test]
    fn test_each_input_changes_fingerprint() {
        let base = Fingerprint::compute("q", false, "sig", "m");
        assert_ne!(base, Fingerprint::compute("q2", false, "sig", "m"));
        assert_ne!(base, Fingerprint::compute("q", true, "sig", "m"));
        assert_ne!(base, Fingerprint::compute("q", false, "other", "m"));
        assert_ne!(base, Fingerprint::compute("q", false, "sig", "m2"));
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
