// hasher.rs — SHA-256 hashing utilities.
//
// All hashes are SHA-256, encoded as 64-character lowercase hex.

use sha2::{Digest, Sha256};

/// Hash arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash a UTF-8 string, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash a JSON document in its compact serialized form.
///
/// Request inputs are recorded this way so the log proves what was
/// decided on without holding tool arguments in cleartext.
pub fn hash_json(value: &serde_json::Value) -> String {
    hash_str(&value.to_string())
}
