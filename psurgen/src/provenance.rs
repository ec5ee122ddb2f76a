//! provenance.rs: canonical hashing primitives.
//!
//! Every content hash in the system is SHA-256 over the JCS (RFC 8785)
//! canonical JSON form of a value, so hashes are stable under key reordering
//! and serializer differences. Byte buffers hash over the raw bytes.

use anyhow::{anyhow, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of raw bytes, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Canonical JSON (JCS) bytes for any serializable value.
///
/// Object keys are sorted lexicographically at every depth, arrays keep
/// insertion order, and numbers use the shortest unambiguous decimal form.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_jcs::to_vec(value).map_err(|err| anyhow!("failed to canonicalize JSON: {err}"))
}

/// Content hash of a serializable value: SHA-256 over its canonical JSON.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_json(value)?))
}

/// Fold an ordered list of hex hashes into a Merkle root.
///
/// Adjacent hashes are paired and hashed over the concatenation of their hex
/// strings; an odd-length level duplicates its last element. The empty list
/// hashes to SHA-256 of the empty string, a singleton is its own root.
pub fn merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return sha256_hex(b"");
    }
    let mut level: Vec<String> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1].clone());
        }
        level = level
            .chunks(2)
            .map(|pair| sha256_hex(format!("{}{}", pair[0], pair[1]).as_bytes()))
            .collect();
    }
    level.remove(0)
}
