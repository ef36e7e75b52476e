//! Canonical JSON used by both the sign and verify paths.
//!
//! Canonical form: UTF-8, object keys sorted, no whitespace between tokens,
//! no trailing newline. Any two serializations of the same value are
//! byte-identical, so detached signatures and content hashes are stable.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash-chain pointer of the first bundle for a site.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize `value` into canonical JSON bytes.
///
/// Routed through `serde_json::Value` so that nested objects land in the
/// default `serde_json::Map`, which keeps keys sorted.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// Hex-encoded SHA-256 of raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Canonicalize `value` and hash the result.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(content_hash(&to_canonical_json(value)?))
}
