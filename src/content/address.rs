//! Content addressing
//!
//! Deterministic CID-style identifiers over canonicalized records. Any peer
//! can recompute the digest and detect corruption or tampering in transit
//! without trusting the sender.

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;

/// Multicodec code for raw binary payloads.
const RAW_CODEC: u64 = 0x55;

/// Compute the content digest of a record.
///
/// The record is serialized to JSON with its `contentHash` and `signature`
/// fields blanked (those fields did not exist at hash-computation time).
/// serde_json keeps object keys sorted, so the byte stream is canonical
/// regardless of struct field order. The digest is SHA-256 wrapped as a
/// CIDv1, rendered in its base32 string form (the human-inspectable `b…`
/// prefix).
pub fn content_hash<T: Serialize>(record: &T) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(record)?;
    blank_integrity_fields(&mut value);
    let canonical = serde_json::to_string(&value)?;
    let digest = Code::Sha2_256.digest(canonical.as_bytes());
    Ok(Cid::new_v1(RAW_CODEC, digest).to_string())
}

/// Check a record against its claimed digest.
///
/// An empty claim means "no claim to verify" and passes: records created
/// before content-addressing was introduced, and anonymous/unsigned items,
/// stay admissible.
pub fn verify_content_hash<T: Serialize>(record: &T, claimed: &str) -> bool {
    if claimed.is_empty() {
        return true;
    }
    match content_hash(record) {
        Ok(digest) => digest == claimed,
        Err(_) => false,
    }
}

fn blank_integrity_fields(value: &mut serde_json::Value) {
    if let Some(map) = value.as_object_mut() {
        for key in ["contentHash", "signature"] {
            if let Some(slot) = map.get_mut(key) {
                *slot = serde_json::Value::String(String::new());
            }
        }
    }
}
