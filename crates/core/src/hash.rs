//! Change-detection hashing.
//!
//! Per-want hashes are SHA-256 over canonical JSON and double as cheap ETags;
//! whole-snapshot and global-state files are guarded by an MD5 digest so
//! unchanged content is never rewritten.

use md5::Md5;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

/// SHA-256 over the deterministic JSON of `{metadata, spec, status, state}`.
/// `serde_json` object keys are ordered, so equal values always serialize
/// identically.
pub fn want_hash(metadata: &Value, spec: &Value, status: &Value, state: &Value) -> String {
    let doc = serde_json::json!({
        "metadata": metadata,
        "spec": spec,
        "status": status,
        "state": state,
    });
    sha256_hex(doc.to_string().as_bytes())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
