//! Canonical JSON emission and sha256 hashing
//!
//! Commit-log entry hashes and source-file checksums both go through this
//! module. Hash inputs are JCS-canonical JSON (RFC 8785) so that key order
//! in the source struct never changes a digest.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Emit a value as JCS-canonical JSON (RFC 8785).
///
/// This is the standard way to serialize anything whose bytes participate
/// in a hash: commit-entry hash inputs, consistency checks, and state
/// snapshots that must compare byte-for-byte across machines.
pub fn emit_jcs<T: Serialize>(value: &T) -> Result<String> {
    let json_value =
        serde_json::to_value(value).with_context(|| "Failed to serialize value to JSON")?;
    let json_bytes = serde_json_canonicalizer::to_vec(&json_value)
        .with_context(|| "Failed to canonicalize JSON using JCS")?;
    String::from_utf8(json_bytes).with_context(|| "JCS output contained invalid UTF-8")
}

/// Hex-encoded sha256 of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Hex-encoded sha256 of a value's JCS-canonical JSON.
pub fn sha256_jcs<T: Serialize>(value: &T) -> Result<String> {
    let canonical = emit_jcs(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
