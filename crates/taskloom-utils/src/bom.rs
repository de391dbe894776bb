//! UTF-8 BOM handling for archive reads
//!
//! Host IDE extensions write some JSON artifacts with a UTF-8 byte order
//! mark. BOMs are stripped on every input path and never emitted on output.

/// The UTF-8 byte order mark.
pub const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Strip a leading UTF-8 BOM from a byte slice, if present.
#[must_use]
pub fn strip_bom_bytes(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

/// Strip a leading BOM from an in-memory string, if present.
///
/// Side-effect free; useful before handing embedded JSON fragments to
/// `serde_json::from_str`.
#[must_use]
pub fn strip_bom_str(s: &str) -> &str {
    s.strip_prefix('\u{FEFF}').unwrap_or(s)
}
