//! Path helpers and platform-safe workspace comparison
//!
//! Workspace filters compare paths recorded by different host platforms, so
//! a byte-wise comparison misses almost every real match: Windows records
//! `C:\Users\...` while the filter says `c:/users/...`, and macOS stores
//! decomposed accents. Normalization here is NFC → case fold → slash
//! canonicalization → drive-letter lowercasing.

use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use unicode_normalization::UnicodeNormalization;

/// Create a directory and all parents, tolerating concurrent creation.
pub fn ensure_dir_all(path: &Utf8Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create directory: {path}"))
}

/// Normalize a workspace path string for comparison.
///
/// - Unicode NFC normalization, then lower-casing
/// - backslashes canonicalized to forward slashes
/// - a leading `X:` drive letter lower-cased (covered by the case fold)
/// - trailing slashes trimmed
#[must_use]
pub fn normalize_workspace_path(raw: &str) -> String {
    let nfc: String = raw.nfc().collect();
    let lowered = nfc.to_lowercase();
    let slashed = lowered.replace('\\', "/");
    let trimmed = slashed.trim_end_matches('/');
    trimmed.to_string()
}

/// Workspace filter match: the normalized candidate matches when it contains
/// the normalized filter. `contains` rather than equality admits
/// subdirectories of the filtered workspace.
#[must_use]
pub fn workspace_matches(candidate: &str, filter: &str) -> bool {
    let candidate = normalize_workspace_path(candidate);
    let filter = normalize_workspace_path(filter);
    if filter.is_empty() {
        return true;
    }
    candidate.contains(&filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_backslashes() {
        assert_eq!(
            normalize_workspace_path(r"C:\Users\dev\project"),
            "c:/users/dev/project"
        );
    }

    #[test]
    fn test_normalize_drive_letter_lowercased() {
        assert_eq!(normalize_workspace_path("D:/Work"), "d:/work");
    }

    #[test]
    fn test_normalize_trailing_slash_trimmed() {
        assert_eq!(normalize_workspace_path("/home/dev/"), "/home/dev");
    }

    #[test]
    fn test_normalize_nfc() {
        // "é" as e + combining accent vs precomposed
        let decomposed = "caf\u{0065}\u{0301}";
        let precomposed = "caf\u{00E9}";
        assert_eq!(
            normalize_workspace_path(decomposed),
            normalize_workspace_path(precomposed)
        );
    }

    #[test]
    fn test_workspace_matches_subdirectory() {
        assert!(workspace_matches(
            r"C:\Users\dev\project\sub\dir",
            "c:/users/dev/project"
        ));
    }

    #[test]
    fn test_workspace_matches_case_insensitive() {
        assert!(workspace_matches("/Home/Dev/Project", "/home/dev/project"));
    }

    #[test]
    fn test_workspace_no_match() {
        assert!(!workspace_matches("/home/dev/other", "/home/dev/project"));
    }

    #[test]
    fn test_workspace_empty_filter_matches_all() {
        assert!(workspace_matches("/anything", ""));
    }

    #[test]
    fn test_ensure_dir_all_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path =
            camino::Utf8PathBuf::from_path_buf(tmp.path().join("a/b/c")).unwrap();
        ensure_dir_all(&path).unwrap();
        ensure_dir_all(&path).unwrap();
        assert!(path.is_dir());
    }
}
