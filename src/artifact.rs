//! Artifact reading for per-task archive folders
//!
//! A task folder holds up to four classes of JSON artifact: the metadata
//! descriptor, the UI-message log, the API-message log, and skeleton cache
//! shards. Host extensions write some of these with a UTF-8 BOM, so every
//! read strips a leading BOM, decodes strict UTF-8, and parses JSON
//! strictly. A malformed file surfaces a structured error; the reader never
//! substitutes defaults.

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;

use taskloom_utils::bom::strip_bom_bytes;
use taskloom_utils::error::{ErrorCategory, UserFriendlyError};

use crate::task_id::TaskId;

/// Filename of the per-task metadata descriptor.
pub const TASK_METADATA_FILE: &str = "task_metadata.json";
/// Filename of the ordered UI-message log.
pub const UI_MESSAGES_FILE: &str = "ui_messages.json";
/// Filename of the optional API-message log.
pub const API_HISTORY_FILE: &str = "api_conversation_history.json";
/// Directory of skeleton cache shards, adjacent to the task folders.
pub const SKELETON_DIR: &str = ".skeletons";

/// Failure kinds for artifact reads.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact not found: {path}")]
    NotFound { path: Utf8PathBuf },

    #[error("Permission denied reading artifact: {path}")]
    PermissionDenied { path: Utf8PathBuf },

    #[error("Malformed JSON in {path}: {reason}")]
    MalformedJson { path: Utf8PathBuf, reason: String },

    #[error("Artifact is not valid UTF-8: {path}: {reason}")]
    EncodingError { path: Utf8PathBuf, reason: String },

    #[error("IO error reading artifact {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArtifactError {
    fn from_io(path: &Utf8Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_owned(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_owned(),
            },
            _ => Self::Io {
                path: path.to_owned(),
                source,
            },
        }
    }
}

impl UserFriendlyError for ArtifactError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::MalformedJson { .. } => Some(
                "The host extension wrote a JSON artifact this analyzer cannot parse. \
                 The task is skipped; other tasks are unaffected."
                    .to_string(),
            ),
            Self::EncodingError { .. } => Some(
                "Artifacts must be UTF-8 (a leading byte order mark is tolerated).".to_string(),
            ),
            _ => None,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Input
    }
}

/// One record of the UI-message log. Unknown fields are ignored; the host
/// format carries many more than the analyzer consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub say: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Milliseconds since the UNIX epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

/// Host-defined task metadata descriptor. Every field is optional; absence
/// of the file itself is also tolerated by the skeleton builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadataFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// One record of the API-message log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub role: String,
    /// Content is either a plain string or a structured block list; kept raw
    /// and flattened on demand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
}

impl ApiMessage {
    /// Flatten structured content blocks into one text blob.
    #[must_use]
    pub fn text(&self) -> String {
        match &self.content {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

/// Read and strictly parse a JSON artifact, tolerating a leading UTF-8 BOM.
pub fn read_json_artifact<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, ArtifactError> {
    let bytes = fs::read(path.as_std_path()).map_err(|e| ArtifactError::from_io(path, e))?;
    parse_json_bytes(path, &bytes)
}

/// Strictly parse BOM-prefixed JSON bytes belonging to `path`.
pub fn parse_json_bytes<T: DeserializeOwned>(
    path: &Utf8Path,
    bytes: &[u8],
) -> Result<T, ArtifactError> {
    let stripped = strip_bom_bytes(bytes);
    let text = std::str::from_utf8(stripped).map_err(|e| ArtifactError::EncodingError {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(text).map_err(|e| ArtifactError::MalformedJson {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

/// A task folder on disk: the unit the skeleton builder consumes.
#[derive(Debug, Clone)]
pub struct TaskFolder {
    pub task_id: TaskId,
    pub path: Utf8PathBuf,
}

impl TaskFolder {
    #[must_use]
    pub fn new(task_id: TaskId, path: Utf8PathBuf) -> Self {
        Self { task_id, path }
    }

    #[must_use]
    pub fn ui_messages_path(&self) -> Utf8PathBuf {
        self.path.join(UI_MESSAGES_FILE)
    }

    #[must_use]
    pub fn api_history_path(&self) -> Utf8PathBuf {
        self.path.join(API_HISTORY_FILE)
    }

    #[must_use]
    pub fn metadata_path(&self) -> Utf8PathBuf {
        self.path.join(TASK_METADATA_FILE)
    }

    /// Parse the UI-message log. Absence is an error: a task folder without
    /// its message log cannot be summarized.
    pub fn read_ui_messages(&self) -> Result<Vec<UiMessage>, ArtifactError> {
        read_json_artifact(&self.ui_messages_path())
    }

    /// Parse the optional API-message log; `None` when the file is absent.
    pub fn read_api_history(&self) -> Result<Option<Vec<ApiMessage>>, ArtifactError> {
        match read_json_artifact(&self.api_history_path()) {
            Ok(messages) => Ok(Some(messages)),
            Err(ArtifactError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Parse the optional metadata descriptor; `None` when absent.
    pub fn read_metadata(&self) -> Result<Option<TaskMetadataFile>, ArtifactError> {
        match read_json_artifact(&self.metadata_path()) {
            Ok(meta) => Ok(Some(meta)),
            Err(ArtifactError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Raw bytes of one source file, for checksumming. BOM is NOT stripped
    /// here: checksums are change detection over the file as stored.
    pub fn read_raw(&self, filename: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path.join(filename);
        fs::read(path.as_std_path()).map_err(|e| ArtifactError::from_io(&path, e))
    }

    /// Filenames of the source files that exist for this task, in a fixed
    /// order, paired with their sizes.
    #[must_use]
    pub fn source_files(&self) -> Vec<(String, u64)> {
        [TASK_METADATA_FILE, UI_MESSAGES_FILE, API_HISTORY_FILE]
            .iter()
            .filter_map(|name| {
                let path = self.path.join(name);
                fs::metadata(path.as_std_path())
                    .ok()
                    .map(|m| ((*name).to_string(), m.len()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TASK: &str = "3f2b8c1a-9d4e-4f6a-8b2c-1d3e5f7a9b0c";

    fn folder(dir: &TempDir) -> TaskFolder {
        let path = Utf8PathBuf::from_path_buf(dir.path().join(TASK)).unwrap();
        fs::create_dir_all(path.as_std_path()).unwrap();
        TaskFolder::new(TaskId::parse(TASK).unwrap(), path)
    }

    #[test]
    fn test_read_ui_messages_with_bom() {
        let dir = TempDir::new().unwrap();
        let folder = folder(&dir);

        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(br#"[{"type":"say","say":"text","text":"hello","ts":1000}]"#);
        fs::write(folder.ui_messages_path().as_std_path(), &bytes).unwrap();

        let messages = folder.read_ui_messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, "say");
        assert_eq!(messages[0].text.as_deref(), Some("hello"));
        assert_eq!(messages[0].ts, Some(1000));
    }

    #[test]
    fn test_missing_ui_messages_is_not_found() {
        let dir = TempDir::new().unwrap();
        let folder = folder(&dir);

        let err = folder.read_ui_messages().unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound { .. }));
    }

    #[test]
    fn test_malformed_json_surfaces_structured_error() {
        let dir = TempDir::new().unwrap();
        let folder = folder(&dir);
        fs::write(folder.ui_messages_path().as_std_path(), b"[{not json").unwrap();

        let err = folder.read_ui_messages().unwrap_err();
        match err {
            ArtifactError::MalformedJson { path, reason } => {
                assert!(path.as_str().ends_with(UI_MESSAGES_FILE));
                assert!(!reason.is_empty());
            }
            other => panic!("expected MalformedJson, got: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_utf8_is_encoding_error() {
        let dir = TempDir::new().unwrap();
        let folder = folder(&dir);
        fs::write(folder.ui_messages_path().as_std_path(), [0xFF, 0xFE, 0x00]).unwrap();

        let err = folder.read_ui_messages().unwrap_err();
        assert!(matches!(err, ArtifactError::EncodingError { .. }));
    }

    #[test]
    fn test_optional_files_absent_are_none() {
        let dir = TempDir::new().unwrap();
        let folder = folder(&dir);

        assert!(folder.read_api_history().unwrap().is_none());
        assert!(folder.read_metadata().unwrap().is_none());
    }

    #[test]
    fn test_metadata_tolerates_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let folder = folder(&dir);
        fs::write(
            folder.metadata_path().as_std_path(),
            br#"{"title":"t","workspace":"/w","hostInternal":{"x":1}}"#,
        )
        .unwrap();

        let meta = folder.read_metadata().unwrap().unwrap();
        assert_eq!(meta.title.as_deref(), Some("t"));
        assert_eq!(meta.workspace.as_deref(), Some("/w"));
    }

    #[test]
    fn test_api_message_text_flattens_blocks() {
        let message = ApiMessage {
            role: "assistant".to_string(),
            content: Some(serde_json::json!([
                {"type": "text", "text": "part one"},
                {"type": "tool_use", "name": "ignored"},
                {"type": "text", "text": "part two"},
            ])),
        };
        assert_eq!(message.text(), "part one\npart two");
    }

    #[test]
    fn test_api_message_text_plain_string() {
        let message = ApiMessage {
            role: "user".to_string(),
            content: Some(serde_json::json!("just text")),
        };
        assert_eq!(message.text(), "just text");
    }

    #[test]
    fn test_source_files_reports_present_only() {
        let dir = TempDir::new().unwrap();
        let folder = folder(&dir);
        fs::write(folder.ui_messages_path().as_std_path(), b"[]").unwrap();

        let files = folder.source_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, UI_MESSAGES_FILE);
        assert_eq!(files[0].1, 2);
    }

    #[test]
    fn test_cjk_and_emoji_content_preserved() {
        let dir = TempDir::new().unwrap();
        let folder = folder(&dir);
        fs::write(
            folder.ui_messages_path().as_std_path(),
            r#"[{"type":"say","say":"text","text":"日本語 🚀 café"}]"#.as_bytes(),
        )
        .unwrap();

        let messages = folder.read_ui_messages().unwrap();
        assert_eq!(messages[0].text.as_deref(), Some("日本語 🚀 café"));
    }
}
