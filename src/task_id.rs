//! Task ID validation
//!
//! Task identifiers are the primary key for every conversation archive. The
//! host extension names task folders with version-4 UUID strings, so
//! anything that does not match that shape is rejected before it can become
//! a directory name or a parent link.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use taskloom_utils::error::{ErrorCategory, UserFriendlyError};

// 8-4-4-4-12 hex, version nibble fixed at 4, variant nibble in [89ab].
static TASK_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("task id regex is valid")
});

/// Error type for task ID validation failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskIdError {
    #[error("Invalid task ID: '{0}' is not a version-4 UUID string")]
    InvalidTaskId(String),
}

impl UserFriendlyError for TaskIdError {
    fn user_message(&self) -> String {
        match self {
            Self::InvalidTaskId(raw) => {
                format!("'{raw}' is not a valid task identifier")
            }
        }
    }

    fn context(&self) -> Option<String> {
        Some(
            "Task identifiers are 36-character version-4 UUID strings in 8-4-4-4-12 form, \
             as produced by the host extension for task folder names."
                .to_string(),
        )
    }

    fn suggestions(&self) -> Vec<String> {
        vec![
            "Check that the value was copied from a task folder name".to_string(),
            "Example: 3f2b8c1a-9d4e-4f6a-8b2c-1d3e5f7a9b0c".to_string(),
        ]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Input
    }
}

/// An opaque, validated task identifier.
///
/// Stored lower-cased; comparison and hashing are case-sensitive on the
/// stored form, so two spellings of the same UUID are equal after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Parse and validate a task identifier.
    ///
    /// # Errors
    ///
    /// `InvalidTaskId` when the input does not have the version-4 UUID shape.
    pub fn parse(raw: &str) -> Result<Self, TaskIdError> {
        let lowered = raw.to_lowercase();
        if TASK_ID_RE.is_match(&lowered) {
            Ok(Self(lowered))
        } else {
            Err(TaskIdError::InvalidTaskId(raw.to_string()))
        }
    }

    /// Whether a string has the task-id shape, without allocating an id.
    #[must_use]
    pub fn is_valid(raw: &str) -> bool {
        TASK_ID_RE.is_match(&raw.to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First segment of the id, used in rendered views where the full UUID
    /// is noise.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
