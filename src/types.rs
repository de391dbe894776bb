//! Core data model for conversation skeletons
//!
//! A skeleton is the compact, persisted summary of one task: enough to
//! navigate, render, and re-derive the parent/child hierarchy without
//! re-reading raw logs. The serde attributes here define the on-disk
//! `.skeletons/<task-id>.json` schema, so field renames are format changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::task_id::TaskId;

/// Role of a conversation message inside the sequence digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Kind of a recorded action inside the sequence digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Tool,
    Command,
}

/// One ordered element of a task's message/action sequence.
///
/// Tool arguments are deliberately omitted from the digest; only the shape
/// of the action survives (name, status, touched file, sizes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceItem {
    Message {
        role: MessageRole,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Action {
        #[serde(rename = "type")]
        kind: ActionKind,
        name: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line_count: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_size: Option<u64>,
    },
}

impl SequenceItem {
    #[must_use]
    pub fn message(role: MessageRole, content: impl Into<String>) -> Self {
        Self::Message {
            role,
            content: content.into(),
        }
    }

    #[must_use]
    pub const fn is_message(&self) -> bool {
        matches!(self, Self::Message { .. })
    }

    #[must_use]
    pub const fn is_action(&self) -> bool {
        matches!(self, Self::Action { .. })
    }
}

/// Descriptive metadata for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkeletonMetadata {
    pub title: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub message_count: usize,
    pub action_count: usize,
    /// Summed size in bytes of the task's source files
    pub total_size: u64,
    pub workspace: Option<String>,
    /// Storage location this task was read from
    pub data_source: String,
}

impl Default for SkeletonMetadata {
    fn default() -> Self {
        Self {
            title: "(untitled)".to_string(),
            created_at: None,
            last_activity: None,
            message_count: 0,
            action_count: 0,
            total_size: 0,
            workspace: None,
            data_source: String::new(),
        }
    }
}

/// Per-skeleton record of how far the reconstruction engine got.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    pub phase1_completed: bool,
    pub phase2_completed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Compact, persisted summary of one conversation/task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSkeleton {
    pub task_id: TaskId,
    /// Authoritative parent link after reconstruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    /// Link produced by the engine; may differ from a stale stored value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconstructed_parent_id: Option<TaskId>,
    /// Initial user instruction, truncated to at most 200 characters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_instruction: Option<String>,
    /// Normalized launch-instruction prefixes this task emitted for children
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_task_instruction_prefixes: Vec<String>,
    pub metadata: SkeletonMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<SequenceItem>,
    pub is_completed: bool,
    #[serde(default)]
    pub processing_state: ProcessingState,
    /// filename → sha256, the change-detection inputs for incremental refresh
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_file_checksums: BTreeMap<String, String>,
}

impl ConversationSkeleton {
    /// A skeleton with identity and metadata only, before extraction runs.
    #[must_use]
    pub fn bare(task_id: TaskId, data_source: impl Into<String>) -> Self {
        Self {
            task_id,
            parent_task_id: None,
            reconstructed_parent_id: None,
            truncated_instruction: None,
            child_task_instruction_prefixes: Vec::new(),
            metadata: SkeletonMetadata {
                data_source: data_source.into(),
                ..SkeletonMetadata::default()
            },
            sequence: Vec::new(),
            is_completed: false,
            processing_state: ProcessingState::default(),
            source_file_checksums: BTreeMap::new(),
        }
    }

    /// The effective parent link: reconstruction wins over a stored value.
    #[must_use]
    pub fn effective_parent(&self) -> Option<&TaskId> {
        self.reconstructed_parent_id
            .as_ref()
            .or(self.parent_task_id.as_ref())
    }

    /// Record a processing error without aborting the task.
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.processing_state.errors.push(error.into());
    }
}
