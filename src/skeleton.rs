//! Skeleton construction from a task folder
//!
//! The builder runs the artifact reader, instruction extractor, and
//! child-instruction indexer over one task folder and digests the result
//! into a [`ConversationSkeleton`]. Extraction failures populate the
//! skeleton's error list; identity and metadata survive so one corrupt task
//! never aborts a batch.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use taskloom_utils::canonical::sha256_hex;

use crate::artifact::{TaskFolder, UiMessage};
use crate::instruction::{extract_initial_instruction, truncate_chars};
use crate::index::extract_child_prefixes;
use crate::types::{ActionKind, ConversationSkeleton, MessageRole, SequenceItem};

/// Tool payload carried by `say == "tool"` records. Host-defined; every
/// field optional.
#[derive(Debug, Default, Deserialize)]
struct ToolPayload {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "lineCount")]
    line_count: Option<usize>,
    #[serde(default)]
    status: Option<String>,
}

/// Build the skeleton for one task folder.
///
/// Always returns a skeleton: read failures for individual artifacts are
/// recorded in `processing_state.errors` and the remaining inputs are still
/// digested. The result has `phase1_completed` set and no reconstructed
/// parent; Phase 2 of the engine fills that in.
#[must_use]
pub fn build_skeleton(folder: &TaskFolder, storage_root: &Utf8Path) -> ConversationSkeleton {
    let mut skeleton = ConversationSkeleton::bare(folder.task_id.clone(), storage_root.as_str());

    let source_files = folder.source_files();
    skeleton.metadata.total_size = source_files.iter().map(|(_, size)| size).sum();

    for (name, _) in &source_files {
        match folder.read_raw(name) {
            Ok(bytes) => {
                skeleton
                    .source_file_checksums
                    .insert(name.clone(), sha256_hex(&bytes));
            }
            Err(e) => skeleton.push_error(format!("checksum failed: {e}")),
        }
    }

    match folder.read_metadata() {
        Ok(Some(meta)) => {
            skeleton.metadata.workspace = meta.workspace;
            if let Some(title) = meta.title {
                skeleton.metadata.title = title;
            }
        }
        Ok(None) => {}
        Err(e) => skeleton.push_error(e.to_string()),
    }

    let api_messages = match folder.read_api_history() {
        Ok(api) => api,
        Err(e) => {
            skeleton.push_error(e.to_string());
            None
        }
    };

    match folder.read_ui_messages() {
        Ok(ui_messages) => {
            skeleton.truncated_instruction = extract_initial_instruction(&ui_messages);
            skeleton.child_task_instruction_prefixes =
                extract_child_prefixes(&ui_messages, api_messages.as_deref());
            digest_sequence(&ui_messages, &mut skeleton);
        }
        Err(e) => skeleton.push_error(e.to_string()),
    }

    if let Some(instruction) = &skeleton.truncated_instruction {
        skeleton.metadata.title = instruction.clone();
    }

    skeleton.processing_state.phase1_completed = true;
    skeleton
}

/// Fold the UI-message log into the order-preserving sequence digest,
/// message/action counts, timestamps, and the completion flag.
fn digest_sequence(ui_messages: &[UiMessage], skeleton: &mut ConversationSkeleton) {
    let mut first_text_seen = false;

    for message in ui_messages {
        if let Some(ts) = message.ts.and_then(DateTime::<Utc>::from_timestamp_millis) {
            if skeleton.metadata.created_at.is_none() {
                skeleton.metadata.created_at = Some(ts);
            }
            if skeleton.metadata.last_activity.is_none_or(|last| ts > last) {
                skeleton.metadata.last_activity = Some(ts);
            }
        }

        match message.say.as_deref() {
            Some("text") => {
                let Some(text) = message.text.as_deref().filter(|t| !t.trim().is_empty()) else {
                    continue;
                };
                // First visible text record is the user's instruction; the
                // rest of the transcript is the assistant talking.
                let role = if first_text_seen {
                    MessageRole::Assistant
                } else {
                    first_text_seen = true;
                    MessageRole::User
                };
                skeleton.sequence.push(SequenceItem::message(role, text));
            }
            Some("completion_result") => {
                skeleton.is_completed = true;
                if let Some(text) = message.text.as_deref().filter(|t| !t.trim().is_empty()) {
                    skeleton
                        .sequence
                        .push(SequenceItem::message(MessageRole::Assistant, text));
                }
            }
            Some("tool") => skeleton.sequence.push(tool_action(message)),
            Some("command") => {
                let name = message
                    .text
                    .as_deref()
                    .map(|t| truncate_chars(t.lines().next().unwrap_or(""), 200))
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "command".to_string());
                skeleton.sequence.push(SequenceItem::Action {
                    kind: ActionKind::Command,
                    name,
                    status: "completed".to_string(),
                    file_path: None,
                    line_count: None,
                    content_size: None,
                });
            }
            _ => {}
        }
    }

    skeleton.metadata.message_count = skeleton.sequence.iter().filter(|i| i.is_message()).count();
    skeleton.metadata.action_count = skeleton.sequence.iter().filter(|i| i.is_action()).count();
}

/// Digest a `say == "tool"` record. Tool arguments are dropped; only name,
/// status, and touched-file shape survive.
fn tool_action(message: &UiMessage) -> SequenceItem {
    let payload: ToolPayload = message
        .text
        .as_deref()
        .and_then(|t| serde_json::from_str(t).ok())
        .unwrap_or_default();

    SequenceItem::Action {
        kind: ActionKind::Tool,
        name: payload.tool.unwrap_or_else(|| "tool".to_string()),
        status: payload.status.unwrap_or_else(|| "completed".to_string()),
        file_path: payload.path,
        line_count: payload.line_count,
        content_size: payload.content.map(|c| c.len() as u64),
    }
}
