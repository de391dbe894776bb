//! Conversation tree rendering
//!
//! Text views over the skeleton cache for navigation: one task, the
//! ancestor chain from its root, or the full sibling cluster under its
//! parent. Message bodies are elided head/tail so deep transcripts stay
//! readable.

use std::fmt::Write;

use taskloom_utils::error::{ErrorCategory, UserFriendlyError};

use crate::cache::SkeletonCache;
use crate::task_id::TaskId;
use crate::types::{ActionKind, ConversationSkeleton, MessageRole, SequenceItem};

/// Which slice of the hierarchy to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// The one task
    #[default]
    Single,
    /// Ancestor chain from the root down to the task
    Chain,
    /// The parent and its full set of children (the task's siblings)
    Cluster,
}

/// Tree view errors
#[derive(Debug, thiserror::Error)]
pub enum TreeViewError {
    #[error("Task not found in cache: {0}")]
    TaskNotFound(TaskId),

    #[error("Cache is empty; nothing to render")]
    EmptyCache,
}

impl UserFriendlyError for TreeViewError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn suggestions(&self) -> Vec<String> {
        vec!["Run a scan to populate the skeleton cache first".to_string()]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::State
    }
}

/// Render a text view of the hierarchy around `task_id`.
///
/// With no task id, the most recently active skeleton is selected.
/// `truncate_lines = n` keeps the first and last `n` lines of each message
/// body with a `[...]` marker between; `0` disables truncation.
pub fn view_conversation_tree(
    cache: &SkeletonCache,
    task_id: Option<&TaskId>,
    view_mode: ViewMode,
    truncate_lines: usize,
) -> Result<String, TreeViewError> {
    let target = match task_id {
        Some(id) => cache
            .get(id)
            .ok_or_else(|| TreeViewError::TaskNotFound(id.clone()))?,
        None => cache.most_recent().ok_or(TreeViewError::EmptyCache)?,
    };

    let mut out = String::new();
    match view_mode {
        ViewMode::Single => {
            render_task(&mut out, &target, 0, truncate_lines);
        }
        ViewMode::Chain => {
            let chain = ancestor_chain(cache, &target);
            for (depth, skeleton) in chain.iter().enumerate() {
                render_task(&mut out, skeleton, depth, truncate_lines);
            }
        }
        ViewMode::Cluster => {
            // The cluster pivots on the parent; a root pivots on itself.
            let pivot = target
                .effective_parent()
                .and_then(|p| cache.get(p))
                .unwrap_or_else(|| target.clone());
            render_task(&mut out, &pivot, 0, truncate_lines);
            for child in cache.children_of(&pivot.task_id) {
                render_task(&mut out, &child, 1, truncate_lines);
            }
        }
    }

    Ok(out)
}

/// Walk effective parents up to the root, returning root-first order.
/// Bounded by the cache size, so a corrupt link chain cannot loop.
fn ancestor_chain(cache: &SkeletonCache, target: &ConversationSkeleton) -> Vec<ConversationSkeleton> {
    let mut chain = vec![target.clone()];
    let limit = cache.len();

    let mut current = target.clone();
    while let Some(parent_id) = current.effective_parent() {
        if chain.len() > limit {
            break;
        }
        let Some(parent) = cache.get(parent_id) else {
            break;
        };
        chain.push(parent.clone());
        current = parent;
    }

    chain.reverse();
    chain
}

fn render_task(
    out: &mut String,
    skeleton: &ConversationSkeleton,
    depth: usize,
    truncate_lines: usize,
) {
    let indent = "  ".repeat(depth);
    let marker = if depth == 0 { "●" } else { "└─" };
    let completed = if skeleton.is_completed { " [completed]" } else { "" };

    let _ = writeln!(
        out,
        "{indent}{marker} {} - {}{completed}",
        skeleton.task_id.short(),
        skeleton.metadata.title,
    );

    let last_activity = skeleton
        .metadata
        .last_activity
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    let _ = writeln!(
        out,
        "{indent}   messages: {}, actions: {}, last activity: {}",
        skeleton.metadata.message_count, skeleton.metadata.action_count, last_activity,
    );

    for item in &skeleton.sequence {
        match item {
            SequenceItem::Message { role, content } => {
                let label = match role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                };
                let _ = writeln!(out, "{indent}   [{label}]");
                for line in elide_lines(content, truncate_lines) {
                    let _ = writeln!(out, "{indent}     {line}");
                }
            }
            SequenceItem::Action {
                kind,
                name,
                status,
                file_path,
                ..
            } => {
                let label = match kind {
                    ActionKind::Tool => "tool",
                    ActionKind::Command => "command",
                };
                let location = file_path
                    .as_deref()
                    .map(|p| format!(" ({p})"))
                    .unwrap_or_default();
                let _ = writeln!(out, "{indent}   [{label}] {name}{location} - {status}");
            }
        }
    }
}

/// Keep the first and last `keep` lines of a body with `[...]` between.
/// `keep == 0` disables elision.
fn elide_lines(content: &str, keep: usize) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    if keep == 0 || lines.len() <= keep * 2 {
        return lines.iter().map(|l| (*l).to_string()).collect();
    }

    let mut out: Vec<String> = Vec::with_capacity(keep * 2 + 1);
    out.extend(lines[..keep].iter().map(|l| (*l).to_string()));
    out.push("[...]".to_string());
    out.extend(lines[lines.len() - keep..].iter().map(|l| (*l).to_string()));
    out
}
