//! Child-instruction indexing
//!
//! Parent tasks launch children by emitting an XML-like block in an
//! assistant message; the child's own first instruction is the same text.
//! This module extracts those launch instructions, normalizes them into
//! prefixes, and keeps a radix tree from prefix to the set of parent task
//! ids that emitted it. Phase 2 of reconstruction resolves parentage with
//! exact lookups against that tree.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::artifact::{ApiMessage, UiMessage};
use crate::instruction::truncate_chars;
use crate::task_id::TaskId;

/// Outer tag names that encode a child-task launch.
pub const LAUNCH_TAGS: &[&str] = &["new_task", "switch_mode"];

/// Minimum characters for a usable prefix; shorter launches are rejected.
pub const MIN_PREFIX_CHARS: usize = 10;

/// Characters retained from the front of a launch instruction.
pub const MAX_PREFIX_CHARS: usize = 200;

static LAUNCH_BLOCK_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    LAUNCH_TAGS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?s)<{tag}(?:\s[^>]*)?>(.*?)</{tag}>"))
                .expect("launch block regex is valid")
        })
        .collect()
});

// Closed form first; an unbalanced <message> falls through as text to the
// end of the enclosing block.
static MESSAGE_CLOSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(message|reason)(?:\s[^>]*)?>(.*?)</(?:message|reason)>")
        .expect("message element regex is valid")
});

static MESSAGE_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(message|reason)(?:\s[^>]*)?>(.*)$")
        .expect("open message element regex is valid")
});

static ENVIRONMENT_DETAILS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<environment_details>.*?</environment_details>")
        .expect("environment details regex is valid")
});

static WHITESPACE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

/// Normalize a launch instruction (or a Phase-2 candidate) into index form.
///
/// Trim, collapse whitespace runs to single spaces, strip a leading
/// `<user_message>` wrapper, and remove `environment_details` sections.
/// Phase 2 must apply the identical normalization to candidates, so both
/// sides of every lookup go through this one function.
#[must_use]
pub fn normalize_instruction(raw: &str) -> String {
    let without_env = ENVIRONMENT_DETAILS_RE.replace_all(raw, " ");
    let mut text = without_env.trim();

    if let Some(stripped) = text.strip_prefix("<user_message>") {
        text = stripped;
        if let Some(stripped) = text.strip_suffix("</user_message>") {
            text = stripped;
        }
    }

    WHITESPACE_RUN_RE
        .replace_all(text.trim(), " ")
        .trim()
        .to_string()
}

/// Normalize and clip a launch instruction into a prefix, rejecting ones
/// too short to be discriminating.
#[must_use]
pub fn normalize_prefix(raw: &str) -> Option<String> {
    let normalized = normalize_instruction(raw);
    if normalized.chars().count() < MIN_PREFIX_CHARS {
        return None;
    }
    Some(truncate_chars(&normalized, MAX_PREFIX_CHARS))
}

/// Extract the instruction carried by one launch block body.
fn launch_instruction(block_body: &str) -> Option<String> {
    if let Some(caps) = MESSAGE_CLOSED_RE.captures(block_body) {
        return Some(caps[2].to_string());
    }
    if let Some(caps) = MESSAGE_OPEN_RE.captures(block_body) {
        return Some(caps[2].to_string());
    }
    None
}

/// Scan one text blob for launch blocks and collect normalized prefixes.
fn scan_text(text: &str, out: &mut Vec<String>) {
    for re in LAUNCH_BLOCK_RES.iter() {
        for caps in re.captures_iter(text) {
            if let Some(instruction) = launch_instruction(&caps[1])
                && let Some(prefix) = normalize_prefix(&instruction)
                && !out.contains(&prefix)
            {
                out.push(prefix);
            }
        }
    }
}

/// Extract every child-task launch prefix a task emitted, de-duplicated,
/// scanning both the UI log's text records and the API log's assistant
/// messages.
#[must_use]
pub fn extract_child_prefixes(
    ui_messages: &[UiMessage],
    api_messages: Option<&[ApiMessage]>,
) -> Vec<String> {
    let mut prefixes = Vec::new();

    for message in ui_messages {
        if message.say.as_deref() == Some("text")
            && let Some(text) = message.text.as_deref()
        {
            scan_text(text, &mut prefixes);
        }
    }

    if let Some(api) = api_messages {
        for message in api {
            if message.role == "assistant" {
                scan_text(&message.text(), &mut prefixes);
            }
        }
    }

    prefixes
}

/// Outcome of an exact-prefix resolution against the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Exactly one parent registered the prefix
    Unique(TaskId),
    /// More than one parent registered the prefix; the tie is unresolvable
    Ambiguous(usize),
    /// Nothing registered under the exact key
    NotFound,
}

#[derive(Debug, Default)]
struct Node {
    /// Compressed edges; labels are disjoint on their first byte
    children: Vec<(String, Node)>,
    /// Parent ids registered at this exact key
    parents: BTreeSet<TaskId>,
    is_key: bool,
}

/// Byte length of the longest common prefix that ends on a char boundary.
fn common_prefix_len(a: &str, b: &str) -> usize {
    let mut len = 0;
    let mut a_chars = a.char_indices();
    let mut b_chars = b.chars();
    for (idx, ca) in &mut a_chars {
        match b_chars.next() {
            Some(cb) if ca == cb => len = idx + ca.len_utf8(),
            _ => break,
        }
    }
    len
}

impl Node {
    fn insert(&mut self, key: &str, parent_id: TaskId) {
        if key.is_empty() {
            self.is_key = true;
            self.parents.insert(parent_id);
            return;
        }

        for i in 0..self.children.len() {
            let shared = common_prefix_len(&self.children[i].0, key);
            if shared == 0 {
                continue;
            }

            if shared == self.children[i].0.len() {
                // Edge fully matched; descend with the remainder
                self.children[i].1.insert(&key[shared..], parent_id);
            } else {
                // Split the edge at the shared boundary
                let (label, old_child) = self.children.remove(i);
                let mut mid = Node::default();
                mid.children.push((label[shared..].to_string(), old_child));
                mid.insert(&key[shared..], parent_id);
                self.children.push((label[..shared].to_string(), mid));
            }
            return;
        }

        let mut leaf = Node::default();
        leaf.is_key = true;
        leaf.parents.insert(parent_id);
        self.children.push((key.to_string(), leaf));
    }

    fn find(&self, key: &str) -> Option<&Node> {
        if key.is_empty() {
            return Some(self);
        }
        for (label, child) in &self.children {
            if let Some(rest) = key.strip_prefix(label.as_str()) {
                return child.find(rest);
            }
        }
        None
    }

    fn count_keys(&self) -> usize {
        usize::from(self.is_key)
            + self
                .children
                .iter()
                .map(|(_, child)| child.count_keys())
                .sum::<usize>()
    }
}

/// Radix tree from normalized instruction prefix to the set of parent task
/// ids that emitted it.
///
/// Owned by the reconstruction engine: mutated only during Phase 1,
/// read-only during Phase 2. Insertions are idempotent because each key
/// stores a set.
#[derive(Debug, Default)]
pub struct InstructionIndex {
    root: Node,
    key_count: usize,
}

impl InstructionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `prefix` as emitted by `parent_id`. The prefix must already
    /// be normalized; the engine inserts what the indexer extracted.
    pub fn insert(&mut self, prefix: &str, parent_id: TaskId) {
        if prefix.is_empty() {
            return;
        }
        let existed = self.root.find(prefix).is_some_and(|n| n.is_key);
        self.root.insert(prefix, parent_id);
        if !existed {
            self.key_count += 1;
        }
    }

    /// Exact-key lookup. `Some` only when exactly one parent is registered
    /// under the key; ties are ambiguous and yield `None`.
    #[must_use]
    pub fn lookup_exact(&self, candidate: &str) -> Option<&TaskId> {
        match self.root.find(candidate) {
            Some(node) if node.is_key && node.parents.len() == 1 => node.parents.iter().next(),
            _ => None,
        }
    }

    /// Exact-key resolution distinguishing a tie from a miss, so the engine
    /// can record ambiguity as an error rather than silently skipping.
    #[must_use]
    pub fn resolve(&self, candidate: &str) -> ResolutionOutcome {
        match self.root.find(candidate) {
            Some(node) if node.is_key => match node.parents.len() {
                1 => ResolutionOutcome::Unique(
                    node.parents.iter().next().cloned().expect("set is non-empty"),
                ),
                n => ResolutionOutcome::Ambiguous(n),
            },
            _ => ResolutionOutcome::NotFound,
        }
    }

    /// Number of distinct keys in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.key_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    #[cfg(test)]
    fn deep_key_count(&self) -> usize {
        self.root.count_keys()
    }
}
