//! Initial-instruction extraction from UI-message logs
//!
//! The first user instruction of a task frequently survives only in
//! truncated form: the visible `say/text` record is capped by the host UI,
//! while the full text lives inside the first API request between
//! `<task>` tags. Extraction therefore works with two candidates and picks
//! the one most likely to be complete.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::artifact::UiMessage;

/// Maximum length of an emitted instruction, in characters.
pub const MAX_INSTRUCTION_CHARS: usize = 200;

/// Candidate A must be longer than this many characters to count.
const MIN_CANDIDATE_CHARS: usize = 20;

/// Below this length candidate A is considered truncated and B wins.
const SHORT_CANDIDATE_CHARS: usize = 50;

// Greedy and newline-tolerant: the task body may itself contain short
// tag-like fragments, and the host always closes the outermost pair last.
static TASK_SPAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<task>(.*)</task>").expect("task span regex is valid")
});

static ENVIRONMENT_DETAILS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<environment_details>.*?</environment_details>")
        .expect("environment details regex is valid")
});

#[derive(Debug, Deserialize)]
struct ApiRequestStarted {
    request: Option<String>,
}

/// Recover the initial user instruction from an ordered UI-message log.
///
/// Single pass, short-circuiting:
/// 1. Candidate A: the first `say == "text"` record with non-empty text
///    longer than 20 characters.
/// 2. Candidate B: the first `say == "api_req_started"` record whose `text`
///    decodes to JSON with a `request` string containing a `<task>…</task>`
///    span.
/// 3. B is emitted when it exists and A is absent, ends with an ellipsis, or
///    is shorter than 50 characters; otherwise A; otherwise nothing.
///
/// The emitted string is trimmed, stripped of `environment_details` blocks
/// and task tags, and truncated to 200 characters.
#[must_use]
pub fn extract_initial_instruction(messages: &[UiMessage]) -> Option<String> {
    let mut candidate_a: Option<&str> = None;
    let mut candidate_b: Option<String> = None;

    for message in messages {
        if candidate_a.is_none()
            && message.kind == "say"
            && message.say.as_deref() == Some("text")
            && let Some(text) = message.text.as_deref()
            && text.chars().count() > MIN_CANDIDATE_CHARS
        {
            candidate_a = Some(text);
        }

        if candidate_b.is_none()
            && message.say.as_deref() == Some("api_req_started")
            && let Some(text) = message.text.as_deref()
            && let Ok(payload) = serde_json::from_str::<ApiRequestStarted>(text)
            && let Some(request) = payload.request.as_deref()
            && let Some(task) = extract_task_span(request)
        {
            candidate_b = Some(task);
        }

        if candidate_a.is_some() && candidate_b.is_some() {
            break;
        }
    }

    let prefer_b = match candidate_a {
        None => true,
        Some(a) => {
            let trimmed = a.trim_end();
            trimmed.ends_with("...")
                || trimmed.ends_with('\u{2026}')
                || a.chars().count() < SHORT_CANDIDATE_CHARS
        }
    };

    let chosen = if prefer_b {
        candidate_b.or_else(|| candidate_a.map(str::to_string))
    } else {
        candidate_a.map(str::to_string)
    }?;

    let cleaned = clean_instruction(&chosen);
    if cleaned.is_empty() {
        return None;
    }
    Some(truncate_chars(&cleaned, MAX_INSTRUCTION_CHARS))
}

/// The substring between `<task>` and `</task>`, trimmed. Greedy match so
/// nested or repeated tags never split the instruction.
#[must_use]
pub fn extract_task_span(request: &str) -> Option<String> {
    TASK_SPAN_RE
        .captures(request)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Remove `environment_details` blocks and any stray task tags.
#[must_use]
pub fn clean_instruction(raw: &str) -> String {
    let without_env = ENVIRONMENT_DETAILS_RE.replace_all(raw, "");
    without_env
        .replace("<task>", "")
        .replace("</task>", "")
        .trim()
        .to_string()
}

/// UTF-8-safe truncation to at most `max` characters.
#[must_use]
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
