//! Error reporting foundation
//!
//! Operational errors across taskloom are grouped into the categories below
//! and can render a user-facing message with context and suggestions. Module
//! error enums implement [`UserFriendlyError`] so callers get one consistent
//! reporting surface regardless of which subsystem failed.

use serde::{Deserialize, Serialize};

/// Category of an operational error.
///
/// | Category | Description |
/// |----------|-------------|
/// | `Input` | Malformed JSON, bad encodings, invalid identifiers |
/// | `State` | An entity was absent or in the wrong state for the operation |
/// | `Consistency` | A stored invariant no longer holds (hash, sequence, bucket) |
/// | `Concurrency` | Lock contention |
/// | `Reconstruction` | Parent resolution conflicts (ambiguity, cycles) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Input,
    State,
    Consistency,
    Concurrency,
    Reconstruction,
}

impl ErrorCategory {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::State => "state",
            Self::Consistency => "consistency",
            Self::Concurrency => "concurrency",
            Self::Reconstruction => "reconstruction",
        }
    }
}

/// Severity tag for consistency findings.
///
/// Consistency verification reports findings rather than failing the
/// operation; each finding carries one of these levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for providing user-friendly error reporting with context and suggestions
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get contextual information about the error
    fn context(&self) -> Option<String> {
        None
    }

    /// Get actionable suggestions for resolving the error
    fn suggestions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Get the error category
    fn category(&self) -> ErrorCategory;

    /// Render the full user-facing report: message, context, suggestions.
    fn display_for_user(&self) -> String {
        let mut out = self.user_message();
        if let Some(context) = self.context() {
            out.push_str("\n\n");
            out.push_str(&context);
        }
        let suggestions = self.suggestions();
        if !suggestions.is_empty() {
            out.push_str("\n\nSuggestions:");
            for suggestion in suggestions {
                out.push_str("\n  - ");
                out.push_str(&suggestion);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeError;

    impl UserFriendlyError for FakeError {
        fn user_message(&self) -> String {
            "something went wrong".to_string()
        }

        fn context(&self) -> Option<String> {
            Some("while doing the thing".to_string())
        }

        fn suggestions(&self) -> Vec<String> {
            vec!["try again".to_string(), "check the path".to_string()]
        }

        fn category(&self) -> ErrorCategory {
            ErrorCategory::State
        }
    }

    #[test]
    fn test_display_for_user_includes_all_sections() {
        let rendered = FakeError.display_for_user();
        assert!(rendered.contains("something went wrong"));
        assert!(rendered.contains("while doing the thing"));
        assert!(rendered.contains("Suggestions:"));
        assert!(rendered.contains("try again"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn test_severity_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), r#""high""#);
        let parsed: Severity = serde_json::from_str(r#""medium""#).unwrap();
        assert_eq!(parsed, Severity::Medium);
    }

    #[test]
    fn test_category_as_str() {
        assert_eq!(ErrorCategory::Reconstruction.as_str(), "reconstruction");
    }
}
