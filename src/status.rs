//! Status output generation
//!
//! Structured snapshots of the three subsystems (skeleton cache, commit
//! log, message store) with canonical JSON emission using JCS (RFC 8785)
//! for stable diffs across platforms. Consumed by operators checking the
//! health of a shared-state deployment; nothing here mutates state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use taskloom_utils::canonical::emit_jcs;

use crate::cache::SkeletonCache;
use crate::commit_log::{CommitLog, CommitStatus};
use crate::config::{Config, ConfigSource};
use crate::message_store::{MessageStore, StatusFilter};

/// Schema version for status outputs.
pub const STATUS_SCHEMA_VERSION: &str = "1";

/// Snapshot of the skeleton cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub task_count: usize,
    /// Tasks with a reconstructed parent link
    pub linked_count: usize,
    /// Tasks that completed both phases without a link
    pub root_count: usize,
    /// Tasks carrying processing errors
    pub error_count: usize,
    pub completed_count: usize,
    pub total_source_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_recent_activity: Option<DateTime<Utc>>,
}

/// Snapshot of the commit log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitLogStatus {
    pub current_sequence_number: u64,
    pub total_entries: u64,
    pub pending_count: usize,
    pub applied_count: usize,
    pub failed_count: usize,
    pub rolled_back_count: usize,
    pub is_consistent: bool,
    pub inconsistency_count: usize,
}

/// Snapshot of one machine's view of the message store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStoreStatus {
    pub machine_id: String,
    pub inbox_total: usize,
    pub inbox_unread: usize,
}

/// Full status output, one per snapshot call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub schema_version: String,
    pub emitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_log: Option<CommitLogStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<MessageStoreStatus>,
    /// Setting name → (value, source), for operator inspection
    pub effective_config: BTreeMap<String, (String, String)>,
}

impl StatusReport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: STATUS_SCHEMA_VERSION.to_string(),
            emitted_at: Utc::now(),
            cache: None,
            commit_log: None,
            messages: None,
            effective_config: BTreeMap::new(),
        }
    }

    /// Attach a skeleton-cache snapshot.
    #[must_use]
    pub fn with_cache(mut self, cache: &SkeletonCache) -> Self {
        let mut status = CacheStatus::default();
        for skeleton in cache.snapshot() {
            status.task_count += 1;
            if skeleton.reconstructed_parent_id.is_some() {
                status.linked_count += 1;
            } else if skeleton.processing_state.phase2_completed
                && skeleton.truncated_instruction.is_some()
            {
                status.root_count += 1;
            }
            if !skeleton.processing_state.errors.is_empty() {
                status.error_count += 1;
            }
            if skeleton.is_completed {
                status.completed_count += 1;
            }
            status.total_source_bytes += skeleton.metadata.total_size;
            if let Some(activity) = skeleton.metadata.last_activity
                && status
                    .most_recent_activity
                    .is_none_or(|current| activity > current)
            {
                status.most_recent_activity = Some(activity);
            }
        }
        self.cache = Some(status);
        self
    }

    /// Attach a commit-log snapshot, including a consistency pass.
    #[must_use]
    pub fn with_commit_log(mut self, log: &CommitLog) -> Self {
        let state = log.state();
        let consistency = log.verify_consistency();
        self.commit_log = Some(CommitLogStatus {
            current_sequence_number: state.current_sequence_number,
            total_entries: state.statistics.total_entries,
            pending_count: state.entries_by_status.bucket(CommitStatus::Pending).len(),
            applied_count: state.entries_by_status.bucket(CommitStatus::Applied).len(),
            failed_count: state.entries_by_status.bucket(CommitStatus::Failed).len(),
            rolled_back_count: state
                .entries_by_status
                .bucket(CommitStatus::RolledBack)
                .len(),
            is_consistent: consistency.is_consistent,
            inconsistency_count: consistency.inconsistencies.len(),
        });
        self
    }

    /// Attach a message-store snapshot for the store's own machine.
    #[must_use]
    pub fn with_messages(mut self, store: &MessageStore) -> Self {
        let machine_id = store.machine_id().to_string();
        let total = store.read_inbox(&machine_id, StatusFilter::All, None).len();
        let unread = store
            .read_inbox(&machine_id, StatusFilter::Unread, None)
            .len();
        self.messages = Some(MessageStoreStatus {
            machine_id,
            inbox_total: total,
            inbox_unread: unread,
        });
        self
    }

    /// Attach the effective configuration with source attribution.
    #[must_use]
    pub fn with_config(mut self, config: &Config) -> Self {
        let entries: [(&str, String); 7] = [
            ("engine.strict_mode", config.engine.strict_mode.to_string()),
            ("engine.debug_mode", config.engine.debug_mode.to_string()),
            ("engine.force_rebuild", config.engine.force_rebuild.to_string()),
            ("engine.batch_size", config.engine.batch_size.to_string()),
            ("shared.machine_id", config.shared.machine_id.clone()),
            (
                "commit_log.compression_age_days",
                config.commit_log.compression_age_days.to_string(),
            ),
            (
                "commit_log.max_retry_attempts",
                config.commit_log.max_retry_attempts.to_string(),
            ),
        ];
        for (key, value) in entries {
            let source = match config.source_of(key) {
                ConfigSource::Env => "environment".to_string(),
                ConfigSource::ConfigFile(path) => format!("config file ({path})"),
                ConfigSource::Defaults => "defaults".to_string(),
            };
            self.effective_config.insert(key.to_string(), (value, source));
        }
        self
    }

    /// Emit as JCS-canonical JSON for stable cross-platform diffs.
    pub fn emit_json(&self) -> Result<String> {
        emit_jcs(self)
    }

    /// Render a short human-readable summary.
    #[must_use]
    pub fn render_text(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "taskloom status (schema {})", self.schema_version);

        if let Some(cache) = &self.cache {
            let _ = writeln!(
                out,
                "  cache: {} tasks ({} linked, {} roots, {} with errors, {} completed)",
                cache.task_count,
                cache.linked_count,
                cache.root_count,
                cache.error_count,
                cache.completed_count,
            );
        }
        if let Some(log) = &self.commit_log {
            let consistency = if log.is_consistent {
                "consistent".to_string()
            } else {
                format!("{} inconsistencies", log.inconsistency_count)
            };
            let _ = writeln!(
                out,
                "  commit log: seq {} ({} pending, {} applied, {} failed, {} rolled back), {}",
                log.current_sequence_number,
                log.pending_count,
                log.applied_count,
                log.failed_count,
                log.rolled_back_count,
                consistency,
            );
        }
        if let Some(messages) = &self.messages {
            let _ = writeln!(
                out,
                "  messages: {} in inbox for {} ({} unread)",
                messages.inbox_total, messages.machine_id, messages.inbox_unread,
            );
        }
        for (key, (value, source)) in &self.effective_config {
            let _ = writeln!(out, "  config: {key} = {value} [{source}]");
        }
        out
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self::new()
    }
}
