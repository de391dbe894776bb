//! Distributed commit log on shared storage
//!
//! Append-only, monotonically sequenced log of configuration-change
//! entries, one JSON file per entry plus a `state.json` snapshot. Every
//! entry carries a sha256 over its canonical content; with dense sequence
//! numbers this detects corruption on load. Writers hold the shared `.lock`
//! file for the duration of one mutation; readers never lock.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Instant;

use tracing::{debug, info, warn};

use taskloom_lock::{LockError, WriterLock};
use taskloom_utils::atomic_write::write_file_atomic;
use taskloom_utils::canonical::sha256_jcs;
use taskloom_utils::error::{ErrorCategory, Severity, UserFriendlyError};

use crate::config::CommitLogConfig;
use crate::paths::commit_log_dir;

/// State snapshot filename.
pub const STATE_FILE: &str = "state.json";
/// Writer lock filename.
pub const LOCK_FILE: &str = ".lock";
/// Archive subdirectory for compressed-out entries.
pub const ARCHIVE_DIR: &str = "archive";

/// Entry lifecycle status. `RolledBack` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl CommitStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable bookkeeping attached to an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CommitMetadata {
    fn is_empty(&self) -> bool {
        self.retry_count.is_none()
            && self.applied_at.is_none()
            && self.applied_by.is_none()
            && self.last_error.is_none()
    }
}

/// One element of the hash-chained change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEntry {
    /// Dense, 1-based position in the log
    pub sequence_number: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: CommitStatus,
    /// Hex sha256 over the canonical hashed fields; status participates, so
    /// every transition recomputes it
    pub hash: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "CommitMetadata::is_empty")]
    pub metadata: CommitMetadata,
}

/// The fields that participate in the entry hash, in canonical form.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashInput<'a> {
    sequence_number: u64,
    #[serde(rename = "type")]
    kind: &'a str,
    machine_id: &'a str,
    timestamp: &'a DateTime<Utc>,
    status: CommitStatus,
    data: &'a serde_json::Value,
}

impl CommitEntry {
    /// Recompute this entry's hash from its hashed fields.
    pub fn compute_hash(&self) -> Result<String, CommitLogError> {
        sha256_jcs(&HashInput {
            sequence_number: self.sequence_number,
            kind: &self.kind,
            machine_id: &self.machine_id,
            timestamp: &self.timestamp,
            status: self.status,
            data: &self.data,
        })
        .map_err(|e| CommitLogError::Serialization {
            reason: e.to_string(),
        })
    }

    fn rehash(&mut self) -> Result<(), CommitLogError> {
        self.hash = self.compute_hash()?;
        Ok(())
    }
}

/// Sequence numbers bucketed by status, persisted in `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntriesByStatus {
    #[serde(default)]
    pub pending: Vec<u64>,
    #[serde(default)]
    pub applied: Vec<u64>,
    #[serde(default)]
    pub failed: Vec<u64>,
    #[serde(default)]
    pub rolled_back: Vec<u64>,
}

impl EntriesByStatus {
    fn bucket_mut(&mut self, status: CommitStatus) -> &mut Vec<u64> {
        match status {
            CommitStatus::Pending => &mut self.pending,
            CommitStatus::Applied => &mut self.applied,
            CommitStatus::Failed => &mut self.failed,
            CommitStatus::RolledBack => &mut self.rolled_back,
        }
    }

    #[must_use]
    pub fn bucket(&self, status: CommitStatus) -> &[u64] {
        match status {
            CommitStatus::Pending => &self.pending,
            CommitStatus::Applied => &self.applied,
            CommitStatus::Failed => &self.failed,
            CommitStatus::RolledBack => &self.rolled_back,
        }
    }

    fn transition(&mut self, seq: u64, from: CommitStatus, to: CommitStatus) {
        self.bucket_mut(from).retain(|&s| s != seq);
        let bucket = self.bucket_mut(to);
        if !bucket.contains(&seq) {
            bucket.push(seq);
            bucket.sort_unstable();
        }
    }
}

/// Aggregate counters persisted in `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitLogStatistics {
    pub total_entries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_append_at: Option<DateTime<Utc>>,
}

/// `state.json` shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitLogState {
    pub current_sequence_number: u64,
    pub entries_by_status: EntriesByStatus,
    pub statistics: CommitLogStatistics,
    pub metadata: StateMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    #[serde(default)]
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Commit-log operation errors
#[derive(Debug, thiserror::Error)]
pub enum CommitLogError {
    #[error("Commit log is uninitialized: {reason}")]
    Uninitialized { reason: String },

    #[error("Lock acquisition failed: {0}")]
    LockAcquisitionFailed(#[from] LockError),

    #[error("Commit entry not found: sequence {0}")]
    EntryNotFound(u64),

    #[error("Entry {seq} is {status}, not pending")]
    NotPending { seq: u64, status: CommitStatus },

    #[error("Entry {seq} is rolled back; the status is terminal")]
    Terminal { seq: u64 },

    #[error("Reset requires confirmation")]
    ConfirmationRequired,

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Failed to persist {path}: {reason}")]
    Persist { path: Utf8PathBuf, reason: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UserFriendlyError for CommitLogError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::LockAcquisitionFailed(_) => Some(
                "Another machine is writing to the shared commit log. There is no \
                 automatic retry; re-invoke the operation."
                    .to_string(),
            ),
            Self::ConfirmationRequired => {
                Some("Resetting deletes every commit entry and clears state.".to_string())
            }
            _ => None,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::LockAcquisitionFailed(_) => ErrorCategory::Concurrency,
            Self::EntryNotFound(_)
            | Self::NotPending { .. }
            | Self::Terminal { .. }
            | Self::ConfirmationRequired
            | Self::Uninitialized { .. } => ErrorCategory::State,
            _ => ErrorCategory::Input,
        }
    }
}

/// Receipt for a successful append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendReceipt {
    pub sequence_number: u64,
    pub hash: String,
}

/// Page of most-recent entries, ascending by sequence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestEntries {
    pub entries: Vec<CommitEntry>,
    pub has_more: bool,
    /// Highest sequence before this page, when more exist
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sequence: Option<u64>,
}

/// Kinds of consistency findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    HashMismatch,
    SequenceGap,
    BucketStatusMismatch,
    StaleState,
}

/// One consistency finding; informational, severity-tagged.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inconsistency {
    pub kind: InconsistencyKind,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

/// Result of a consistency verification pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub is_consistent: bool,
    pub inconsistencies: Vec<Inconsistency>,
}

/// Per-entry results of an `apply_pending` sweep.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied: Vec<u64>,
    pub failed: Vec<(u64, String)>,
}

/// Placeholder result of a cross-machine sync. Merge semantics are left to
/// integrators; the loop only reports and retries.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub merged_entries: usize,
    pub conflicts: usize,
}

/// The commit log: single writer per machine, file-per-entry on shared
/// storage, in-memory map authoritative for reads.
pub struct CommitLog {
    dir: Utf8PathBuf,
    machine_id: String,
    config: CommitLogConfig,
    entries: BTreeMap<u64, CommitEntry>,
    state: CommitLogState,
    last_sync: Option<Instant>,
}

impl CommitLog {
    /// Open (creating if needed) the commit log under `<shared>/commit-log/`.
    ///
    /// # Errors
    ///
    /// `Uninitialized` when the directory tree cannot be created or the
    /// state file is unreadable; the caller holds no usable instance then.
    pub fn open(
        shared_root: &Utf8Path,
        machine_id: impl Into<String>,
        config: CommitLogConfig,
    ) -> Result<Self, CommitLogError> {
        let dir = commit_log_dir(shared_root);
        let archive = dir.join(ARCHIVE_DIR);
        fs::create_dir_all(archive.as_std_path()).map_err(|e| CommitLogError::Uninitialized {
            reason: format!("cannot create {archive}: {e}"),
        })?;

        let machine_id = machine_id.into();
        let state_path = dir.join(STATE_FILE);
        let state = if state_path.exists() {
            let content = fs::read_to_string(state_path.as_std_path()).map_err(|e| {
                CommitLogError::Uninitialized {
                    reason: format!("cannot read {state_path}: {e}"),
                }
            })?;
            serde_json::from_str(&content).map_err(|e| CommitLogError::Uninitialized {
                reason: format!("cannot parse {state_path}: {e}"),
            })?
        } else {
            CommitLogState {
                metadata: StateMetadata {
                    machine_id: machine_id.clone(),
                    updated_at: None,
                },
                ..CommitLogState::default()
            }
        };

        let mut log = Self {
            dir,
            machine_id,
            config,
            entries: BTreeMap::new(),
            state,
            last_sync: None,
        };
        log.load_entries();
        Ok(log)
    }

    fn load_entries(&mut self) {
        for dir in [self.dir.clone(), self.dir.join(ARCHIVE_DIR)] {
            let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
                continue;
            };
            for entry in entries.filter_map(Result::ok) {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if !is_entry_filename(&name) {
                    continue;
                }
                let path = dir.join(&name);
                match fs::read_to_string(path.as_std_path())
                    .map_err(|e| e.to_string())
                    .and_then(|c| serde_json::from_str::<CommitEntry>(&c).map_err(|e| e.to_string()))
                {
                    Ok(parsed) => {
                        self.entries.insert(parsed.sequence_number, parsed);
                    }
                    Err(e) => warn!(file = %path, error = %e, "skipping unreadable commit entry"),
                }
            }
        }
        debug!(count = self.entries.len(), "commit entries loaded");
    }

    #[must_use]
    pub fn state(&self) -> &CommitLogState {
        &self.state
    }

    #[must_use]
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn entry_path(&self, seq: u64) -> Utf8PathBuf {
        self.dir.join(format!("{seq:07}.json"))
    }

    fn archive_path(&self, seq: u64) -> Utf8PathBuf {
        self.dir.join(ARCHIVE_DIR).join(format!("{seq:07}.json"))
    }

    fn acquire_lock(&self) -> Result<WriterLock, CommitLogError> {
        WriterLock::acquire(&self.dir.join(LOCK_FILE), &self.machine_id)
            .map_err(CommitLogError::from)
    }

    fn persist_entry(&self, entry: &CommitEntry) -> Result<(), CommitLogError> {
        // An archived entry's file moved; rewrite it where it lives
        let path = if self.entry_path(entry.sequence_number).exists()
            || !self.archive_path(entry.sequence_number).exists()
        {
            self.entry_path(entry.sequence_number)
        } else {
            self.archive_path(entry.sequence_number)
        };
        let json = serde_json::to_string_pretty(entry).map_err(|e| {
            CommitLogError::Serialization {
                reason: e.to_string(),
            }
        })?;
        write_file_atomic(&path, &json).map_err(|e| CommitLogError::Persist {
            path,
            reason: e.to_string(),
        })
    }

    fn persist_state(&mut self) -> Result<(), CommitLogError> {
        self.state.metadata.machine_id = self.machine_id.clone();
        self.state.metadata.updated_at = Some(Utc::now());
        let path = self.dir.join(STATE_FILE);
        let json =
            serde_json::to_string_pretty(&self.state).map_err(|e| CommitLogError::Serialization {
                reason: e.to_string(),
            })?;
        write_file_atomic(&path, &json).map_err(|e| CommitLogError::Persist {
            path,
            reason: e.to_string(),
        })
    }

    /// Append a new entry in `Pending` state.
    ///
    /// Acquires the writer lock for the duration; contention fails
    /// immediately with `LockAcquisitionFailed` and no retry.
    pub fn append(
        &mut self,
        kind: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<AppendReceipt, CommitLogError> {
        let _lock = self.acquire_lock()?;

        let sequence_number = self.state.current_sequence_number + 1;
        let mut entry = CommitEntry {
            sequence_number,
            kind: kind.into(),
            machine_id: self.machine_id.clone(),
            timestamp: Utc::now(),
            status: CommitStatus::Pending,
            hash: String::new(),
            data,
            metadata: CommitMetadata::default(),
        };
        entry.rehash()?;

        self.persist_entry(&entry)?;

        self.state.current_sequence_number = sequence_number;
        self.state.entries_by_status.pending.push(sequence_number);
        self.state.statistics.total_entries += 1;
        self.state.statistics.last_append_at = Some(entry.timestamp);
        self.persist_state()?;

        let receipt = AppendReceipt {
            sequence_number,
            hash: entry.hash.clone(),
        };
        info!(seq = sequence_number, kind = %entry.kind, "commit entry appended");
        self.entries.insert(sequence_number, entry);
        Ok(receipt)
    }

    /// Cached entry, falling back to a disk load for sequences this
    /// instance has not seen (another machine appended them).
    pub fn get(&mut self, seq: u64) -> Option<CommitEntry> {
        if let Some(entry) = self.entries.get(&seq) {
            return Some(entry.clone());
        }
        for path in [self.entry_path(seq), self.archive_path(seq)] {
            if let Ok(content) = fs::read_to_string(path.as_std_path())
                && let Ok(entry) = serde_json::from_str::<CommitEntry>(&content)
            {
                self.entries.insert(seq, entry.clone());
                return Some(entry);
            }
        }
        None
    }

    /// Up to `n` most recent entries, ascending by sequence, with a hint
    /// for paging further back.
    #[must_use]
    pub fn get_latest(&self, n: usize) -> LatestEntries {
        let total = self.entries.len();
        let entries: Vec<CommitEntry> = self
            .entries
            .values()
            .skip(total.saturating_sub(n))
            .cloned()
            .collect();
        let has_more = total > entries.len();
        let next_sequence = if has_more {
            entries.first().map(|e| e.sequence_number.saturating_sub(1))
        } else {
            None
        };
        LatestEntries {
            entries,
            has_more,
            next_sequence,
        }
    }

    /// Entries at or after `since`, ascending by sequence. Linear scan of
    /// the in-memory map.
    #[must_use]
    pub fn get_since(&self, since: DateTime<Utc>) -> Vec<CommitEntry> {
        self.entries
            .values()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Pending entries in sequence order.
    #[must_use]
    pub fn get_pending(&self) -> Vec<CommitEntry> {
        self.entries
            .values()
            .filter(|e| e.status == CommitStatus::Pending)
            .cloned()
            .collect()
    }

    /// Transition one entry `Pending → Applied`, atomically for the entry
    /// file plus state snapshot.
    pub fn apply(&mut self, seq: u64) -> Result<(), CommitLogError> {
        let _lock = self.acquire_lock()?;
        self.apply_locked(seq)
    }

    fn apply_locked(&mut self, seq: u64) -> Result<(), CommitLogError> {
        let entry = self
            .entries
            .get_mut(&seq)
            .ok_or(CommitLogError::EntryNotFound(seq))?;
        if entry.status != CommitStatus::Pending {
            return Err(CommitLogError::NotPending {
                seq,
                status: entry.status,
            });
        }

        entry.status = CommitStatus::Applied;
        entry.metadata.applied_at = Some(Utc::now());
        entry.metadata.applied_by = Some(self.machine_id.clone());
        entry.rehash()?;
        let entry = entry.clone();

        self.persist_entry(&entry)?;
        self.state
            .entries_by_status
            .transition(seq, CommitStatus::Pending, CommitStatus::Applied);
        self.persist_state()?;
        info!(seq, "commit entry applied");
        Ok(())
    }

    /// Apply every pending entry in order. A failure records the per-entry
    /// result and the sweep continues with the next entry.
    pub fn apply_pending(&mut self) -> Result<ApplyReport, CommitLogError> {
        let _lock = self.acquire_lock()?;

        let pending: Vec<u64> = self
            .get_pending()
            .into_iter()
            .map(|e| e.sequence_number)
            .collect();

        let mut report = ApplyReport::default();
        for seq in pending {
            match self.apply_locked(seq) {
                Ok(()) => report.applied.push(seq),
                Err(e) => {
                    warn!(seq, error = %e, "apply failed; continuing with next entry");
                    report.failed.push((seq, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Transition `Pending → Failed`, recording the error and bumping the
    /// retry count.
    pub fn mark_failed(
        &mut self,
        seq: u64,
        error: impl Into<String>,
    ) -> Result<(), CommitLogError> {
        let _lock = self.acquire_lock()?;

        let entry = self
            .entries
            .get_mut(&seq)
            .ok_or(CommitLogError::EntryNotFound(seq))?;
        if entry.status != CommitStatus::Pending {
            return Err(CommitLogError::NotPending {
                seq,
                status: entry.status,
            });
        }

        entry.status = CommitStatus::Failed;
        entry.metadata.last_error = Some(error.into());
        entry.metadata.retry_count = Some(entry.metadata.retry_count.unwrap_or(0) + 1);
        entry.rehash()?;
        let entry = entry.clone();

        self.persist_entry(&entry)?;
        self.state
            .entries_by_status
            .transition(seq, CommitStatus::Pending, CommitStatus::Failed);
        self.persist_state()
    }

    /// Move any non-terminal entry to `RolledBack`, recording the reason.
    /// No automatic restoration of prior state is attempted.
    pub fn rollback(&mut self, seq: u64, reason: impl Into<String>) -> Result<(), CommitLogError> {
        let _lock = self.acquire_lock()?;

        let entry = self
            .entries
            .get_mut(&seq)
            .ok_or(CommitLogError::EntryNotFound(seq))?;
        if entry.status == CommitStatus::RolledBack {
            return Err(CommitLogError::Terminal { seq });
        }

        let from = entry.status;
        entry.status = CommitStatus::RolledBack;
        entry.metadata.last_error = Some(reason.into());
        entry.rehash()?;
        let entry = entry.clone();

        self.persist_entry(&entry)?;
        self.state
            .entries_by_status
            .transition(seq, from, CommitStatus::RolledBack);
        self.persist_state()?;
        info!(seq, from = %from, "commit entry rolled back");
        Ok(())
    }

    /// Verify the on-disk log: dense sequence numbers starting at 1, every
    /// stored hash matching a recomputation, status buckets agreeing with
    /// entry files. Findings are informational, severity-tagged.
    #[must_use]
    pub fn verify_consistency(&self) -> ConsistencyReport {
        let mut findings = Vec::new();

        // Read entries fresh from disk so on-disk corruption is caught even
        // when the in-memory copy is clean.
        let mut disk_entries: BTreeMap<u64, CommitEntry> = BTreeMap::new();
        for dir in [self.dir.clone(), self.dir.join(ARCHIVE_DIR)] {
            let Ok(dir_entries) = fs::read_dir(dir.as_std_path()) else {
                continue;
            };
            for entry in dir_entries.filter_map(Result::ok) {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if !is_entry_filename(&name) {
                    continue;
                }
                let path = dir.join(&name);
                match fs::read_to_string(path.as_std_path())
                    .map_err(|e| e.to_string())
                    .and_then(|c| serde_json::from_str::<CommitEntry>(&c).map_err(|e| e.to_string()))
                {
                    Ok(parsed) => {
                        disk_entries.insert(parsed.sequence_number, parsed);
                    }
                    Err(e) => findings.push(Inconsistency {
                        kind: InconsistencyKind::HashMismatch,
                        severity: Severity::High,
                        message: format!("entry file {path} is unreadable: {e}"),
                        sequence_number: None,
                    }),
                }
            }
        }

        // (i) dense sequence numbers starting at 1
        for (expected, (&seq, _)) in (1..).zip(disk_entries.iter()) {
            if seq != expected {
                findings.push(Inconsistency {
                    kind: InconsistencyKind::SequenceGap,
                    severity: Severity::High,
                    message: format!("expected sequence {expected}, found {seq}"),
                    sequence_number: Some(seq),
                });
                break;
            }
        }

        // (ii) stored hash matches recomputation
        for entry in disk_entries.values() {
            match entry.compute_hash() {
                Ok(recomputed) if recomputed == entry.hash => {}
                Ok(recomputed) => findings.push(Inconsistency {
                    kind: InconsistencyKind::HashMismatch,
                    severity: Severity::High,
                    message: format!(
                        "entry {} hash {} does not match recomputed {recomputed}",
                        entry.sequence_number, entry.hash
                    ),
                    sequence_number: Some(entry.sequence_number),
                }),
                Err(e) => findings.push(Inconsistency {
                    kind: InconsistencyKind::HashMismatch,
                    severity: Severity::High,
                    message: format!("entry {} cannot be hashed: {e}", entry.sequence_number),
                    sequence_number: Some(entry.sequence_number),
                }),
            }
        }

        // (iii) buckets agree with entry status fields
        for status in [
            CommitStatus::Pending,
            CommitStatus::Applied,
            CommitStatus::Failed,
            CommitStatus::RolledBack,
        ] {
            for &seq in self.state.entries_by_status.bucket(status) {
                match disk_entries.get(&seq) {
                    Some(entry) if entry.status == status => {}
                    Some(entry) => findings.push(Inconsistency {
                        kind: InconsistencyKind::BucketStatusMismatch,
                        severity: Severity::Medium,
                        message: format!(
                            "entry {seq} is bucketed {status} but stored as {}",
                            entry.status
                        ),
                        sequence_number: Some(seq),
                    }),
                    None => findings.push(Inconsistency {
                        kind: InconsistencyKind::BucketStatusMismatch,
                        severity: Severity::Medium,
                        message: format!("bucket {status} references missing entry {seq}"),
                        sequence_number: Some(seq),
                    }),
                }
            }
        }

        // Informational: state counter behind the newest entry file
        if let Some((&max_seq, _)) = disk_entries.iter().next_back()
            && self.state.current_sequence_number != max_seq
        {
            findings.push(Inconsistency {
                kind: InconsistencyKind::StaleState,
                severity: Severity::Low,
                message: format!(
                    "state sequence {} behind newest entry {max_seq}",
                    self.state.current_sequence_number
                ),
                sequence_number: Some(max_seq),
            });
        }

        ConsistencyReport {
            is_consistent: findings.is_empty(),
            inconsistencies: findings,
        }
    }

    /// Move settled entries older than the configured compression age into
    /// `archive/`. The entry format is unchanged; the in-memory map stays
    /// authoritative for reads. Returns how many moved.
    pub fn compress_old_entries(&mut self) -> Result<usize, CommitLogError> {
        let _lock = self.acquire_lock()?;

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.compression_age_days));
        let candidates: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.status != CommitStatus::Pending && e.timestamp < cutoff)
            .map(|e| e.sequence_number)
            .collect();

        let mut moved = 0;
        for seq in candidates {
            let from = self.entry_path(seq);
            let to = self.archive_path(seq);
            if !from.exists() {
                continue; // already archived
            }
            fs::rename(from.as_std_path(), to.as_std_path()).map_err(|e| CommitLogError::Io {
                path: from.clone(),
                source: e,
            })?;
            moved += 1;
        }
        if moved > 0 {
            info!(moved, "commit entries archived");
        }
        Ok(moved)
    }

    /// Delete `Failed` entries whose retry budget is exhausted. Returns the
    /// removed sequence numbers.
    pub fn cleanup_failed_entries(&mut self) -> Result<Vec<u64>, CommitLogError> {
        let _lock = self.acquire_lock()?;

        let doomed: Vec<u64> = self
            .entries
            .values()
            .filter(|e| {
                e.status == CommitStatus::Failed
                    && e.metadata.retry_count.unwrap_or(0) >= self.config.max_retry_attempts
            })
            .map(|e| e.sequence_number)
            .collect();

        for &seq in &doomed {
            for path in [self.entry_path(seq), self.archive_path(seq)] {
                match fs::remove_file(path.as_std_path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(CommitLogError::Io { path, source: e }),
                }
            }
            self.entries.remove(&seq);
            self.state
                .entries_by_status
                .failed
                .retain(|&s| s != seq);
        }

        if !doomed.is_empty() {
            self.persist_state()?;
            info!(removed = doomed.len(), "failed commit entries cleaned up");
        }
        Ok(doomed)
    }

    /// Delete all entries and clear state. `confirm == false` fails with
    /// `ConfirmationRequired` and touches nothing.
    pub fn reset(&mut self, confirm: bool) -> Result<(), CommitLogError> {
        if !confirm {
            return Err(CommitLogError::ConfirmationRequired);
        }
        let _lock = self.acquire_lock()?;

        for dir in [self.dir.clone(), self.dir.join(ARCHIVE_DIR)] {
            let Ok(dir_entries) = fs::read_dir(dir.as_std_path()) else {
                continue;
            };
            for entry in dir_entries.filter_map(Result::ok) {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if is_entry_filename(&name) {
                    let path = dir.join(&name);
                    fs::remove_file(path.as_std_path())
                        .map_err(|e| CommitLogError::Io { path, source: e })?;
                }
            }
        }

        self.entries.clear();
        self.state = CommitLogState {
            metadata: StateMetadata {
                machine_id: self.machine_id.clone(),
                updated_at: None,
            },
            ..CommitLogState::default()
        };
        self.persist_state()?;
        info!("commit log reset");
        Ok(())
    }

    /// Merge with other machines' commit logs. Placeholder contract: the
    /// merge semantics belong to integrators; this reports and returns.
    pub fn sync_with_remote(&mut self) -> Result<SyncReport, CommitLogError> {
        debug!("sync_with_remote: no merge strategy configured");
        Ok(SyncReport::default())
    }

    /// Caller-driven auto-sync: runs `sync_with_remote` when the configured
    /// interval has elapsed. Failures are logged and retried next tick.
    pub fn auto_sync_tick(&mut self) -> Option<SyncReport> {
        let interval = self.config.auto_sync_interval_secs;
        if interval == 0 {
            return None;
        }
        let due = self
            .last_sync
            .is_none_or(|t| t.elapsed().as_secs() >= interval);
        if !due {
            return None;
        }
        self.last_sync = Some(Instant::now());
        match self.sync_with_remote() {
            Ok(report) => Some(report),
            Err(e) => {
                // severity medium: retried on the next tick
                warn!(error = %e, "auto-sync failed");
                None
            }
        }
    }
}

/// `NNNNNNN.json` with a 7-digit zero-padded sequence number.
fn is_entry_filename(name: &str) -> bool {
    name.is_ascii()
        && name.len() == 12
        && name.ends_with(".json")
        && name[..7].bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shared(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    fn open_log(root: &Utf8Path) -> CommitLog {
        CommitLog::open(root, "machine-a", CommitLogConfig::default()).unwrap()
    }

    fn payload(n: u64) -> serde_json::Value {
        serde_json::json!({ "setting": "threads", "value": n })
    }

    #[test]
    fn test_append_assigns_dense_sequences() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut log = open_log(&root);

        let r1 = log.append("config_change", payload(1)).unwrap();
        let r2 = log.append("config_change", payload(2)).unwrap();
        let r3 = log.append("config_change", payload(3)).unwrap();
        assert_eq!(r1.sequence_number, 1);
        assert_eq!(r2.sequence_number, 2);
        assert_eq!(r3.sequence_number, 3);

        // Entry files are 7-digit zero-padded
        assert!(root.join("commit-log/0000001.json").exists());
        assert!(root.join("commit-log/0000003.json").exists());
        // Lock released after each append
        assert!(!root.join("commit-log/.lock").exists());
    }

    #[test]
    fn test_append_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));

        let receipt = log.append("config_change", payload(7)).unwrap();
        let entry = log.get(receipt.sequence_number).unwrap();
        assert_eq!(entry.sequence_number, receipt.sequence_number);
        assert_eq!(entry.hash, receipt.hash);
        assert_eq!(entry.status, CommitStatus::Pending);
        assert_eq!(entry.data, payload(7));
        assert_eq!(entry.machine_id, "machine-a");
    }

    #[test]
    fn test_get_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        assert!(log.get(42).is_none());
    }

    #[test]
    fn test_hash_verifies_after_reload() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        {
            let mut log = open_log(&root);
            log.append("config_change", payload(1)).unwrap();
        }
        let log = open_log(&root);
        let report = log.verify_consistency();
        assert!(report.is_consistent, "{:?}", report.inconsistencies);
    }

    #[test]
    fn test_apply_transitions_and_rehashes() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        let receipt = log.append("config_change", payload(1)).unwrap();

        log.apply(receipt.sequence_number).unwrap();
        let entry = log.get(receipt.sequence_number).unwrap();
        assert_eq!(entry.status, CommitStatus::Applied);
        assert_eq!(entry.metadata.applied_by.as_deref(), Some("machine-a"));
        assert!(entry.metadata.applied_at.is_some());
        // Status participates in the hash, so it changed and still verifies
        assert_ne!(entry.hash, receipt.hash);
        assert_eq!(entry.compute_hash().unwrap(), entry.hash);
        assert!(log.verify_consistency().is_consistent);
    }

    #[test]
    fn test_apply_rejects_non_pending() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        let receipt = log.append("config_change", payload(1)).unwrap();

        log.apply(receipt.sequence_number).unwrap();
        let err = log.apply(receipt.sequence_number).unwrap_err();
        assert!(matches!(err, CommitLogError::NotPending { .. }));

        let err = log.apply(99).unwrap_err();
        assert!(matches!(err, CommitLogError::EntryNotFound(99)));
    }

    #[test]
    fn test_apply_pending_sweeps_in_order() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        for n in 1..=3 {
            log.append("config_change", payload(n)).unwrap();
        }
        log.apply(2).unwrap();

        let report = log.apply_pending().unwrap();
        assert_eq!(report.applied, vec![1, 3]);
        assert!(report.failed.is_empty());
        assert!(log.get_pending().is_empty());
    }

    #[test]
    fn test_rollback_from_pending_and_applied() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        log.append("config_change", payload(1)).unwrap();
        log.append("config_change", payload(2)).unwrap();
        log.apply(2).unwrap();

        log.rollback(1, "operator abort").unwrap();
        log.rollback(2, "bad rollout").unwrap();

        let e1 = log.get(1).unwrap();
        assert_eq!(e1.status, CommitStatus::RolledBack);
        assert_eq!(e1.metadata.last_error.as_deref(), Some("operator abort"));

        // RolledBack is terminal
        let err = log.rollback(1, "again").unwrap_err();
        assert!(matches!(err, CommitLogError::Terminal { seq: 1 }));
        assert!(log.verify_consistency().is_consistent);
    }

    #[test]
    fn test_mark_failed_bumps_retry_count() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        log.append("config_change", payload(1)).unwrap();

        log.mark_failed(1, "apply hook exploded").unwrap();
        let entry = log.get(1).unwrap();
        assert_eq!(entry.status, CommitStatus::Failed);
        assert_eq!(entry.metadata.retry_count, Some(1));
        assert_eq!(
            entry.metadata.last_error.as_deref(),
            Some("apply hook exploded")
        );
    }

    #[test]
    fn test_verify_flags_corrupted_hash() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut log = open_log(&root);
        for n in 1..=3 {
            log.append("config_change", payload(n)).unwrap();
        }
        assert!(log.verify_consistency().is_consistent);

        // Corrupt entry 2's hash on disk
        let path = root.join("commit-log/0000002.json");
        let mut entry: CommitEntry =
            serde_json::from_str(&fs::read_to_string(path.as_std_path()).unwrap()).unwrap();
        entry.hash = "0".repeat(64);
        fs::write(
            path.as_std_path(),
            serde_json::to_string_pretty(&entry).unwrap(),
        )
        .unwrap();

        let report = log.verify_consistency();
        assert!(!report.is_consistent);
        let hash_findings: Vec<_> = report
            .inconsistencies
            .iter()
            .filter(|i| i.kind == InconsistencyKind::HashMismatch)
            .collect();
        assert_eq!(hash_findings.len(), 1);
        assert_eq!(hash_findings[0].severity, Severity::High);
        assert_eq!(hash_findings[0].sequence_number, Some(2));
    }

    #[test]
    fn test_verify_flags_sequence_gap() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut log = open_log(&root);
        for n in 1..=3 {
            log.append("config_change", payload(n)).unwrap();
        }
        fs::remove_file(root.join("commit-log/0000002.json").as_std_path()).unwrap();

        let report = log.verify_consistency();
        assert!(
            report
                .inconsistencies
                .iter()
                .any(|i| i.kind == InconsistencyKind::SequenceGap && i.severity == Severity::High)
        );
    }

    #[test]
    fn test_verify_flags_bucket_mismatch() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut log = open_log(&root);
        log.append("config_change", payload(1)).unwrap();
        // Force the bucket out of agreement without going through apply
        log.state.entries_by_status.pending.clear();
        log.state.entries_by_status.applied.push(1);

        let report = log.verify_consistency();
        assert!(
            report
                .inconsistencies
                .iter()
                .any(|i| i.kind == InconsistencyKind::BucketStatusMismatch
                    && i.severity == Severity::Medium)
        );
    }

    #[test]
    fn test_get_latest_pages_ascending() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        for n in 1..=5 {
            log.append("config_change", payload(n)).unwrap();
        }

        let page = log.get_latest(2);
        assert_eq!(
            page.entries
                .iter()
                .map(|e| e.sequence_number)
                .collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert!(page.has_more);
        assert_eq!(page.next_sequence, Some(3));

        let all = log.get_latest(10);
        assert_eq!(all.entries.len(), 5);
        assert!(!all.has_more);
        assert!(all.next_sequence.is_none());
    }

    #[test]
    fn test_get_since_ascending() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        for n in 1..=3 {
            log.append("config_change", payload(n)).unwrap();
        }
        let cutoff = log.get(2).unwrap().timestamp;

        let since = log.get_since(cutoff);
        let seqs: Vec<u64> = since.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_lock_contention_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut log = open_log(&root);

        let _held = WriterLock::acquire(&root.join("commit-log/.lock"), "machine-b").unwrap();
        let err = log.append("config_change", payload(1)).unwrap_err();
        assert!(matches!(err, CommitLogError::LockAcquisitionFailed(_)));
    }

    #[test]
    fn test_compress_old_entries_moves_to_archive() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut config = CommitLogConfig::default();
        config.compression_age_days = 0;
        let mut log = CommitLog::open(&root, "machine-a", config).unwrap();

        log.append("config_change", payload(1)).unwrap();
        log.append("config_change", payload(2)).unwrap();
        log.apply(1).unwrap();
        // Ages entry 1 past the zero-day cutoff
        let mut aged = log.entries.get(&1).unwrap().clone();
        aged.timestamp = aged.timestamp - chrono::Duration::seconds(5);
        aged.rehash().unwrap();
        log.persist_entry(&aged).unwrap();
        log.entries.insert(1, aged);

        let moved = log.compress_old_entries().unwrap();
        assert_eq!(moved, 1);
        assert!(root.join("commit-log/archive/0000001.json").exists());
        assert!(!root.join("commit-log/0000001.json").exists());
        // Pending entry 2 never becomes an archive candidate
        assert!(root.join("commit-log/0000002.json").exists());

        // Archived entries still readable and consistent
        assert!(log.get(1).is_some());
        assert!(log.verify_consistency().is_consistent);
    }

    #[test]
    fn test_cleanup_failed_entries_respects_retry_budget() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut config = CommitLogConfig::default();
        config.max_retry_attempts = 1;
        let mut log = CommitLog::open(&root, "machine-a", config).unwrap();

        log.append("config_change", payload(1)).unwrap();
        log.append("config_change", payload(2)).unwrap();
        log.mark_failed(1, "boom").unwrap();

        let removed = log.cleanup_failed_entries().unwrap();
        assert_eq!(removed, vec![1]);
        assert!(log.get(1).is_none());
        assert!(!root.join("commit-log/0000001.json").exists());
        // Entry 2 untouched
        assert!(log.get(2).is_some());
    }

    #[test]
    fn test_reset_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&shared(&dir));
        log.append("config_change", payload(1)).unwrap();

        let err = log.reset(false).unwrap_err();
        assert!(matches!(err, CommitLogError::ConfirmationRequired));
        assert_eq!(log.state().statistics.total_entries, 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut log = open_log(&root);
        for n in 1..=3 {
            log.append("config_change", payload(n)).unwrap();
        }

        log.reset(true).unwrap();
        assert_eq!(log.state().current_sequence_number, 0);
        assert!(log.get_latest(10).entries.is_empty());
        assert!(!root.join("commit-log/0000001.json").exists());

        // Sequence numbering restarts at 1
        let receipt = log.append("config_change", payload(9)).unwrap();
        assert_eq!(receipt.sequence_number, 1);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        {
            let mut log = open_log(&root);
            log.append("config_change", payload(1)).unwrap();
            log.append("config_change", payload(2)).unwrap();
            log.apply(1).unwrap();
        }

        let mut log = open_log(&root);
        assert_eq!(log.state().current_sequence_number, 2);
        assert_eq!(log.state().entries_by_status.applied, vec![1]);
        assert_eq!(log.state().entries_by_status.pending, vec![2]);
        assert_eq!(log.get(1).unwrap().status, CommitStatus::Applied);

        let receipt = log.append("config_change", payload(3)).unwrap();
        assert_eq!(receipt.sequence_number, 3);
    }

    #[test]
    fn test_entry_json_schema_field_names() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);
        let mut log = open_log(&root);
        log.append("config_change", payload(1)).unwrap();
        log.apply(1).unwrap();

        let raw = fs::read_to_string(root.join("commit-log/0000001.json").as_std_path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["sequenceNumber"], 1);
        assert_eq!(json["type"], "config_change");
        assert_eq!(json["machineId"], "machine-a");
        assert_eq!(json["status"], "applied");
        assert!(json.get("hash").is_some());
        assert!(json["metadata"].get("appliedAt").is_some());
        assert!(json["metadata"].get("appliedBy").is_some());
    }

    #[test]
    fn test_auto_sync_tick_respects_interval() {
        let dir = TempDir::new().unwrap();
        let root = shared(&dir);

        let mut config = CommitLogConfig::default();
        config.auto_sync_interval_secs = 0;
        let mut disabled = CommitLog::open(&root, "machine-a", config).unwrap();
        assert!(disabled.auto_sync_tick().is_none());

        let mut config = CommitLogConfig::default();
        config.auto_sync_interval_secs = 1;
        let mut enabled = CommitLog::open(&root, "machine-a", config).unwrap();
        // First tick is due immediately; the next is within the interval
        assert!(enabled.auto_sync_tick().is_some());
        assert!(enabled.auto_sync_tick().is_none());
    }

    #[test]
    fn test_is_entry_filename() {
        assert!(is_entry_filename("0000001.json"));
        assert!(is_entry_filename("9999999.json"));
        assert!(!is_entry_filename("state.json"));
        assert!(!is_entry_filename("000001.json"));
        assert!(!is_entry_filename("0000001.tmp"));
        assert!(!is_entry_filename(".lock"));
    }
}
