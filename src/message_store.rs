//! Inter-machine messaging over shared storage
//!
//! File-backed inbox/sent/archive triad: every message is one JSON file
//! named by its collision-free id, duplicated between the recipient's inbox
//! view and the sender's sent view. Message operations touch disjoint files,
//! so no store-wide lock exists; writes go through the atomic temp-rename
//! path.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use taskloom_utils::atomic_write::write_file_atomic;
use taskloom_utils::error::{ErrorCategory, UserFriendlyError};

use crate::artifact::read_json_artifact;
use crate::instruction::truncate_chars;
use crate::paths::messages_dir;

/// Inbox subdirectory.
pub const INBOX_DIR: &str = "inbox";
/// Sent subdirectory.
pub const SENT_DIR: &str = "sent";
/// Archive subdirectory.
pub const ARCHIVE_DIR: &str = "archive";

/// Characters of a body shown in list previews.
const PREVIEW_CHARS: usize = 100;

/// Attempts at drawing a fresh random suffix before giving up.
const ID_RETRY_LIMIT: usize = 16;

static MESSAGE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^msg-\d{8}T\d{6}-[a-z0-9]{6}$").expect("message id regex is valid")
});

const SUFFIX_ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Message priority. Defaults to `Medium`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessagePriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Message lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Unread,
    Read,
    Archived,
}

/// Amendment bookkeeping stored under `metadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Body before the first amendment; set once and never overwritten
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amended: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amendment_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amendment_timestamp: Option<DateTime<Utc>>,
}

impl MessageMetadata {
    fn is_empty(&self) -> bool {
        self.original_content.is_none()
            && self.amended.is_none()
            && self.amendment_reason.is_none()
            && self.amendment_timestamp.is_none()
    }
}

/// One message, as stored in all three buckets. The inbox and sent copies
/// of an id may diverge only in `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
}

/// List-item view returned by inbox reads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListItem {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    /// Body truncated at 100 characters, `...` appended when truncated
    pub preview: String,
}

/// Status filter for inbox reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    Unread,
    Read,
    #[default]
    All,
}

/// Optional send parameters.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: Option<MessagePriority>,
    pub tags: Vec<String>,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
}

/// Message-store operation errors
#[derive(Debug, thiserror::Error)]
pub enum MessageStoreError {
    #[error("Message store is uninitialized: {reason}")]
    Uninitialized { reason: String },

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Message {0} has been read; amendment is no longer allowed")]
    AlreadyRead(String),

    #[error("Machine '{caller}' is not the sender of message {id} (sent by '{sender}')")]
    NotSender {
        id: String,
        sender: String,
        caller: String,
    },

    #[error("Could not generate a collision-free message id")]
    IdExhausted,

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

impl UserFriendlyError for MessageStoreError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::AlreadyRead(_) => Some(
                "Messages can only be amended while the recipient's copy is unread.".to_string(),
            ),
            Self::NotSender { .. } => {
                Some("Only the sending machine may amend a message.".to_string())
            }
            _ => None,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_)
            | Self::AlreadyRead(_)
            | Self::NotSender { .. }
            | Self::Uninitialized { .. } => ErrorCategory::State,
            _ => ErrorCategory::Input,
        }
    }
}

/// Whether a string has the stored-message id shape.
#[must_use]
pub fn is_valid_message_id(id: &str) -> bool {
    MESSAGE_ID_RE.is_match(id)
}

/// File-backed message store for one machine.
pub struct MessageStore {
    root: Utf8PathBuf,
    machine_id: String,
}

impl MessageStore {
    /// Open (creating if needed) the store under `<shared>/messages/`.
    pub fn open(
        shared_root: &Utf8Path,
        machine_id: impl Into<String>,
    ) -> Result<Self, MessageStoreError> {
        let root = messages_dir(shared_root);
        for dir in [INBOX_DIR, SENT_DIR, ARCHIVE_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(path.as_std_path()).map_err(|e| {
                MessageStoreError::Uninitialized {
                    reason: format!("cannot create {path}: {e}"),
                }
            })?;
        }
        Ok(Self {
            root,
            machine_id: machine_id.into(),
        })
    }

    #[must_use]
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn bucket_path(&self, bucket: &str, id: &str) -> Utf8PathBuf {
        self.root.join(bucket).join(format!("{id}.json"))
    }

    /// `msg-YYYYMMDDThhmmss-<6 lowercase alphanumerics>`, retried until the
    /// id is unused in all three buckets.
    fn generate_message_id(&self, now: DateTime<Utc>) -> Result<String, MessageStoreError> {
        let stamp = now.format("%Y%m%dT%H%M%S");
        for _ in 0..ID_RETRY_LIMIT {
            let entropy = Uuid::new_v4();
            let suffix: String = entropy.as_bytes()[..6]
                .iter()
                .map(|b| SUFFIX_ALPHABET[usize::from(*b) % SUFFIX_ALPHABET.len()] as char)
                .collect();
            let id = format!("msg-{stamp}-{suffix}");
            let collision = [INBOX_DIR, SENT_DIR, ARCHIVE_DIR]
                .iter()
                .any(|bucket| self.bucket_path(bucket, &id).exists());
            if !collision {
                return Ok(id);
            }
            debug!(id, "message id collision, retrying");
        }
        Err(MessageStoreError::IdExhausted)
    }

    fn write_message(&self, bucket: &str, message: &Message) -> Result<(), MessageStoreError> {
        let path = self.bucket_path(bucket, &message.id);
        let json = serde_json::to_string_pretty(message).map_err(|e| {
            MessageStoreError::Serialization {
                reason: e.to_string(),
            }
        })?;
        write_file_atomic(&path, &json).map_err(|e| MessageStoreError::Persist {
            path,
            reason: e.to_string(),
        })
    }

    fn read_bucket(&self, bucket: &str, id: &str) -> Option<Message> {
        let path = self.bucket_path(bucket, id);
        read_json_artifact(&path).ok()
    }

    /// Send a message from this machine. Writes the recipient's inbox copy
    /// and the sender's sent copy; the inbox copy is skipped when the
    /// sender addresses itself (the sender-owned broadcast case).
    pub fn send(
        &self,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        options: SendOptions,
    ) -> Result<Message, MessageStoreError> {
        let now = Utc::now();
        let id = self.generate_message_id(now)?;
        let to = to.into();

        let message = Message {
            id,
            from: self.machine_id.clone(),
            to: to.clone(),
            subject: subject.into(),
            body: body.into(),
            priority: options.priority.unwrap_or_default(),
            status: MessageStatus::Unread,
            timestamp: now,
            tags: options.tags,
            thread_id: options.thread_id,
            reply_to: options.reply_to,
            metadata: MessageMetadata::default(),
        };

        if to != self.machine_id {
            self.write_message(INBOX_DIR, &message)?;
        }
        self.write_message(SENT_DIR, &message)?;
        info!(id = %message.id, to = %message.to, "message sent");
        Ok(message)
    }

    /// Reply to a message: a send with `reply_to` set and the thread
    /// inherited (the original message starts a thread if it had none).
    pub fn reply(
        &self,
        id: &str,
        body: impl Into<String>,
        mut options: SendOptions,
    ) -> Result<Message, MessageStoreError> {
        let original = self
            .get_message(id)
            .ok_or_else(|| MessageStoreError::NotFound(id.to_string()))?;

        options.reply_to = Some(original.id.clone());
        options.thread_id = options
            .thread_id
            .or(original.thread_id.clone())
            .or_else(|| Some(original.id.clone()));

        let subject = if original.subject.starts_with("Re: ") {
            original.subject.clone()
        } else {
            format!("Re: {}", original.subject)
        };

        self.send(original.from.clone(), subject, body, options)
    }

    /// Scan the inbox for one recipient, newest first.
    #[must_use]
    pub fn read_inbox(
        &self,
        recipient: &str,
        status_filter: StatusFilter,
        limit: Option<usize>,
    ) -> Vec<MessageListItem> {
        let mut messages: Vec<Message> = self
            .scan_bucket(INBOX_DIR)
            .into_iter()
            .filter(|m| m.to == recipient)
            .filter(|m| match status_filter {
                StatusFilter::Unread => m.status == MessageStatus::Unread,
                StatusFilter::Read => m.status == MessageStatus::Read,
                StatusFilter::All => true,
            })
            .collect();

        messages.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = limit {
            messages.truncate(limit);
        }

        messages
            .into_iter()
            .map(|m| {
                let truncated = truncate_chars(&m.body, PREVIEW_CHARS);
                let preview = if truncated.chars().count() < m.body.chars().count() {
                    format!("{truncated}...")
                } else {
                    truncated
                };
                MessageListItem {
                    id: m.id,
                    from: m.from,
                    subject: m.subject,
                    priority: m.priority,
                    status: m.status,
                    timestamp: m.timestamp,
                    preview,
                }
            })
            .collect()
    }

    /// Find a message by id: inbox, then sent, then archive.
    #[must_use]
    pub fn get_message(&self, id: &str) -> Option<Message> {
        [INBOX_DIR, SENT_DIR, ARCHIVE_DIR]
            .iter()
            .find_map(|bucket| self.read_bucket(bucket, id))
    }

    /// Transition `unread → read` on the inbox copy and the sent copy if
    /// present. Idempotent: an already-read message is a no-op success.
    pub fn mark_as_read(&self, id: &str) -> Result<bool, MessageStoreError> {
        if self.get_message(id).is_none() {
            return Err(MessageStoreError::NotFound(id.to_string()));
        }

        for bucket in [INBOX_DIR, SENT_DIR] {
            if let Some(mut message) = self.read_bucket(bucket, id)
                && message.status == MessageStatus::Unread
            {
                message.status = MessageStatus::Read;
                self.write_message(bucket, &message)?;
            }
        }
        Ok(true)
    }

    /// Move the inbox copy into `archive/` with `status = archived`. The
    /// sent copy is left as is. Idempotent: a second invocation finds the
    /// file already archived and succeeds.
    pub fn archive_message(&self, id: &str) -> Result<(), MessageStoreError> {
        if self.read_bucket(ARCHIVE_DIR, id).is_some() {
            return Ok(());
        }

        let mut message = self
            .read_bucket(INBOX_DIR, id)
            .ok_or_else(|| MessageStoreError::NotFound(id.to_string()))?;
        message.status = MessageStatus::Archived;

        // Archive copy lands before the inbox file goes away; readers
        // prefer inbox, so the transient overlap is harmless.
        self.write_message(ARCHIVE_DIR, &message)?;
        let inbox_path = self.bucket_path(INBOX_DIR, id);
        fs::remove_file(inbox_path.as_std_path()).map_err(|e| MessageStoreError::Io {
            path: inbox_path,
            source: e,
        })?;
        info!(id, "message archived");
        Ok(())
    }

    /// Amend a sent message while the recipient has not read it.
    ///
    /// Allowed only when the sent copy exists, this machine is the sender,
    /// and the recipient's inbox copy (when one was delivered) is still
    /// unread. The first amendment preserves the original body under
    /// `metadata.original_content`. The sent copy is written first, so a
    /// crash leaves `sent/` authoritative and `inbox/` stale.
    pub fn amend(
        &self,
        id: &str,
        new_body: impl Into<String>,
        reason: Option<String>,
    ) -> Result<Message, MessageStoreError> {
        let mut sent = self
            .read_bucket(SENT_DIR, id)
            .ok_or_else(|| MessageStoreError::NotFound(id.to_string()))?;

        if sent.from != self.machine_id {
            return Err(MessageStoreError::NotSender {
                id: id.to_string(),
                sender: sent.from,
                caller: self.machine_id.clone(),
            });
        }

        let inbox = self.read_bucket(INBOX_DIR, id);
        match &inbox {
            Some(copy) if copy.status != MessageStatus::Unread => {
                return Err(MessageStoreError::AlreadyRead(id.to_string()));
            }
            Some(_) => {}
            None => {
                // No inbox copy: archived means the recipient consumed it;
                // a never-delivered self-send stays amendable
                if self.read_bucket(ARCHIVE_DIR, id).is_some() {
                    return Err(MessageStoreError::AlreadyRead(id.to_string()));
                }
            }
        }

        if sent.metadata.original_content.is_none() {
            sent.metadata.original_content = Some(sent.body.clone());
        }
        sent.body = new_body.into();
        sent.metadata.amended = Some(true);
        sent.metadata.amendment_reason = reason;
        sent.metadata.amendment_timestamp = Some(Utc::now());

        self.write_message(SENT_DIR, &sent)?;
        if let Some(mut inbox_copy) = inbox {
            inbox_copy.body = sent.body.clone();
            inbox_copy.metadata = sent.metadata.clone();
            self.write_message(INBOX_DIR, &inbox_copy)?;
        }
        info!(id, "message amended");
        Ok(sent)
    }

    /// Every message of one thread, ascending by timestamp. A thread is
    /// the set of messages whose `thread_id` is the given id, plus the
    /// thread-starting message itself.
    #[must_use]
    pub fn get_thread(&self, thread_id: &str) -> Vec<Message> {
        let mut seen = std::collections::BTreeMap::new();
        for bucket in [INBOX_DIR, SENT_DIR, ARCHIVE_DIR] {
            for message in self.scan_bucket(bucket) {
                let in_thread = message.thread_id.as_deref() == Some(thread_id)
                    || message.id == thread_id;
                if in_thread {
                    seen.entry(message.id.clone()).or_insert(message);
                }
            }
        }
        let mut thread: Vec<Message> = seen.into_values().collect();
        thread.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        thread
    }

    fn scan_bucket(&self, bucket: &str) -> Vec<Message> {
        let dir = self.root.join(bucket);
        let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let id = name.strip_suffix(".json")?;
                if !is_valid_message_id(id) {
                    return None;
                }
                self.read_bucket(bucket, id)
            })
            .collect()
    }
}
