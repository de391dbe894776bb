//! Writer lock for shared-state directories
//!
//! The commit log enforces single-writer discipline with a `.lock` file on
//! the shared filesystem. Acquisition is exclusive-create: if the file
//! already exists, another machine holds the lock and the caller fails
//! immediately; there is no retry and no stealing. Operators clear stale
//! locks manually. Readers never lock.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};

/// Holder information stored inside the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Machine that created the lock
    pub machine_id: String,
    /// When the lock was created
    pub timestamp: DateTime<Utc>,
}

/// Lock errors for shared-state lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock acquisition failed: held by '{holder}' since {since}")]
    AcquisitionFailed { holder: String, since: String },

    #[error("Lock acquisition failed: lock file exists but is unreadable")]
    AcquisitionFailedUnreadable,

    #[error("Failed to release lock: {reason}")]
    ReleaseFailed { reason: String },

    #[error("IO error during lock operation: {0}")]
    Io(#[from] io::Error),
}

/// An acquired writer lock. Dropping the guard removes the lock file.
#[derive(Debug)]
pub struct WriterLock {
    path: Utf8PathBuf,
    info: LockInfo,
    released: bool,
}

impl WriterLock {
    /// Attempt to acquire the lock at `path` for `machine_id`.
    ///
    /// Creates the lock file with exclusive-create semantics and writes the
    /// holder info as JSON. Contention is reported immediately with the
    /// current holder when the existing file can be read.
    ///
    /// # Errors
    ///
    /// `AcquisitionFailed` when another writer holds the lock; `Io` for
    /// filesystem failures.
    pub fn acquire(path: &Utf8Path, machine_id: &str) -> Result<Self, LockError> {
        let info = LockInfo {
            machine_id: machine_id.to_string(),
            timestamp: Utc::now(),
        };

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
        {
            Ok(mut file) => {
                let payload = serde_json::to_string(&info)
                    .map_err(|e| LockError::Io(io::Error::other(e)))?;
                file.write_all(payload.as_bytes())?;
                file.sync_all()?;
                Ok(Self {
                    path: path.to_owned(),
                    info,
                    released: false,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Self::contention_error(path)),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn contention_error(path: &Utf8Path) -> LockError {
        match fs::read_to_string(path.as_std_path()) {
            Ok(content) => match serde_json::from_str::<LockInfo>(&content) {
                Ok(holder) => LockError::AcquisitionFailed {
                    holder: holder.machine_id,
                    since: holder.timestamp.to_rfc3339(),
                },
                Err(_) => LockError::AcquisitionFailedUnreadable,
            },
            Err(_) => LockError::AcquisitionFailedUnreadable,
        }
    }

    /// Holder info recorded at acquisition time.
    #[must_use]
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Release the lock explicitly, surfacing removal failures.
    ///
    /// Dropping the guard also releases, but swallows errors; call this when
    /// the caller needs to know the lock file is gone.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        fs::remove_file(self.path.as_std_path()).map_err(|e| LockError::ReleaseFailed {
            reason: e.to_string(),
        })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(self.path.as_std_path());
        }
    }
}
