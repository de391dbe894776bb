//! Storage layout and task-folder discovery
//!
//! Two directory families exist: per-machine storage locations holding task
//! folders (plus a `.skeletons/` cache sibling), and the shared-state root
//! holding the commit log and message store. The storage locator is the
//! boundary to the host: it only enumerates paths, never parses content.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

use crate::artifact::{SKELETON_DIR, TaskFolder};
use crate::task_id::TaskId;

/// Enumerates root directories that hold task folders.
///
/// The host extension knows where its conversation archives live; the
/// engine only consumes the resulting paths. Tests substitute a fixed-list
/// locator over a temp dir.
pub trait StorageLocator: Send + Sync {
    /// Root directories holding task folders, in scan order.
    fn locations(&self) -> Vec<Utf8PathBuf>;
}

/// Locator over an explicit list of storage roots.
#[derive(Debug, Clone, Default)]
pub struct FsStorageLocator {
    roots: Vec<Utf8PathBuf>,
}

impl FsStorageLocator {
    #[must_use]
    pub fn new(roots: Vec<Utf8PathBuf>) -> Self {
        Self { roots }
    }

    #[must_use]
    pub fn single(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
        }
    }
}

impl StorageLocator for FsStorageLocator {
    fn locations(&self) -> Vec<Utf8PathBuf> {
        self.roots.clone()
    }
}

/// Discover task folders under one storage root: directories whose name is
/// a valid task id. Everything else (including `.skeletons/`) is skipped.
/// A missing root yields an empty list; first runs have nothing to scan.
#[must_use]
pub fn discover_task_folders(root: &Utf8Path) -> Vec<TaskFolder> {
    let Ok(entries) = fs::read_dir(root.as_std_path()) else {
        return Vec::new();
    };

    let mut folders: Vec<TaskFolder> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            let task_id = TaskId::parse(name).ok()?;
            Some(TaskFolder::new(task_id, root.join(name)))
        })
        .collect();

    // Deterministic scan order regardless of filesystem enumeration
    folders.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    folders
}

/// `.skeletons/` cache directory adjacent to a storage root's task folders.
#[must_use]
pub fn skeleton_dir(root: &Utf8Path) -> Utf8PathBuf {
    root.join(SKELETON_DIR)
}

/// `<shared>/commit-log/` directory.
#[must_use]
pub fn commit_log_dir(shared_root: &Utf8Path) -> Utf8PathBuf {
    shared_root.join("commit-log")
}

/// `<shared>/messages/` directory.
#[must_use]
pub fn messages_dir(shared_root: &Utf8Path) -> Utf8PathBuf {
    shared_root.join("messages")
}
