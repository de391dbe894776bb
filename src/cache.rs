//! Skeleton cache: the single owner of every skeleton
//!
//! Process-wide map from task id to skeleton, persisted as one JSON file
//! per skeleton under `.skeletons/` adjacent to each storage location.
//! Writers go through the engine; readers take cloned snapshots. The cache
//! is constructor-injected (no hidden global) so tests run isolated copies.

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashMap;
use std::fs;
use std::sync::RwLock;

use tracing::{debug, info};

use taskloom_utils::atomic_write::write_file_atomic;
use taskloom_utils::error::{ErrorCategory, UserFriendlyError};

use crate::artifact::{
    API_HISTORY_FILE, TaskFolder, UI_MESSAGES_FILE, read_json_artifact,
};
use crate::config::EngineConfig;
use crate::engine::{CancelFlag, ReconstructionEngine, ReconstructionReport};
use crate::paths::{StorageLocator, discover_task_folders, skeleton_dir};
use crate::skeleton::build_skeleton;
use crate::task_id::TaskId;
use crate::types::ConversationSkeleton;

/// Cache operation errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Task not found in cache: {0}")]
    TaskNotFound(TaskId),

    #[error("Failed to persist skeleton {task_id}: {reason}")]
    PersistFailed { task_id: TaskId, reason: String },

    #[error("IO error under {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache map lock poisoned")]
    Poisoned,
}

impl UserFriendlyError for CacheError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::TaskNotFound(_) => ErrorCategory::State,
            _ => ErrorCategory::Consistency,
        }
    }
}

/// Outcome of a single-task refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Source checksums matched; nothing to do
    Unchanged,
    /// Source changed; skeleton was rebuilt and hierarchy re-resolved
    Refreshed,
}

/// Sort key for conversation listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    LastActivity,
    MessageCount,
    TotalSize,
}

/// Filters for [`SkeletonCache::list_conversations`].
#[derive(Debug, Clone, Default)]
pub struct ConversationFilters {
    /// Keep only tasks with (or without) an API-message log
    pub has_api_history: Option<bool>,
    /// Keep only tasks with (or without) a UI-message log
    pub has_ui_messages: Option<bool>,
    pub sort_by: SortBy,
    pub descending: bool,
    pub limit: Option<usize>,
}

/// On-disk and in-memory skeleton store with incremental refresh.
pub struct SkeletonCache {
    locator: Box<dyn StorageLocator>,
    engine_config: EngineConfig,
    skeletons: RwLock<HashMap<TaskId, ConversationSkeleton>>,
}

impl SkeletonCache {
    #[must_use]
    pub fn new(locator: Box<dyn StorageLocator>, engine_config: EngineConfig) -> Self {
        Self {
            locator,
            engine_config,
            skeletons: RwLock::new(HashMap::new()),
        }
    }

    /// Populate the map from `.skeletons/` shards. Missing directories are
    /// not errors: first runs have nothing persisted yet.
    pub fn load_from_disk(&self) -> Result<usize, CacheError> {
        let mut loaded = 0;

        for location in self.locator.locations() {
            let dir = skeleton_dir(&location);
            let entries = match fs::read_dir(dir.as_std_path()) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CacheError::Io { path: dir, source: e }),
            };

            for entry in entries.filter_map(Result::ok) {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if !name.ends_with(".json") {
                    continue;
                }
                let path = dir.join(&name);
                match read_json_artifact::<ConversationSkeleton>(&path) {
                    Ok(skeleton) => {
                        self.insert(skeleton)?;
                        loaded += 1;
                    }
                    Err(e) => {
                        // One corrupt shard never blocks startup
                        debug!(shard = %path, error = %e, "skipping unreadable skeleton shard");
                    }
                }
            }
        }

        info!(loaded, "skeleton cache loaded");
        Ok(loaded)
    }

    /// Wipe `.skeletons/` everywhere, rescan every task folder, re-run the
    /// engine, and persist the result.
    pub fn rebuild(&self, cancel: &CancelFlag) -> Result<ReconstructionReport, CacheError> {
        for location in self.locator.locations() {
            let dir = skeleton_dir(&location);
            match fs::remove_dir_all(dir.as_std_path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::Io { path: dir, source: e }),
            }
        }
        self.skeletons
            .write()
            .map_err(|_| CacheError::Poisoned)?
            .clear();

        self.scan_internal(cancel, true)
    }

    /// Incremental scan: skeletons whose source checksums are unchanged are
    /// reused; new or changed tasks re-run extraction. `force_rebuild` in
    /// the engine config overrides reuse.
    pub fn scan(&self, cancel: &CancelFlag) -> Result<ReconstructionReport, CacheError> {
        self.scan_internal(cancel, self.engine_config.force_rebuild)
    }

    fn scan_internal(
        &self,
        cancel: &CancelFlag,
        force_rebuild: bool,
    ) -> Result<ReconstructionReport, CacheError> {
        let mut engine = ReconstructionEngine::new(self.engine_config.clone());
        let mut skeletons: Vec<ConversationSkeleton> = Vec::new();

        for location in self.locator.locations() {
            for folder in discover_task_folders(&location) {
                let reused = if force_rebuild {
                    None
                } else {
                    self.get(&folder.task_id)
                        .filter(|cached| !source_changed(cached, &folder))
                };

                let skeleton = match reused {
                    Some(cached) => cached,
                    None => build_skeleton(&folder, &location),
                };

                if engine.includes_workspace(skeleton.metadata.workspace.as_deref()) {
                    skeletons.push(skeleton);
                }
            }
        }

        let report = engine.run(&mut skeletons, cancel);

        // Partial progress persists on cancel: every skeleton that finished
        // both phases is written.
        for skeleton in &skeletons {
            if skeleton.processing_state.phase1_completed {
                self.persist(skeleton)?;
                self.insert(skeleton.clone())?;
            }
        }

        Ok(report)
    }

    /// Compare one task's on-disk sources against the cached checksums and
    /// re-run extraction plus hierarchy resolution when they differ.
    pub fn refresh(&self, task_id: &TaskId) -> Result<RefreshOutcome, CacheError> {
        let cached = self
            .get(task_id)
            .ok_or_else(|| CacheError::TaskNotFound(task_id.clone()))?;

        let location = Utf8PathBuf::from(&cached.metadata.data_source);
        let folder = TaskFolder::new(task_id.clone(), location.join(task_id.as_str()));

        if !source_changed(&cached, &folder) {
            return Ok(RefreshOutcome::Unchanged);
        }

        // Re-extract this task, then re-resolve the whole in-memory set;
        // the index is cheap to rebuild and stale links must clear.
        let rebuilt = build_skeleton(&folder, &location);
        self.insert(rebuilt)?;

        let mut skeletons = self.snapshot();
        skeletons.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let mut engine = ReconstructionEngine::new(self.engine_config.clone());
        engine.run(&mut skeletons, &CancelFlag::new());

        for skeleton in &skeletons {
            self.persist(skeleton)?;
            self.insert(skeleton.clone())?;
        }

        Ok(RefreshOutcome::Refreshed)
    }

    /// Cloned snapshot of one skeleton.
    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<ConversationSkeleton> {
        self.skeletons
            .read()
            .ok()
            .and_then(|map| map.get(task_id).cloned())
    }

    /// Cloned snapshot of the whole cache, in unspecified order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConversationSkeleton> {
        self.skeletons
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of cached skeletons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.skeletons.read().map(|map| map.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Children of a task: a single pass over the cache filtering on the
    /// effective parent link. No back-pointers are stored.
    #[must_use]
    pub fn children_of(&self, task_id: &TaskId) -> Vec<ConversationSkeleton> {
        let mut children: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|s| s.effective_parent() == Some(task_id))
            .collect();
        children.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        children
    }

    /// Filtered, sorted snapshots for navigation.
    #[must_use]
    pub fn list_conversations(&self, filters: &ConversationFilters) -> Vec<ConversationSkeleton> {
        let mut conversations: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|s| {
                filters.has_api_history.is_none_or(|wanted| {
                    s.source_file_checksums.contains_key(API_HISTORY_FILE) == wanted
                })
            })
            .filter(|s| {
                filters.has_ui_messages.is_none_or(|wanted| {
                    s.source_file_checksums.contains_key(UI_MESSAGES_FILE) == wanted
                })
            })
            .collect();

        conversations.sort_by(|a, b| {
            let ordering = match filters.sort_by {
                SortBy::LastActivity => a.metadata.last_activity.cmp(&b.metadata.last_activity),
                SortBy::MessageCount => a.metadata.message_count.cmp(&b.metadata.message_count),
                SortBy::TotalSize => a.metadata.total_size.cmp(&b.metadata.total_size),
            };
            // Stable tie-break keeps listings deterministic
            let ordering = ordering.then_with(|| a.task_id.cmp(&b.task_id));
            if filters.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        if let Some(limit) = filters.limit {
            conversations.truncate(limit);
        }
        conversations
    }

    /// The skeleton with the most recent activity, for default tree views.
    #[must_use]
    pub fn most_recent(&self) -> Option<ConversationSkeleton> {
        self.snapshot()
            .into_iter()
            .max_by(|a, b| {
                a.metadata
                    .last_activity
                    .cmp(&b.metadata.last_activity)
                    .then_with(|| a.task_id.cmp(&b.task_id))
            })
    }

    /// Insert or replace one skeleton in the in-memory map.
    pub fn insert(&self, skeleton: ConversationSkeleton) -> Result<(), CacheError> {
        self.skeletons
            .write()
            .map_err(|_| CacheError::Poisoned)?
            .insert(skeleton.task_id.clone(), skeleton);
        Ok(())
    }

    /// Write one skeleton shard atomically under its location's
    /// `.skeletons/` directory.
    fn persist(&self, skeleton: &ConversationSkeleton) -> Result<(), CacheError> {
        let dir = skeleton_dir(Utf8Path::new(&skeleton.metadata.data_source));
        let path = dir.join(format!("{}.json", skeleton.task_id));
        let json = serde_json::to_string_pretty(skeleton).map_err(|e| {
            CacheError::PersistFailed {
                task_id: skeleton.task_id.clone(),
                reason: e.to_string(),
            }
        })?;
        write_file_atomic(&path, &json).map_err(|e| CacheError::PersistFailed {
            task_id: skeleton.task_id.clone(),
            reason: e.to_string(),
        })
    }
}

/// Whether a task folder's current files disagree with cached checksums.
fn source_changed(cached: &ConversationSkeleton, folder: &TaskFolder) -> bool {
    use taskloom_utils::canonical::sha256_hex;

    let current = folder.source_files();
    if current.len() != cached.source_file_checksums.len() {
        return true;
    }
    for (name, _) in &current {
        let Some(stored) = cached.source_file_checksums.get(name) else {
            return true;
        };
        match folder.read_raw(name) {
            Ok(bytes) => {
                if sha256_hex(&bytes) != *stored {
                    return true;
                }
            }
            Err(_) => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::FsStorageLocator;
    use std::fs;
    use tempfile::TempDir;

    fn task_name(n: u8) -> String {
        format!("{n:08x}-0000-4000-8000-00000000000{}", n % 10)
    }

    struct Fixture {
        _dir: TempDir,
        root: Utf8PathBuf,
        cache: SkeletonCache,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cache = SkeletonCache::new(
            Box::new(FsStorageLocator::single(root.clone())),
            EngineConfig::default(),
        );
        Fixture {
            _dir: dir,
            root,
            cache,
        }
    }

    fn seed_task(root: &Utf8Path, id: &str, instruction: &str, child_launch: Option<&str>) {
        let folder = root.join(id);
        fs::create_dir_all(folder.as_std_path()).unwrap();
        let mut records = vec![serde_json::json!({
            "type": "say", "say": "text", "text": instruction, "ts": 1000
        })];
        if let Some(launch) = child_launch {
            records.push(serde_json::json!({
                "type": "say",
                "say": "text",
                "text": format!("<new_task><message>{launch}</message></new_task>"),
                "ts": 2000
            }));
        }
        fs::write(
            folder.join(UI_MESSAGES_FILE).as_std_path(),
            serde_json::to_string(&records).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_rebuild_persists_and_links() {
        let fx = fixture();
        let parent = task_name(1);
        let child = task_name(2);
        seed_task(
            &fx.root,
            &parent,
            "the root instruction of the tree",
            Some("implement the child feature"),
        );
        seed_task(&fx.root, &child, "implement the child feature", None);

        let report = fx.cache.rebuild(&CancelFlag::new()).unwrap();
        assert_eq!(report.phase1.processed_count, 2);
        assert_eq!(report.phase2.resolved_count, 1);

        let child_id = TaskId::parse(&child).unwrap();
        let skeleton = fx.cache.get(&child_id).unwrap();
        assert_eq!(
            skeleton.reconstructed_parent_id.as_ref().unwrap().as_str(),
            parent
        );

        // Shards landed on disk
        assert!(skeleton_dir(&fx.root).join(format!("{child}.json")).exists());
    }

    #[test]
    fn test_load_from_disk_round_trip() {
        let fx = fixture();
        seed_task(&fx.root, &task_name(1), "a task instruction to persist", None);
        fx.cache.rebuild(&CancelFlag::new()).unwrap();
        let before = fx.cache.snapshot();

        let reloaded = SkeletonCache::new(
            Box::new(FsStorageLocator::single(fx.root.clone())),
            EngineConfig::default(),
        );
        let loaded = reloaded.load_from_disk().unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(reloaded.snapshot(), before);
    }

    #[test]
    fn test_load_missing_dirs_not_error() {
        let fx = fixture();
        assert_eq!(fx.cache.load_from_disk().unwrap(), 0);
    }

    #[test]
    fn test_incremental_scan_is_byte_stable() {
        let fx = fixture();
        seed_task(&fx.root, &task_name(1), "stable instruction for this task", None);

        fx.cache.scan(&CancelFlag::new()).unwrap();
        let shard = skeleton_dir(&fx.root).join(format!("{}.json", task_name(1)));
        let first = fs::read(shard.as_std_path()).unwrap();

        fx.cache.scan(&CancelFlag::new()).unwrap();
        let second = fs::read(shard.as_std_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_refresh_unchanged_is_noop() {
        let fx = fixture();
        seed_task(&fx.root, &task_name(1), "instruction that will not change", None);
        fx.cache.rebuild(&CancelFlag::new()).unwrap();

        let id = TaskId::parse(&task_name(1)).unwrap();
        assert_eq!(fx.cache.refresh(&id).unwrap(), RefreshOutcome::Unchanged);
    }

    #[test]
    fn test_refresh_detects_source_change() {
        let fx = fixture();
        seed_task(&fx.root, &task_name(1), "the original instruction text", None);
        fx.cache.rebuild(&CancelFlag::new()).unwrap();

        seed_task(&fx.root, &task_name(1), "a replacement instruction text", None);
        let id = TaskId::parse(&task_name(1)).unwrap();
        assert_eq!(fx.cache.refresh(&id).unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(
            fx.cache.get(&id).unwrap().truncated_instruction.as_deref(),
            Some("a replacement instruction text")
        );
    }

    #[test]
    fn test_refresh_unknown_task_fails() {
        let fx = fixture();
        let id = TaskId::parse(&task_name(9)).unwrap();
        assert!(matches!(
            fx.cache.refresh(&id),
            Err(CacheError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_list_conversations_sorting_and_limit() {
        let fx = fixture();
        for (n, ts) in [(1u8, 1000i64), (2, 3000), (3, 2000)] {
            let folder = fx.root.join(task_name(n));
            fs::create_dir_all(folder.as_std_path()).unwrap();
            fs::write(
                folder.join(UI_MESSAGES_FILE).as_std_path(),
                serde_json::to_string(&vec![serde_json::json!({
                    "type": "say", "say": "text",
                    "text": format!("instruction number {n} long enough"),
                    "ts": ts
                })])
                .unwrap(),
            )
            .unwrap();
        }
        fx.cache.rebuild(&CancelFlag::new()).unwrap();

        let filters = ConversationFilters {
            sort_by: SortBy::LastActivity,
            descending: true,
            limit: Some(2),
            ..ConversationFilters::default()
        };
        let listed = fx.cache.list_conversations(&filters);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].task_id.as_str(), task_name(2));
        assert_eq!(listed[1].task_id.as_str(), task_name(3));
    }

    #[test]
    fn test_list_conversations_api_history_filter() {
        let fx = fixture();
        seed_task(&fx.root, &task_name(1), "task without api history at all", None);
        seed_task(&fx.root, &task_name(2), "task carrying an api history log", None);
        fs::write(
            fx.root
                .join(task_name(2))
                .join(API_HISTORY_FILE)
                .as_std_path(),
            b"[]",
        )
        .unwrap();
        fx.cache.rebuild(&CancelFlag::new()).unwrap();

        let filters = ConversationFilters {
            has_api_history: Some(true),
            ..ConversationFilters::default()
        };
        let listed = fx.cache.list_conversations(&filters);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id.as_str(), task_name(2));
    }

    #[test]
    fn test_children_of() {
        let fx = fixture();
        seed_task(
            &fx.root,
            &task_name(1),
            "parent root instruction here",
            Some("shared child instruction body"),
        );
        seed_task(&fx.root, &task_name(2), "shared child instruction body", None);
        fx.cache.rebuild(&CancelFlag::new()).unwrap();

        let parent_id = TaskId::parse(&task_name(1)).unwrap();
        let children = fx.cache.children_of(&parent_id);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].task_id.as_str(), task_name(2));
    }

    #[test]
    fn test_most_recent() {
        let fx = fixture();
        seed_task(&fx.root, &task_name(1), "an instruction for task one", None);
        fx.cache.rebuild(&CancelFlag::new()).unwrap();
        assert_eq!(
            fx.cache.most_recent().unwrap().task_id.as_str(),
            task_name(1)
        );
    }
}
