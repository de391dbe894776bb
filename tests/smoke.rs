//! One pass through every subsystem: scan archives, reconstruct, render,
//! exchange commit entries and messages, and snapshot status.

use camino::Utf8PathBuf;
use std::fs;
use tempfile::TempDir;

use taskloom::cache::{ConversationFilters, SkeletonCache, SortBy};
use taskloom::commit_log::{CommitLog, CommitStatus};
use taskloom::config::{CommitLogConfig, EngineConfig};
use taskloom::engine::CancelFlag;
use taskloom::message_store::{MessageStore, SendOptions, StatusFilter};
use taskloom::paths::FsStorageLocator;
use taskloom::status::StatusReport;
use taskloom::task_id::TaskId;
use taskloom::tree::{ViewMode, view_conversation_tree};

const PARENT: &str = "0000aaaa-0000-4000-8000-0000000000aa";
const CHILD: &str = "0000bbbb-0000-4000-8000-0000000000bb";

#[test]
fn test_full_system_smoke() {
    let storage_dir = TempDir::new().unwrap();
    let shared_dir = TempDir::new().unwrap();
    let storage = Utf8PathBuf::from_path_buf(storage_dir.path().to_path_buf()).unwrap();
    let shared = Utf8PathBuf::from_path_buf(shared_dir.path().to_path_buf()).unwrap();

    // Two archived conversations: the parent launched the child
    let child_instruction = "implement the archive scanner end to end";
    for (id, records) in [
        (
            PARENT,
            serde_json::json!([
                {"type": "say", "say": "text",
                 "text": "coordinate the archive scanner milestone", "ts": 1_000},
                {"type": "say", "say": "text",
                 "text": format!("<new_task><message>{child_instruction}</message></new_task>"),
                 "ts": 2_000},
            ]),
        ),
        (
            CHILD,
            serde_json::json!([
                {"type": "say", "say": "text", "text": child_instruction, "ts": 3_000},
                {"type": "say", "say": "tool",
                 "text": "{\"tool\":\"writeFile\",\"path\":\"src/scanner.rs\"}", "ts": 4_000},
                {"type": "say", "say": "completion_result", "text": "Scanner done.", "ts": 5_000},
            ]),
        ),
    ] {
        let folder = storage.join(id);
        fs::create_dir_all(folder.as_std_path()).unwrap();
        fs::write(
            folder.join("ui_messages.json").as_std_path(),
            records.to_string(),
        )
        .unwrap();
    }

    // Scan and reconstruct
    let cache = SkeletonCache::new(
        Box::new(FsStorageLocator::single(storage.clone())),
        EngineConfig::default(),
    );
    let report = cache.scan(&CancelFlag::new()).unwrap();
    assert_eq!(report.phase2.resolved_count, 1);

    let child = cache.get(&TaskId::parse(CHILD).unwrap()).unwrap();
    assert_eq!(
        child.reconstructed_parent_id.as_ref().map(TaskId::as_str),
        Some(PARENT)
    );
    assert!(child.is_completed);

    // List and render
    let listed = cache.list_conversations(&ConversationFilters {
        sort_by: SortBy::LastActivity,
        descending: true,
        ..ConversationFilters::default()
    });
    assert_eq!(listed[0].task_id.as_str(), CHILD);

    let view = view_conversation_tree(
        &cache,
        Some(&TaskId::parse(CHILD).unwrap()),
        ViewMode::Chain,
        2,
    )
    .unwrap();
    assert!(view.contains("coordinate the archive scanner milestone"));
    assert!(view.contains(child_instruction));

    // A fresh cache instance picks the persisted skeletons back up
    let reloaded = SkeletonCache::new(
        Box::new(FsStorageLocator::single(storage)),
        EngineConfig::default(),
    );
    assert_eq!(reloaded.load_from_disk().unwrap(), 2);

    // Commit log: record the scan as a config change and apply it
    let mut log = CommitLog::open(&shared, "machine-a", CommitLogConfig::default()).unwrap();
    let receipt = log
        .append(
            "config_change",
            serde_json::json!({"setting": "scanner_enabled", "value": true}),
        )
        .unwrap();
    log.apply(receipt.sequence_number).unwrap();
    assert_eq!(
        log.get(receipt.sequence_number).unwrap().status,
        CommitStatus::Applied
    );
    assert!(log.verify_consistency().is_consistent);

    // Messages: announce, read, archive
    let m_a = MessageStore::open(&shared, "machine-a").unwrap();
    let m_b = MessageStore::open(&shared, "machine-b").unwrap();
    let note = m_a
        .send(
            "machine-b",
            "scan complete",
            "two conversations reconstructed",
            SendOptions::default(),
        )
        .unwrap();
    assert_eq!(m_b.read_inbox("machine-b", StatusFilter::Unread, None).len(), 1);
    m_b.mark_as_read(&note.id).unwrap();
    m_b.archive_message(&note.id).unwrap();
    assert!(m_b.get_message(&note.id).is_some());

    // Status over all three subsystems
    let status = StatusReport::new()
        .with_cache(&cache)
        .with_commit_log(&log)
        .with_messages(&m_b);
    let text = status.render_text();
    assert!(text.contains("cache: 2 tasks"));
    assert!(text.contains("commit log: seq 1"));
    assert!(status.emit_json().unwrap().contains("\"isConsistent\":true"));
}
