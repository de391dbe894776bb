//! Invariant checks for the reconstruction engine over synthetic skeletons.

use taskloom::config::EngineConfig;
use taskloom::engine::{CancelFlag, ReconstructionEngine};
use taskloom::task_id::TaskId;
use taskloom::types::ConversationSkeleton;

fn task_id(n: u16) -> TaskId {
    TaskId::parse(&format!("{n:08x}-0000-4000-8000-000000000000")).unwrap()
}

fn skeleton_with(id: u16, instruction: Option<&str>, prefixes: &[String]) -> ConversationSkeleton {
    let mut s = ConversationSkeleton::bare(task_id(id), "/storage");
    s.truncated_instruction = instruction.map(str::to_string);
    s.child_task_instruction_prefixes = prefixes.to_vec();
    s
}

/// Build a wide synthetic forest: `roots` trees, each a chain of `depth`
/// tasks, instruction text derived from position.
fn forest(roots: u16, depth: u16) -> Vec<ConversationSkeleton> {
    let mut skeletons = Vec::new();
    let mut next_id = 1u16;

    for r in 0..roots {
        let mut instruction = format!("root instruction for tree number {r}");
        for d in 0..depth {
            let child_instruction = format!("tree {r} level {} task instruction", d + 1);
            let prefixes = if d + 1 < depth {
                vec![child_instruction.clone()]
            } else {
                Vec::new()
            };
            skeletons.push(skeleton_with(next_id, Some(&instruction), &prefixes));
            instruction = child_instruction;
            next_id += 1;
        }
    }
    skeletons
}

/// Walking parent links from any skeleton terminates at a root within
/// cache-size steps.
#[test]
fn test_parent_walks_terminate() {
    let mut skeletons = forest(4, 5);
    let mut engine = ReconstructionEngine::new(EngineConfig::default());
    engine.run(&mut skeletons, &CancelFlag::new());

    let by_id: std::collections::HashMap<_, _> = skeletons
        .iter()
        .map(|s| (s.task_id.clone(), s.clone()))
        .collect();

    for skeleton in &skeletons {
        let mut current = skeleton;
        let mut steps = 0;
        while let Some(parent_id) = &current.reconstructed_parent_id {
            steps += 1;
            assert!(
                steps <= skeletons.len(),
                "walk from {} exceeded the skeleton count",
                skeleton.task_id
            );
            current = by_id.get(parent_id).expect("parent link must resolve");
        }
    }
}

/// The reconstructed graph is a forest: every task has at most one parent
/// and the number of links equals tasks minus roots.
#[test]
fn test_graph_is_forest() {
    let mut skeletons = forest(3, 4);
    let mut engine = ReconstructionEngine::new(EngineConfig::default());
    let report = engine.run(&mut skeletons, &CancelFlag::new());

    let linked = skeletons
        .iter()
        .filter(|s| s.reconstructed_parent_id.is_some())
        .count();
    assert_eq!(linked, 3 * 4 - 3);
    assert_eq!(report.phase2.resolved_count, linked);
    assert_eq!(report.phase2.unresolved_count, 3);
}

/// Phase ordering: phase 2 completion implies phase 1 completion on every
/// skeleton the engine touched.
#[test]
fn test_phase2_implies_phase1() {
    let mut skeletons = forest(2, 3);
    let mut engine = ReconstructionEngine::new(EngineConfig::default());
    engine.run(&mut skeletons, &CancelFlag::new());

    for skeleton in &skeletons {
        if skeleton.processing_state.phase2_completed {
            assert!(skeleton.processing_state.phase1_completed);
        }
    }
}

/// Batch size never changes the outcome, only the scheduling.
#[test]
fn test_batch_size_does_not_change_results() {
    let baseline = {
        let mut skeletons = forest(3, 4);
        let mut engine = ReconstructionEngine::new(EngineConfig::default());
        engine.run(&mut skeletons, &CancelFlag::new());
        skeletons
    };

    for batch_size in [1, 2, 7, 100] {
        let mut config = EngineConfig::default();
        config.batch_size = batch_size;
        let mut skeletons = forest(3, 4);
        let mut engine = ReconstructionEngine::new(config);
        engine.run(&mut skeletons, &CancelFlag::new());
        assert_eq!(
            skeletons, baseline,
            "batch size {batch_size} changed resolution output"
        );
    }
}

/// Confidence is exactly the resolved share of attempted candidates.
#[test]
fn test_average_confidence_matches_counts() {
    let mut skeletons = forest(2, 5);
    // Two tasks with no instruction never enter the confidence average
    skeletons.push(skeleton_with(900, None, &[]));
    skeletons.push(skeleton_with(901, None, &[]));

    let mut engine = ReconstructionEngine::new(EngineConfig::default());
    let report = engine.run(&mut skeletons, &CancelFlag::new());

    let attempted = report.phase2.resolved_count + report.phase2.unresolved_count;
    assert_eq!(attempted, 10);
    let expected = report.phase2.resolved_count as f64 / attempted as f64;
    assert!((report.phase2.average_confidence - expected).abs() < f64::EPSILON);
}

/// Re-running the same engine twice over the same skeletons leaves the
/// index size and links unchanged.
#[test]
fn test_engine_rerun_stable() {
    let mut skeletons = forest(2, 3);
    let mut engine = ReconstructionEngine::new(EngineConfig::default());
    engine.run(&mut skeletons, &CancelFlag::new());
    let first_links: Vec<_> = skeletons
        .iter()
        .map(|s| s.reconstructed_parent_id.clone())
        .collect();
    let first_index_size = engine.index().len();

    engine.run(&mut skeletons, &CancelFlag::new());
    let second_links: Vec<_> = skeletons
        .iter()
        .map(|s| s.reconstructed_parent_id.clone())
        .collect();

    assert_eq!(first_links, second_links);
    assert_eq!(engine.index().len(), first_index_size);
}

/// A shared prefix emitted by two parents resolves no one and records the
/// ambiguity on the affected child only.
#[test]
fn test_ambiguity_is_isolated() {
    let shared = "the contested child instruction".to_string();
    let mut skeletons = vec![
        skeleton_with(1, Some("first parent instruction text"), &[shared.clone()]),
        skeleton_with(2, Some("second parent instruction text"), &[shared.clone()]),
        skeleton_with(3, Some(&shared), &[]),
        skeleton_with(
            4,
            Some("an unrelated root instruction"),
            &["an undisputed child instruction".to_string()],
        ),
        skeleton_with(5, Some("an undisputed child instruction"), &[]),
    ];

    let mut engine = ReconstructionEngine::new(EngineConfig::default());
    engine.run(&mut skeletons, &CancelFlag::new());

    assert!(skeletons[2].reconstructed_parent_id.is_none());
    assert!(
        skeletons[2]
            .processing_state
            .errors
            .iter()
            .any(|e| e.contains("AmbiguousParent"))
    );
    // The undisputed pair is unaffected
    assert_eq!(skeletons[4].reconstructed_parent_id, Some(task_id(4)));
    for s in [&skeletons[0], &skeletons[1], &skeletons[3], &skeletons[4]] {
        assert!(s.processing_state.errors.is_empty());
    }
}
