//! Two-phase hierarchy reconstruction
//!
//! Phase 1 walks every skeleton and inserts its child-launch prefixes into
//! the global instruction index. Phase 2 resolves parentage: each skeleton's
//! own initial instruction is normalized and looked up exactly; a unique hit
//! becomes the reconstructed parent link. Resolution is strict: no fuzzy
//! matching, no similarity scoring, no metadata heuristic. A link either
//! comes from an exact prefix match or does not exist.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::index::{InstructionIndex, MIN_PREFIX_CHARS, ResolutionOutcome, normalize_prefix};
use crate::task_id::TaskId;
use crate::types::ConversationSkeleton;

use taskloom_utils::paths::workspace_matches;

/// Histogram key for an exact radix-tree hit.
pub const METHOD_RADIX_TREE_EXACT: &str = "radix_tree_exact";
/// Histogram key for a candidate that matched no parent: a root.
pub const METHOD_ROOT_DETECTED: &str = "root_detected";

/// Cooperative cancellation checked at batch boundaries. Within a batch the
/// engine runs to completion, so every fully processed skeleton survives a
/// cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Metrics from the index-building phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase1Metrics {
    pub processed_count: usize,
    /// Skeletons whose artifacts parsed without recorded errors
    pub parsed_count: usize,
    pub total_prefixes: usize,
    pub index_size: usize,
    pub error_count: usize,
}

/// Metrics from the parent-resolution phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase2Metrics {
    pub processed_count: usize,
    pub resolved_count: usize,
    pub unresolved_count: usize,
    /// 1.0 per exact match, 0 otherwise, averaged over attempted candidates
    pub average_confidence: f64,
    pub resolution_methods: BTreeMap<String, usize>,
}

/// Aggregate report for one engine run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructionReport {
    pub phase1: Phase1Metrics,
    pub phase2: Phase2Metrics,
    pub elapsed_ms: u128,
    pub cancelled: bool,
}

/// The hierarchy reconstruction engine.
///
/// Owns the global instruction index: mutated only in Phase 1, read-only in
/// Phase 2. Constructor-injected so tests instantiate isolated copies.
#[derive(Debug, Default)]
pub struct ReconstructionEngine {
    config: EngineConfig,
    index: InstructionIndex,
}

impl ReconstructionEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            index: InstructionIndex::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn index(&self) -> &InstructionIndex {
        &self.index
    }

    /// Whether a task's workspace passes the configured filter.
    #[must_use]
    pub fn includes_workspace(&self, workspace: Option<&str>) -> bool {
        match (&self.config.workspace_filter, workspace) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(filter), Some(workspace)) => workspace_matches(workspace, filter),
        }
    }

    /// Run both phases over the full skeleton set, in batches, honoring the
    /// cancel flag at batch boundaries.
    pub fn run(
        &mut self,
        skeletons: &mut [ConversationSkeleton],
        cancel: &CancelFlag,
    ) -> ReconstructionReport {
        let started = Instant::now();
        let mut report = ReconstructionReport::default();

        let batch_size = self.config.batch_size.max(1);

        for batch in skeletons.chunks_mut(batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.phase1_batch(batch, &mut report.phase1);
        }
        report.phase1.index_size = self.index.len();
        info!(
            processed = report.phase1.processed_count,
            prefixes = report.phase1.total_prefixes,
            index_size = report.phase1.index_size,
            errors = report.phase1.error_count,
            "phase 1 complete"
        );

        if !report.cancelled {
            // Links committed so far, for the ancestor walk. Seeded from
            // reused skeletons so incremental runs still detect cycles.
            let mut links: HashMap<TaskId, TaskId> = skeletons
                .iter()
                .filter_map(|s| {
                    s.reconstructed_parent_id
                        .clone()
                        .map(|p| (s.task_id.clone(), p))
                })
                .collect();

            let total = skeletons.len();
            let mut start = 0;
            while start < total {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let end = (start + batch_size).min(total);
                self.phase2_batch(skeletons, start..end, &mut links, &mut report.phase2);
                start = end;
            }

            let attempted = report.phase2.resolved_count + report.phase2.unresolved_count;
            report.phase2.average_confidence = if attempted == 0 {
                0.0
            } else {
                report.phase2.resolved_count as f64 / attempted as f64
            };
            info!(
                processed = report.phase2.processed_count,
                resolved = report.phase2.resolved_count,
                unresolved = report.phase2.unresolved_count,
                "phase 2 complete"
            );
        }

        report.elapsed_ms = started.elapsed().as_millis();
        report
    }

    fn phase1_batch(&mut self, batch: &mut [ConversationSkeleton], metrics: &mut Phase1Metrics) {
        for skeleton in batch {
            metrics.processed_count += 1;
            if skeleton.processing_state.errors.is_empty() {
                metrics.parsed_count += 1;
            } else {
                metrics.error_count += 1;
            }

            for prefix in &skeleton.child_task_instruction_prefixes {
                // Insertions are idempotent; re-running over reused
                // skeletons cannot inflate the index.
                self.index.insert(prefix, skeleton.task_id.clone());
                metrics.total_prefixes += 1;
            }
            skeleton.processing_state.phase1_completed = true;
        }
    }

    fn phase2_batch(
        &self,
        skeletons: &mut [ConversationSkeleton],
        range: std::ops::Range<usize>,
        links: &mut HashMap<TaskId, TaskId>,
        metrics: &mut Phase2Metrics,
    ) {
        for i in range {
            let task_id = skeletons[i].task_id.clone();
            metrics.processed_count += 1;

            // Re-resolution starts clean so a changed source can lose its
            // old link; the committed-links map follows suit.
            skeletons[i].reconstructed_parent_id = None;
            links.remove(&task_id);

            let candidate = skeletons[i]
                .truncated_instruction
                .as_deref()
                .map(normalize_prefix);

            match candidate {
                None => {
                    // No instruction: nothing to resolve, parent stays unset
                }
                Some(None) => {
                    // Normalized below the minimum discriminating length
                    debug!(
                        task = %task_id,
                        min = MIN_PREFIX_CHARS,
                        "instruction too short for resolution"
                    );
                }
                Some(Some(key)) => match self.index.resolve(&key) {
                    ResolutionOutcome::Unique(parent) => {
                        if parent == task_id {
                            Self::record_error(
                                &mut skeletons[i],
                                format!("CycleDetected: task {task_id} resolves to itself"),
                            );
                            metrics.unresolved_count += 1;
                        } else if Self::would_cycle(links, &task_id, &parent) {
                            Self::record_error(
                                &mut skeletons[i],
                                format!(
                                    "CycleDetected: linking {task_id} under {parent} closes a cycle"
                                ),
                            );
                            warn!(task = %task_id, parent = %parent, "cycle rejected");
                            metrics.unresolved_count += 1;
                        } else {
                            if self.config.debug_mode {
                                debug!(task = %task_id, parent = %parent, "parent resolved");
                            }
                            links.insert(task_id.clone(), parent.clone());
                            skeletons[i].reconstructed_parent_id = Some(parent);
                            metrics.resolved_count += 1;
                            *metrics
                                .resolution_methods
                                .entry(METHOD_RADIX_TREE_EXACT.to_string())
                                .or_insert(0) += 1;
                        }
                    }
                    ResolutionOutcome::Ambiguous(count) => {
                        Self::record_error(
                            &mut skeletons[i],
                            format!("AmbiguousParent: {count} parents registered the exact prefix"),
                        );
                        metrics.unresolved_count += 1;
                    }
                    ResolutionOutcome::NotFound => {
                        // Matches no one: a root, not an error
                        metrics.unresolved_count += 1;
                        *metrics
                            .resolution_methods
                            .entry(METHOD_ROOT_DETECTED.to_string())
                            .or_insert(0) += 1;
                    }
                },
            }

            skeletons[i].processing_state.phase2_completed = true;
        }
    }

    /// Record a resolution error once; re-runs over unchanged sources must
    /// not accumulate duplicates.
    fn record_error(skeleton: &mut ConversationSkeleton, message: String) {
        if !skeleton.processing_state.errors.contains(&message) {
            skeleton.push_error(message);
        }
    }

    /// Ancestor walk from `parent`: committing the link would close a cycle
    /// if the walk reaches `child`. Bounded by the link-map size.
    fn would_cycle(links: &HashMap<TaskId, TaskId>, child: &TaskId, parent: &TaskId) -> bool {
        let mut current = parent;
        let mut steps = 0;
        while let Some(next) = links.get(current) {
            if next == child || current == child {
                return true;
            }
            steps += 1;
            if steps > links.len() {
                // A pre-existing cycle in reused links; refuse the link
                return true;
            }
            current = next;
        }
        current == child
    }
}
