//! Serial merge queue: integrates completed worker branches into the
//! mainline one at a time.
//!
//! Queue order is ascending `(priority, enqueue time)`. A branch appears
//! at most once; branches already merged are silently dropped on enqueue.
//! Conflicts are retried with an out-of-line rebase up to the configured
//! cap, after which the conflict callback fires so the orchestrator can
//! inject a conflict-fix task.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventSink, SwarmEvent};
use crate::git::{GitRepo, MergeAttempt, MergeStrategy};

/// One queued branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeQueueEntry {
    pub branch: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of one merge attempt, delivered to `on_merge_result` observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The branch landed on the mainline.
    Merged { branch: String },
    /// The merge conflicted; the branch was rebased out of line and
    /// re-enqueued at high priority.
    SkippedForRetry { branch: String, retry: u32 },
    /// Conflict retries are exhausted; the conflict callback has fired.
    Conflict { branch: String, files: Vec<String> },
    /// Non-conflict failure (after the one merge-commit fallback).
    Failed { branch: String, message: String },
}

impl MergeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Merged { .. } => "merged",
            Self::SkippedForRetry { .. } => "skipped",
            Self::Conflict { .. } => "conflict",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Payload for the conflict callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub branch: String,
    pub conflicting_files: Vec<String>,
}

/// Read-only merge statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub total_merged: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub total_conflicts: u64,
}

type ResultObserver = Box<dyn Fn(&MergeOutcome) + Send + Sync>;
type ConflictObserver = Box<dyn Fn(&ConflictInfo) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    priority: i32,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

struct QueueState {
    heap: BinaryHeap<Reverse<(EntryKey, String)>>,
    /// Branches currently waiting in the heap.
    queued: HashSet<String>,
    /// Branches that have landed on the mainline. Never re-admitted.
    merged: HashSet<String>,
    /// Per-branch conflict retry counters.
    retries: HashMap<String, u32>,
    seq: u64,
}

/// Priority-ordered serial integrator of completed branches.
pub struct MergeQueue {
    git: GitRepo,
    strategy: MergeStrategy,
    max_conflict_retries: u32,
    state: Mutex<QueueState>,
    stats: Mutex<MergeStats>,
    /// Keeps integration strictly serial even when the background tick
    /// and an explicit drain (finalization) overlap.
    drain_lock: tokio::sync::Mutex<()>,
    on_result: Mutex<Vec<ResultObserver>>,
    on_conflict: Mutex<Vec<ConflictObserver>>,
    sink: EventSink,
}

impl MergeQueue {
    pub fn new(
        git: GitRepo,
        strategy: MergeStrategy,
        max_conflict_retries: u32,
        sink: EventSink,
    ) -> Self {
        Self {
            git,
            strategy,
            max_conflict_retries,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
                merged: HashSet::new(),
                retries: HashMap::new(),
                seq: 0,
            }),
            stats: Mutex::new(MergeStats::default()),
            drain_lock: tokio::sync::Mutex::new(()),
            on_result: Mutex::new(Vec::new()),
            on_conflict: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// Register an observer fired synchronously for every merge outcome.
    pub fn on_merge_result(&self, observer: ResultObserver) {
        self.on_result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Register an observer fired when a branch exhausts its conflict
    /// retries.
    pub fn on_conflict(&self, observer: ConflictObserver) {
        self.on_conflict
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Queue a branch for integration. Duplicate enqueues before dequeue
    /// are ignored (first admit wins); merged branches are dropped.
    pub fn enqueue(&self, branch: &str, priority: i32) {
        let mut state = self.lock_state();
        if state.merged.contains(branch) {
            debug!(branch, "branch already merged, not re-enqueuing");
            return;
        }
        if !state.queued.insert(branch.to_owned()) {
            debug!(branch, "branch already queued, ignoring duplicate enqueue");
            return;
        }
        state.seq += 1;
        let key = EntryKey {
            priority,
            enqueued_at: Utc::now(),
            seq: state.seq,
        };
        state.heap.push(Reverse((key, branch.to_owned())));
        debug!(branch, priority, "branch enqueued for merge");
    }

    pub fn is_branch_merged(&self, branch: &str) -> bool {
        self.lock_state().merged.contains(branch)
    }

    /// Snapshot of branches that have landed on the mainline.
    pub fn merged_branches(&self) -> HashSet<String> {
        self.lock_state().merged.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.lock_state().queued.len()
    }

    pub fn retry_count(&self, branch: &str) -> u32 {
        self.lock_state().retries.get(branch).copied().unwrap_or(0)
    }

    /// Restore a branch's conflict retry state regardless of prior value.
    pub fn reset_retry_count(&self, branch: &str) {
        self.lock_state().retries.remove(branch);
    }

    pub fn stats(&self) -> MergeStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fully drain the current queue, merging one branch at a time. At
    /// most one drain runs at any instant.
    pub async fn drain(&self) {
        let _serial = self.drain_lock.lock().await;
        while let Some(entry) = self.pop_next() {
            let outcome = self.merge_one(&entry).await;
            self.record(&outcome);
        }
    }

    /// Background integration loop: each tick fully drains the queue,
    /// then pauses for the tick cadence.
    pub async fn run_background(&self, tick_ms: u64, cancel: CancellationToken) {
        loop {
            self.drain().await;
            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_millis(tick_ms)) => {}
                () = cancel.cancelled() => {
                    // Final drain so completed work is not stranded.
                    self.drain().await;
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn pop_next(&self) -> Option<MergeQueueEntry> {
        let mut state = self.lock_state();
        while let Some(Reverse((key, branch))) = state.heap.pop() {
            if !state.queued.remove(&branch) {
                // Stale heap entry from a dedupe race; skip.
                continue;
            }
            if state.merged.contains(&branch) {
                debug!(branch, "dropping already-merged branch from queue");
                continue;
            }
            return Some(MergeQueueEntry {
                branch,
                priority: key.priority,
                enqueued_at: key.enqueued_at,
            });
        }
        None
    }

    async fn merge_one(&self, entry: &MergeQueueEntry) -> MergeOutcome {
        let branch = &entry.branch;
        info!(branch, priority = entry.priority, "merging branch");

        // 1. Clean state on the mainline.
        if let Err(e) = self.git.prepare_mainline().await {
            return MergeOutcome::Failed {
                branch: branch.clone(),
                message: format!("failed to prepare mainline: {e}"),
            };
        }

        // 2. Best-effort fetch.
        self.git.fetch_branch(branch).await;

        // 3. Strategy attempt, with a single merge-commit fallback for
        //    non-conflicting failures.
        let mut attempt = self.git.merge_branch(branch, self.strategy).await;
        if let MergeAttempt::Failed { ref message } = attempt {
            if self.strategy != MergeStrategy::MergeCommit {
                warn!(branch, message, "strategy failed, falling back to merge-commit");
                attempt = self.git.merge_branch(branch, MergeStrategy::MergeCommit).await;
            }
        }

        match attempt {
            // 4. Success: mark merged, push, best-effort remote delete.
            MergeAttempt::Clean => {
                {
                    let mut state = self.lock_state();
                    state.merged.insert(branch.clone());
                }
                if let Err(e) = self.git.push_mainline().await {
                    warn!(branch, error = %e, "failed to push mainline after merge");
                }
                self.git.delete_remote_branch(branch).await;
                self.bump(|s| s.total_merged += 1);
                MergeOutcome::Merged {
                    branch: branch.clone(),
                }
            }

            // 5. Conflict: retry with out-of-line rebase or give up.
            MergeAttempt::Conflict { files } => {
                self.bump(|s| s.total_conflicts += 1);
                let retries = self.retry_count(branch);
                if retries < self.max_conflict_retries {
                    let retry = retries + 1;
                    {
                        let mut state = self.lock_state();
                        state.retries.insert(branch.clone(), retry);
                    }
                    match self.git.rebase_branch_out_of_line(branch).await {
                        Ok(true) => debug!(branch, retry, "out-of-line rebase succeeded"),
                        Ok(false) => warn!(branch, retry, "out-of-line rebase conflicted"),
                        Err(e) => warn!(branch, retry, error = %e, "out-of-line rebase failed"),
                    }
                    self.bump(|s| s.total_skipped += 1);
                    self.enqueue(branch, 1);
                    MergeOutcome::SkippedForRetry {
                        branch: branch.clone(),
                        retry,
                    }
                } else {
                    let info = ConflictInfo {
                        branch: branch.clone(),
                        conflicting_files: files.clone(),
                    };
                    self.fire_conflict(&info);
                    MergeOutcome::Conflict {
                        branch: branch.clone(),
                        files,
                    }
                }
            }

            // 6. Non-conflict failure.
            MergeAttempt::Failed { message } => {
                self.bump(|s| s.total_failed += 1);
                MergeOutcome::Failed {
                    branch: branch.clone(),
                    message,
                }
            }
        }
    }

    fn record(&self, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Merged { branch } => info!(branch, "branch merged"),
            MergeOutcome::SkippedForRetry { branch, retry } => {
                info!(branch, retry, "branch skipped for conflict retry");
            }
            MergeOutcome::Conflict { branch, files } => {
                warn!(branch, ?files, "branch conflict retries exhausted");
            }
            MergeOutcome::Failed { branch, message } => {
                warn!(branch, message, "branch merge failed");
            }
        }
        let (branch, label) = match outcome {
            MergeOutcome::Merged { branch }
            | MergeOutcome::SkippedForRetry { branch, .. }
            | MergeOutcome::Conflict { branch, .. }
            | MergeOutcome::Failed { branch, .. } => (branch.clone(), outcome.label()),
        };
        self.sink.emit(SwarmEvent::MergeResult {
            branch,
            outcome: label.to_owned(),
        });
        let observers = self.on_result.lock().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer(outcome);
        }
    }

    fn fire_conflict(&self, info: &ConflictInfo) {
        self.sink.emit(SwarmEvent::MergeConflict {
            branch: info.branch.clone(),
            files: info.conflicting_files.clone(),
        });
        let observers = self.on_conflict.lock().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer(info);
        }
    }

    fn bump(&self, f: impl FnOnce(&mut MergeStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests (queue mechanics; full merge scenarios live in tests/)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue_over_temp_repo() -> (MergeQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path();
        let run = |args: &[&str]| {
            let output = std::process::Command::new("git")
                .args(args)
                .current_dir(path)
                .output()
                .unwrap();
            assert!(output.status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "swarm@localhost"]);
        run(&["config", "user.name", "swarm"]);
        std::fs::write(path.join("README.md"), "hello\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "init"]);

        let git = GitRepo::open(path, "main", None, None).await.unwrap();
        let queue = MergeQueue::new(git, MergeStrategy::MergeCommit, 2, EventSink::disconnected());
        (queue, dir)
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_ignored() {
        let (queue, _dir) = queue_over_temp_repo().await;
        queue.enqueue("worker/a", 5);
        queue.enqueue("worker/a", 1);
        assert_eq!(queue.queued_len(), 1);
    }

    #[tokio::test]
    async fn pop_order_is_priority_then_enqueue_time() {
        let (queue, _dir) = queue_over_temp_repo().await;
        queue.enqueue("worker/low", 9);
        queue.enqueue("worker/high", 1);
        queue.enqueue("worker/mid", 5);

        assert_eq!(queue.pop_next().unwrap().branch, "worker/high");
        assert_eq!(queue.pop_next().unwrap().branch, "worker/mid");
        assert_eq!(queue.pop_next().unwrap().branch, "worker/low");
        assert!(queue.pop_next().is_none());
    }

    #[tokio::test]
    async fn merged_branch_is_never_readmitted() {
        let (queue, _dir) = queue_over_temp_repo().await;
        {
            let mut state = queue.lock_state();
            state.merged.insert("worker/done".to_owned());
        }
        queue.enqueue("worker/done", 1);
        assert_eq!(queue.queued_len(), 0);
        assert!(queue.is_branch_merged("worker/done"));
    }

    #[tokio::test]
    async fn retry_counter_reset() {
        let (queue, _dir) = queue_over_temp_repo().await;
        {
            let mut state = queue.lock_state();
            state.retries.insert("worker/x".to_owned(), 2);
        }
        assert_eq!(queue.retry_count("worker/x"), 2);
        queue.reset_retry_count("worker/x");
        assert_eq!(queue.retry_count("worker/x"), 0);
        // Resetting an unknown branch is a no-op.
        queue.reset_retry_count("worker/unknown");
    }

    #[tokio::test]
    async fn merge_missing_branch_reports_failed() {
        let (queue, _dir) = queue_over_temp_repo().await;
        queue.enqueue("worker/does-not-exist", 1);
        queue.drain().await;

        let stats = queue.stats();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_merged, 0);
        assert!(!queue.is_branch_merged("worker/does-not-exist"));
    }
}
