//! Scope tracking: which in-flight task claims which files.
//!
//! Overlap is not fatal. It is logged and surfaced to the planner so
//! subsequent batches steer away from files that are already being edited.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use tracing::warn;

/// An overlap between a task being registered and an already-active claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeOverlap {
    /// The task that already holds the file.
    pub holder: String,
    /// The contested file path.
    pub file: String,
}

struct TrackerInner {
    by_task: HashMap<String, HashSet<String>>,
    by_file: HashMap<String, HashSet<String>>,
}

/// Bidirectional view of active scope claims.
pub struct ScopeTracker {
    inner: Mutex<TrackerInner>,
}

impl Default for ScopeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                by_task: HashMap::new(),
                by_file: HashMap::new(),
            }),
        }
    }

    /// Associate `files` with `task_id`. Overlapping claims held by other
    /// active tasks are returned (and logged); registration proceeds
    /// regardless.
    pub fn register(&self, task_id: &str, files: &[String]) -> Vec<ScopeOverlap> {
        let mut inner = self.lock();
        let mut overlaps = Vec::new();
        for file in files {
            if let Some(holders) = inner.by_file.get(file) {
                for holder in holders {
                    if holder != task_id {
                        overlaps.push(ScopeOverlap {
                            holder: holder.clone(),
                            file: file.clone(),
                        });
                    }
                }
            }
        }
        for file in files {
            inner
                .by_file
                .entry(file.clone())
                .or_default()
                .insert(task_id.to_owned());
            inner
                .by_task
                .entry(task_id.to_owned())
                .or_default()
                .insert(file.clone());
        }
        drop(inner);

        for overlap in &overlaps {
            warn!(
                task_id,
                holder = %overlap.holder,
                file = %overlap.file,
                "scope overlap with active task"
            );
        }
        overlaps
    }

    /// Return overlapping claims without registering. Used for
    /// pre-dispatch warnings.
    pub fn overlaps_for(&self, task_id: &str, files: &[String]) -> Vec<ScopeOverlap> {
        let inner = self.lock();
        let mut overlaps = Vec::new();
        for file in files {
            if let Some(holders) = inner.by_file.get(file) {
                for holder in holders {
                    if holder != task_id {
                        overlaps.push(ScopeOverlap {
                            holder: holder.clone(),
                            file: file.clone(),
                        });
                    }
                }
            }
        }
        overlaps
    }

    /// Remove all claims held by `task_id`.
    pub fn release(&self, task_id: &str) {
        let mut inner = self.lock();
        let Some(files) = inner.by_task.remove(task_id) else {
            return;
        };
        for file in files {
            if let Some(holders) = inner.by_file.get_mut(&file) {
                holders.remove(task_id);
                if holders.is_empty() {
                    inner.by_file.remove(&file);
                }
            }
        }
    }

    /// Sorted snapshot of all currently locked files.
    pub fn locked_files(&self) -> Vec<String> {
        let inner = self.lock();
        let set: BTreeSet<&String> = inner.by_file.keys().collect();
        set.into_iter().cloned().collect()
    }

    /// Number of tasks with at least one active claim.
    pub fn active_claims(&self) -> usize {
        self.lock().by_task.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn register_and_release() {
        let tracker = ScopeTracker::new();
        let overlaps = tracker.register("t-1", &files(&["a.rs", "b.rs"]));
        assert!(overlaps.is_empty());
        assert_eq!(tracker.locked_files(), files(&["a.rs", "b.rs"]));

        tracker.release("t-1");
        assert!(tracker.locked_files().is_empty());
        assert_eq!(tracker.active_claims(), 0);
    }

    #[test]
    fn overlap_is_reported_not_rejected() {
        let tracker = ScopeTracker::new();
        tracker.register("t-1", &files(&["a.rs"]));
        let overlaps = tracker.register("t-2", &files(&["a.rs", "c.rs"]));
        assert_eq!(
            overlaps,
            vec![ScopeOverlap {
                holder: "t-1".to_owned(),
                file: "a.rs".to_owned(),
            }]
        );
        // Both tasks now hold a.rs.
        assert_eq!(tracker.active_claims(), 2);
    }

    #[test]
    fn overlaps_for_does_not_register() {
        let tracker = ScopeTracker::new();
        tracker.register("t-1", &files(&["a.rs"]));
        let overlaps = tracker.overlaps_for("t-2", &files(&["a.rs"]));
        assert_eq!(overlaps.len(), 1);
        assert_eq!(tracker.active_claims(), 1);
    }

    #[test]
    fn release_leaves_other_holders_intact() {
        let tracker = ScopeTracker::new();
        tracker.register("t-1", &files(&["a.rs"]));
        tracker.register("t-2", &files(&["a.rs"]));
        tracker.release("t-1");
        assert_eq!(tracker.locked_files(), files(&["a.rs"]));
        tracker.release("t-2");
        assert!(tracker.locked_files().is_empty());
    }

    #[test]
    fn release_unknown_task_is_noop() {
        let tracker = ScopeTracker::new();
        tracker.release("missing");
        assert!(tracker.locked_files().is_empty());
    }

    #[test]
    fn own_claims_do_not_count_as_overlap() {
        let tracker = ScopeTracker::new();
        tracker.register("t-1", &files(&["a.rs"]));
        let overlaps = tracker.register("t-1", &files(&["a.rs", "b.rs"]));
        assert!(overlaps.is_empty());
    }
}
