//! Repository state for planner prompts: full snapshots on the first
//! turn, deltas afterwards.

use std::collections::{BTreeMap, HashSet};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::events::SweepSummary;
use crate::git::GitRepo;
use crate::merge::MergeStats;
use crate::task::Handoff;

/// Optional planning documents read from the repository root when present.
const PLANNING_DOCS: &[&str] = &["SPEC.md", "FEATURES.md", "CONVENTIONS.md", "DECISIONS.md"];

/// Caps applied when folding handoffs into a prompt.
const HANDOFF_SUMMARY_CHARS: usize = 500;
const HANDOFF_FILES_LISTED: usize = 20;

/// Point-in-time view of the repository, as the planner sees it.
#[derive(Debug, Clone, Default)]
pub struct RepoSnapshot {
    /// Full flat file tree.
    pub files: Vec<String>,
    /// Last ten commit subjects.
    pub commits: Vec<String>,
    /// Planning documents present in the repo, keyed by file name.
    pub docs: BTreeMap<String, String>,
    /// Content hashes of the docs, for cheap delta detection.
    pub doc_hashes: BTreeMap<String, String>,
}

impl RepoSnapshot {
    /// Read the current repository state.
    pub async fn read(git: &GitRepo) -> Self {
        let files = git.ls_files().await.unwrap_or_else(|e| {
            debug!(error = %e, "ls-files failed; empty tree in prompt");
            Vec::new()
        });
        let commits = git.recent_commits(10).await.unwrap_or_default();

        let mut docs = BTreeMap::new();
        let mut doc_hashes = BTreeMap::new();
        for name in PLANNING_DOCS {
            let path = git.path().join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                doc_hashes.insert((*name).to_owned(), content_hash(&content));
                docs.insert((*name).to_owned(), content);
            }
        }

        Self {
            files,
            commits,
            docs,
            doc_hashes,
        }
    }
}

/// Differences between two snapshots, for delta turns.
#[derive(Debug, Clone, Default)]
pub struct SnapshotDelta {
    pub new_files: Vec<String>,
    pub removed_files: Vec<String>,
    /// Docs whose content hash changed (or newly appeared).
    pub changed_docs: Vec<String>,
}

impl SnapshotDelta {
    pub fn between(prev: &RepoSnapshot, current: &RepoSnapshot) -> Self {
        let prev_files: HashSet<&String> = prev.files.iter().collect();
        let current_files: HashSet<&String> = current.files.iter().collect();

        let mut new_files: Vec<String> = current_files
            .difference(&prev_files)
            .map(|s| (*s).clone())
            .collect();
        new_files.sort();
        let mut removed_files: Vec<String> = prev_files
            .difference(&current_files)
            .map(|s| (*s).clone())
            .collect();
        removed_files.sort();

        let mut changed_docs = Vec::new();
        for (name, hash) in &current.doc_hashes {
            if prev.doc_hashes.get(name) != Some(hash) {
                changed_docs.push(name.clone());
            }
        }

        Self {
            new_files,
            removed_files,
            changed_docs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.removed_files.is_empty() && self.changed_docs.is_empty()
    }
}

fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

// ---------------------------------------------------------------------------
// Prompt construction
// ---------------------------------------------------------------------------

/// The planner's standing instructions, used as the session system prompt.
pub const PLANNER_SYSTEM_PROMPT: &str = "\
You are the planner for a fleet of autonomous coding workers operating on one \
repository. Each turn, decide what to build next and respond with:

1. An optional rewritten scratchpad in a fenced block:
```scratchpad
<your full working memory; this REPLACES the previous scratchpad>
```
2. A JSON array of new tasks (may be empty when nothing remains):
[{\"description\": string, \"scope\": [repo-relative file paths], \"acceptance\": string, \"priority\": int (1 = urgent, 5 = normal)}]

Rules: keep task scopes small and disjoint; avoid files listed as locked; \
emit an empty array when the request is satisfied.";

/// Build the first-turn prompt: full repository state plus the request.
pub fn initial_prompt(request: &str, snapshot: &RepoSnapshot) -> String {
    let mut prompt = String::with_capacity(4096);
    prompt.push_str("# Build request\n\n");
    prompt.push_str(request);
    prompt.push_str("\n\n# Repository file tree\n\n");
    if snapshot.files.is_empty() {
        prompt.push_str("(empty repository)\n");
    } else {
        for file in &snapshot.files {
            prompt.push_str(file);
            prompt.push('\n');
        }
    }
    prompt.push_str("\n# Recent commits\n\n");
    for commit in &snapshot.commits {
        prompt.push_str("- ");
        prompt.push_str(commit);
        prompt.push('\n');
    }
    for (name, content) in &snapshot.docs {
        prompt.push_str(&format!("\n# {name}\n\n{content}\n"));
    }
    prompt.push_str("\nEmit the first batch of tasks.");
    prompt
}

/// Everything folded into a continuation turn.
pub struct TurnContext<'a> {
    pub delta: &'a SnapshotDelta,
    pub snapshot: &'a RepoSnapshot,
    pub new_handoffs: &'a [Handoff],
    pub active_task_ids: Vec<String>,
    pub merge_stats: MergeStats,
    pub merge_queued: usize,
    pub locked_files: Vec<String>,
    pub latest_sweep: Option<SweepSummary>,
}

/// Build a delta turn: only what changed since the last plan.
pub fn continuation_prompt(ctx: &TurnContext<'_>) -> String {
    let mut prompt = String::with_capacity(2048);
    prompt.push_str("# Since your last plan\n");

    if ctx.delta.is_empty() {
        prompt.push_str("\nNo file-tree changes.\n");
    } else {
        if !ctx.delta.new_files.is_empty() {
            prompt.push_str("\n## New files\n");
            for file in &ctx.delta.new_files {
                prompt.push_str("- ");
                prompt.push_str(file);
                prompt.push('\n');
            }
        }
        if !ctx.delta.removed_files.is_empty() {
            prompt.push_str("\n## Removed files\n");
            for file in &ctx.delta.removed_files {
                prompt.push_str("- ");
                prompt.push_str(file);
                prompt.push('\n');
            }
        }
        for name in &ctx.delta.changed_docs {
            if let Some(content) = ctx.snapshot.docs.get(name) {
                prompt.push_str(&format!("\n## {name} (updated)\n\n{content}\n"));
            }
        }
    }

    if !ctx.new_handoffs.is_empty() {
        prompt.push_str("\n## Completed handoffs\n");
        for handoff in ctx.new_handoffs {
            push_handoff(&mut prompt, handoff);
        }
    }

    prompt.push_str("\n## Fleet state\n");
    prompt.push_str(&format!(
        "- Active tasks: {}\n",
        if ctx.active_task_ids.is_empty() {
            "none".to_owned()
        } else {
            ctx.active_task_ids.join(", ")
        }
    ));
    prompt.push_str(&format!(
        "- Merge queue: {} merged, {} waiting, {} conflicts, {} failed\n",
        ctx.merge_stats.total_merged,
        ctx.merge_queued,
        ctx.merge_stats.total_conflicts,
        ctx.merge_stats.total_failed,
    ));
    if !ctx.locked_files.is_empty() {
        prompt.push_str("- Locked files (avoid assigning):\n");
        for file in &ctx.locked_files {
            prompt.push_str("    - ");
            prompt.push_str(file);
            prompt.push('\n');
        }
    }
    if let Some(sweep) = &ctx.latest_sweep {
        prompt.push_str(&format!(
            "- Latest sweep: build {}, tests {}, conflict markers {}\n",
            if sweep.build_ok { "ok" } else { "FAILING" },
            if sweep.tests_ok { "ok" } else { "FAILING" },
            if sweep.has_conflict_markers { "PRESENT" } else { "none" },
        ));
    }

    prompt.push_str(
        "\nContinue. Rewrite your scratchpad and emit the next task batch \
         (empty array if the request is satisfied).",
    );
    prompt
}

fn push_handoff(prompt: &mut String, handoff: &Handoff) {
    let summary: String = handoff.summary.chars().take(HANDOFF_SUMMARY_CHARS).collect();
    let files: Vec<&str> = handoff
        .files_changed
        .iter()
        .take(HANDOFF_FILES_LISTED)
        .map(String::as_str)
        .collect();
    let elided = handoff.files_changed.len().saturating_sub(files.len());
    prompt.push_str(&format!(
        "- [{}] {}: {} (files: {}{})\n",
        handoff.status,
        handoff.task_id,
        summary,
        files.join(", "),
        if elided > 0 {
            format!(", +{elided} more")
        } else {
            String::new()
        }
    ));
    for concern in &handoff.concerns {
        prompt.push_str("    concern: ");
        prompt.push_str(concern);
        prompt.push('\n');
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{HandoffMetrics, HandoffStatus};

    fn snapshot(files: &[&str]) -> RepoSnapshot {
        RepoSnapshot {
            files: files.iter().map(|s| (*s).to_owned()).collect(),
            ..RepoSnapshot::default()
        }
    }

    #[test]
    fn delta_detects_file_changes() {
        let prev = snapshot(&["a.rs", "b.rs"]);
        let current = snapshot(&["b.rs", "c.rs"]);
        let delta = SnapshotDelta::between(&prev, &current);
        assert_eq!(delta.new_files, vec!["c.rs"]);
        assert_eq!(delta.removed_files, vec!["a.rs"]);
    }

    #[test]
    fn delta_detects_doc_hash_changes() {
        let mut prev = snapshot(&[]);
        prev.doc_hashes
            .insert("SPEC.md".to_owned(), content_hash("v1"));
        let mut current = snapshot(&[]);
        current
            .doc_hashes
            .insert("SPEC.md".to_owned(), content_hash("v2"));
        current
            .doc_hashes
            .insert("DECISIONS.md".to_owned(), content_hash("new"));

        let delta = SnapshotDelta::between(&prev, &current);
        assert_eq!(delta.changed_docs, vec!["DECISIONS.md", "SPEC.md"]);
    }

    #[test]
    fn identical_snapshots_yield_empty_delta() {
        let a = snapshot(&["a.rs"]);
        let delta = SnapshotDelta::between(&a, &a.clone());
        assert!(delta.is_empty());
    }

    #[test]
    fn initial_prompt_carries_request_and_tree() {
        let snap = snapshot(&["src/main.rs"]);
        let prompt = initial_prompt("add a login page", &snap);
        assert!(prompt.contains("add a login page"));
        assert!(prompt.contains("src/main.rs"));
    }

    #[test]
    fn continuation_prompt_folds_handoffs_and_locks() {
        let prev = snapshot(&["a.rs"]);
        let current = snapshot(&["a.rs", "b.rs"]);
        let delta = SnapshotDelta::between(&prev, &current);
        let handoff = Handoff {
            task_id: "t-1".to_owned(),
            status: HandoffStatus::Complete,
            summary: "implemented the widget".to_owned(),
            diff: String::new(),
            files_changed: vec!["b.rs".to_owned()],
            concerns: vec!["needs docs".to_owned()],
            suggestions: vec![],
            metrics: HandoffMetrics::default(),
        };
        let ctx = TurnContext {
            delta: &delta,
            snapshot: &current,
            new_handoffs: std::slice::from_ref(&handoff),
            active_task_ids: vec!["t-2".to_owned()],
            merge_stats: MergeStats {
                total_merged: 3,
                ..MergeStats::default()
            },
            merge_queued: 1,
            locked_files: vec!["c.rs".to_owned()],
            latest_sweep: None,
        };
        let prompt = continuation_prompt(&ctx);
        assert!(prompt.contains("b.rs"));
        assert!(prompt.contains("implemented the widget"));
        assert!(prompt.contains("needs docs"));
        assert!(prompt.contains("t-2"));
        assert!(prompt.contains("3 merged"));
        assert!(prompt.contains("c.rs"));
    }

    #[test]
    fn long_handoff_summaries_are_truncated() {
        let handoff = Handoff {
            task_id: "t-1".to_owned(),
            status: HandoffStatus::Complete,
            summary: "x".repeat(5000),
            diff: String::new(),
            files_changed: (0..40).map(|i| format!("f{i}.rs")).collect(),
            concerns: vec![],
            suggestions: vec![],
            metrics: HandoffMetrics::default(),
        };
        let mut prompt = String::new();
        push_handoff(&mut prompt, &handoff);
        assert!(prompt.len() < 2000);
        assert!(prompt.contains("+20 more"));
    }
}
