//! Core data model: tasks, task status state machine, and handoffs.
//!
//! A [`Task`] is the unit of work assigned to a single sandbox worker. A
//! [`Handoff`] is the worker's structured report for one task, parsed from
//! the final stdout line of the sandbox runner.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Task status
// ---------------------------------------------------------------------------

/// Status of a task.
///
/// Valid transitions:
///
/// ```text
/// pending  -> assigned
/// assigned -> running
/// running  -> complete
/// running  -> failed
/// running  -> blocked
/// failed   -> pending   (retry)
/// blocked  -> pending   (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Complete,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Whether this status is terminal (no further work will happen
    /// without an explicit retry).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }

    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Assigned)
                | (Self::Assigned, Self::Running)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Blocked)
                | (Self::Failed, Self::Pending)
                | (Self::Blocked, Self::Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work assigned to a single sandbox worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable, human-sortable identifier (e.g. `task-003`, `fix-001`).
    pub id: String,
    /// Git branch the worker commits to, derived from id + description.
    pub branch: String,
    /// Prose description of the work.
    pub description: String,
    /// Prose acceptance criterion.
    #[serde(default)]
    pub acceptance: String,
    /// Repo-relative file paths this task claims.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Scheduling priority; lower runs sooner.
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Number of times this task has been retried after failure.
    #[serde(default)]
    pub retry_count: u32,
    /// Parent task id when this task was produced by decomposition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Branch that conflicted, for conflict-fix tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_source: Option<String>,
    pub status: TaskStatus,
    /// Informational assignee tag set on assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

impl Task {
    /// Build a new pending task, deriving the branch name from the id and
    /// description under the given prefix.
    pub fn new(id: impl Into<String>, description: impl Into<String>, branch_prefix: &str) -> Self {
        let id = id.into();
        let description = description.into();
        let branch = branch_name(branch_prefix, &id, &description);
        Self {
            id,
            branch,
            description,
            acceptance: String::new(),
            scope: Vec::new(),
            priority: 5,
            created_at: Utc::now(),
            retry_count: 0,
            parent_id: None,
            conflict_source: None,
            status: TaskStatus::Pending,
            assignee: None,
        }
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_acceptance(mut self, acceptance: impl Into<String>) -> Self {
        self.acceptance = acceptance.into();
        self
    }
}

/// A task as emitted by the planner or reconciler model, before ids and
/// branch names are assigned.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub acceptance: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl TaskDraft {
    /// Materialize the draft into a pending [`Task`], using `fallback_id`
    /// when the model did not supply one.
    pub fn into_task(self, fallback_id: String, branch_prefix: &str) -> Task {
        let id = self.id.filter(|s| !s.trim().is_empty()).unwrap_or(fallback_id);
        let mut task = Task::new(id, self.description, branch_prefix);
        task.scope = self.scope;
        if let Some(acceptance) = self.acceptance {
            task.acceptance = acceptance;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        task
    }
}

// ---------------------------------------------------------------------------
// Branch naming
// ---------------------------------------------------------------------------

/// Maximum length of the description-derived slug portion of a branch name.
const SLUG_MAX: usize = 50;

/// Lowercase the description, collapse non-alphanumeric runs to single
/// hyphens, and truncate to [`SLUG_MAX`].
pub fn slugify(description: &str) -> String {
    let mut slug = String::with_capacity(SLUG_MAX);
    let mut last_hyphen = true;
    for ch in description.chars() {
        if slug.len() >= SLUG_MAX {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Build the conventional branch name for a task: `<prefix><id>-<slug>`.
pub fn branch_name(prefix: &str, id: &str, description: &str) -> String {
    let slug = slugify(description);
    if slug.is_empty() {
        format!("{prefix}{id}")
    } else {
        format!("{prefix}{id}-{slug}")
    }
}

// ---------------------------------------------------------------------------
// Handoff
// ---------------------------------------------------------------------------

/// Status reported by a sandbox worker in its handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Complete,
    Partial,
    Failed,
    Blocked,
}

impl fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Work metrics reported in a handoff. Field types are unsigned so the
/// "numbers >= 0" wire requirement holds by construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffMetrics {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_created: u64,
    pub files_modified: u64,
    pub tokens_used: u64,
    pub tool_call_count: u64,
    pub duration_ms: u64,
}

impl HandoffMetrics {
    /// Merge another metrics bundle into this one: counters are summed,
    /// duration takes the maximum (children run concurrently).
    pub fn absorb(&mut self, other: &HandoffMetrics) {
        self.lines_added += other.lines_added;
        self.lines_removed += other.lines_removed;
        self.files_created += other.files_created;
        self.files_modified += other.files_modified;
        self.tokens_used += other.tokens_used;
        self.tool_call_count += other.tool_call_count;
        self.duration_ms = self.duration_ms.max(other.duration_ms);
    }
}

/// The sandbox runner's structured report for one task. Immutable once
/// created; printed by the runner as the final stdout line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub task_id: String,
    pub status: HandoffStatus,
    pub summary: String,
    pub diff: String,
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub metrics: HandoffMetrics,
}

impl Handoff {
    /// Validate the shape of a parsed handoff against the task it should
    /// describe. Deserialization already rejects negative numbers; this
    /// catches id mismatches and blank ids.
    pub fn validate(&self, expected_task_id: &str) -> Result<(), HandoffValidationError> {
        if self.task_id.trim().is_empty() {
            return Err(HandoffValidationError::EmptyTaskId);
        }
        if self.task_id != expected_task_id {
            return Err(HandoffValidationError::TaskIdMismatch {
                expected: expected_task_id.to_owned(),
                found: self.task_id.clone(),
            });
        }
        Ok(())
    }

    /// Build a synthetic failure handoff for dispatch-level failures
    /// (timeout, malformed output, spawn failure).
    pub fn synthetic_failure(task_id: &str, summary: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.to_owned(),
            status: HandoffStatus::Failed,
            summary: summary.into(),
            diff: String::new(),
            files_changed: Vec::new(),
            concerns: Vec::new(),
            suggestions: Vec::new(),
            metrics: HandoffMetrics {
                duration_ms,
                ..HandoffMetrics::default()
            },
        }
    }
}

/// Error returned when a handoff fails shape validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandoffValidationError {
    #[error("handoff has an empty task id")]
    EmptyTaskId,

    #[error("handoff task id mismatch: expected {expected:?}, found {found:?}")]
    TaskIdMismatch { expected: String, found: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- state machine --

    #[test]
    fn valid_transitions() {
        use TaskStatus::*;
        assert!(TaskStatus::is_valid_transition(Pending, Assigned));
        assert!(TaskStatus::is_valid_transition(Assigned, Running));
        assert!(TaskStatus::is_valid_transition(Running, Complete));
        assert!(TaskStatus::is_valid_transition(Running, Failed));
        assert!(TaskStatus::is_valid_transition(Running, Blocked));
        assert!(TaskStatus::is_valid_transition(Failed, Pending));
        assert!(TaskStatus::is_valid_transition(Blocked, Pending));
    }

    #[test]
    fn invalid_transitions() {
        use TaskStatus::*;
        assert!(!TaskStatus::is_valid_transition(Pending, Running));
        assert!(!TaskStatus::is_valid_transition(Pending, Complete));
        assert!(!TaskStatus::is_valid_transition(Assigned, Complete));
        assert!(!TaskStatus::is_valid_transition(Complete, Pending));
        assert!(!TaskStatus::is_valid_transition(Complete, Running));
        assert!(!TaskStatus::is_valid_transition(Running, Pending));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Complete,
            TaskStatus::Failed,
            TaskStatus::Blocked,
        ] {
            assert_eq!(s.to_string().parse::<TaskStatus>().unwrap(), s);
        }
        assert!("nonsense".parse::<TaskStatus>().is_err());
    }

    // -- slugs and branch names --

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Add user authentication"), "add-user-authentication");
        assert_eq!(slugify("Fix: parse errors (again)"), "fix-parse-errors-again");
    }

    #[test]
    fn slugify_collapses_runs_and_trims() {
        assert_eq!(slugify("  --weird__input!!  "), "weird-input");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn slugify_truncates_to_fifty() {
        let long = "a".repeat(200);
        assert_eq!(slugify(&long).len(), 50);
    }

    #[test]
    fn branch_name_format() {
        assert_eq!(
            branch_name("worker/", "task-001", "Add login page"),
            "worker/task-001-add-login-page"
        );
        // Empty slug falls back to bare id.
        assert_eq!(branch_name("worker/", "task-002", "!!!"), "worker/task-002");
    }

    // -- drafts --

    #[test]
    fn draft_uses_fallback_id_when_missing() {
        let draft = TaskDraft {
            description: "Do a thing".to_string(),
            scope: vec!["a.rs".to_string()],
            ..TaskDraft::default()
        };
        let task = draft.into_task("task-007".to_string(), "worker/");
        assert_eq!(task.id, "task-007");
        assert_eq!(task.branch, "worker/task-007-do-a-thing");
        assert_eq!(task.scope, vec!["a.rs"]);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn draft_keeps_model_supplied_id() {
        let draft = TaskDraft {
            id: Some("custom-1".to_string()),
            description: "x".to_string(),
            priority: Some(1),
            ..TaskDraft::default()
        };
        let task = draft.into_task("fallback".to_string(), "worker/");
        assert_eq!(task.id, "custom-1");
        assert_eq!(task.priority, 1);
    }

    // -- handoffs --

    fn sample_handoff(task_id: &str) -> Handoff {
        Handoff {
            task_id: task_id.to_string(),
            status: HandoffStatus::Complete,
            summary: "done".to_string(),
            diff: String::new(),
            files_changed: vec!["a.ts".to_string()],
            concerns: vec![],
            suggestions: vec![],
            metrics: HandoffMetrics {
                tokens_used: 100,
                tool_call_count: 3,
                duration_ms: 1200,
                ..HandoffMetrics::default()
            },
        }
    }

    #[test]
    fn handoff_wire_shape_is_camel_case() {
        let json = serde_json::to_value(sample_handoff("t-1")).unwrap();
        assert!(json.get("taskId").is_some());
        assert!(json.get("filesChanged").is_some());
        assert!(json["metrics"].get("tokensUsed").is_some());
        assert!(json["metrics"].get("toolCallCount").is_some());
    }

    #[test]
    fn handoff_parses_wire_example() {
        let line = r#"{"taskId":"t-1","status":"complete","summary":"ok","diff":"","filesChanged":["a.ts"],"concerns":[],"suggestions":[],"metrics":{"linesAdded":4,"linesRemoved":0,"filesCreated":0,"filesModified":1,"tokensUsed":100,"toolCallCount":2,"durationMs":900}}"#;
        let handoff: Handoff = serde_json::from_str(line).unwrap();
        assert_eq!(handoff.status, HandoffStatus::Complete);
        assert_eq!(handoff.metrics.lines_added, 4);
        handoff.validate("t-1").unwrap();
    }

    #[test]
    fn handoff_rejects_negative_metrics() {
        let line = r#"{"taskId":"t-1","status":"complete","summary":"","diff":"","filesChanged":[],"metrics":{"linesAdded":-1,"linesRemoved":0,"filesCreated":0,"filesModified":0,"tokensUsed":0,"toolCallCount":0,"durationMs":0}}"#;
        assert!(serde_json::from_str::<Handoff>(line).is_err());
    }

    #[test]
    fn handoff_validate_checks_id() {
        let handoff = sample_handoff("t-1");
        assert!(matches!(
            handoff.validate("t-2"),
            Err(HandoffValidationError::TaskIdMismatch { .. })
        ));
    }

    #[test]
    fn metrics_absorb_sums_counters_maxes_duration() {
        let mut a = HandoffMetrics {
            lines_added: 10,
            tokens_used: 100,
            duration_ms: 5000,
            ..HandoffMetrics::default()
        };
        let b = HandoffMetrics {
            lines_added: 5,
            tokens_used: 50,
            duration_ms: 8000,
            ..HandoffMetrics::default()
        };
        a.absorb(&b);
        assert_eq!(a.lines_added, 15);
        assert_eq!(a.tokens_used, 150);
        assert_eq!(a.duration_ms, 8000);
    }
}
