//! Event taxonomy, the JSONL event log, and run metrics.
//!
//! Components communicate through typed channel messages; the orchestrator
//! owns the single consumer, forwards events to registered observers, and
//! appends each one as a JSON object per line to the event log, the
//! external contract for dashboards and replays.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::task::{Handoff, TaskStatus};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Planner,
    Subplanner,
    Reconciler,
    ConflictFix,
    Injected,
}

/// Compact sweep record carried on events (the full sweep result stays in
/// the reconciler module).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub build_ok: bool,
    pub tests_ok: bool,
    pub has_conflict_markers: bool,
    pub conflict_files: Vec<String>,
    pub fix_task_count: usize,
}

/// Everything observable about a run, as emitted on the internal event
/// channel and persisted to the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SwarmEvent {
    TaskCreated {
        task_id: String,
        branch: String,
        priority: i32,
        source: TaskSource,
    },
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskCompleted {
        handoff: Handoff,
    },
    WorkerFailed {
        task_id: String,
        error: String,
    },
    WorkerTimeout {
        task_id: String,
        branch: String,
    },
    EmptyDiff {
        task_id: String,
    },
    SuspiciousTask {
        task_id: String,
    },
    MergeResult {
        branch: String,
        outcome: String,
    },
    MergeConflict {
        branch: String,
        files: Vec<String>,
    },
    SweepComplete {
        sweep: SweepSummary,
    },
    IterationComplete {
        iteration: u64,
        new_tasks: usize,
    },
    MetricsUpdate {
        snapshot: MetricsSnapshot,
    },
    FinalizationStart,
    FinalizationAttempt {
        attempt: u32,
        unmerged_branches: usize,
    },
    FinalizationComplete {
        passed: bool,
        attempts: u32,
    },
    Error {
        context: String,
        message: String,
    },
}

/// An event with its emission timestamp, as written to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SwarmEvent,
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Cloneable producer handle for the event channel.
///
/// Sends never block; if the orchestrator's consumer is gone (tests,
/// shutdown), events are dropped silently.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl EventSink {
    /// Create a sink and the receiving end for the orchestrator loop.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose events go nowhere. Useful in tests.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, event: SwarmEvent) {
        let record = EventRecord {
            ts: Utc::now(),
            event,
        };
        if self.tx.send(record).is_err() {
            debug!("event sink has no consumer; event dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// JSONL event log
// ---------------------------------------------------------------------------

/// Append-only JSONL writer at a caller-chosen path.
pub struct EventLog {
    writer: Mutex<BufWriter<File>>,
}

impl EventLog {
    /// Open (or create) the log file for appending.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one record as a single JSON line and flush.
    pub fn append(&self, record: &EventRecord) {
        let Ok(line) = serde_json::to_string(record) else {
            debug!("failed to serialize event record");
            return;
        };
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if writeln!(writer, "{line}").and_then(|()| writer.flush()).is_err() {
            debug!("failed to write event log line");
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Aggregate counters for a run. Returned from `run()` and carried on
/// `MetricsUpdate` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub failed_tasks: u64,
    pub blocked_tasks: u64,
    pub total_merged: u64,
    pub total_skipped: u64,
    pub total_failed_merges: u64,
    pub total_conflicts: u64,
    pub tokens_used: u64,
    pub empty_diffs: u64,
    pub suspicious_tasks: u64,
    pub fix_tasks_injected: u64,
    pub conflict_fix_tasks_injected: u64,
    pub sweeps: u64,
    pub planner_iterations: u64,
    pub finalization_attempts: u32,
    pub finalization_passed: bool,
    pub wall_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
