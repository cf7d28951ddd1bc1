//! Priority task queue with a per-task state machine.
//!
//! The queue is the single writer for task state. Components mutate tasks
//! only through the documented transitions here; readers take snapshots.
//! Ordering is a min-heap on `(priority, created_at)` with ties broken by
//! stable insertion order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::task::{Task, TaskStatus};

/// Errors from queue operations and state transitions.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0:?} already enqueued")]
    DuplicateId(String),

    #[error("task {0:?} not found")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to} for task {id:?}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("cannot retry task {id:?}: retry count {retries} >= max {max}")]
    RetryBudgetExhausted { id: String, retries: u32, max: u32 },
}

/// Observer invoked after every status change with the task snapshot and
/// the status it moved from.
pub type StatusObserver = Box<dyn Fn(&Task, TaskStatus) + Send + Sync>;

/// Heap key: min on `(priority, created_at)`, insertion order as the tie
/// break. Stored reversed since `BinaryHeap` is a max-heap.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
}

struct QueueInner {
    tasks: HashMap<String, Task>,
    // Entries are not removed on assignment; stale entries are skipped
    // lazily when popping.
    heap: BinaryHeap<Reverse<(HeapKey, String)>>,
    seq: u64,
}

/// Priority queue of tasks plus a by-id index.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    observers: Mutex<Vec<StatusObserver>>,
    max_task_retries: u32,
}

impl TaskQueue {
    pub fn new(max_task_retries: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: HashMap::new(),
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            observers: Mutex::new(Vec::new()),
            max_task_retries,
        }
    }

    /// Register a status-change observer. Observers fire synchronously
    /// after each transition, outside the queue lock.
    pub fn on_status_change(&self, observer: StatusObserver) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Insert a task with status `pending`. Fails if the id is present.
    pub fn enqueue(&self, mut task: Task) -> Result<(), QueueError> {
        let mut inner = self.lock_inner();
        if inner.tasks.contains_key(&task.id) {
            return Err(QueueError::DuplicateId(task.id));
        }
        task.status = TaskStatus::Pending;
        inner.seq += 1;
        let key = HeapKey {
            priority: task.priority,
            created_at: task.created_at,
            seq: inner.seq,
        };
        inner.heap.push(Reverse((key, task.id.clone())));
        debug!(task_id = %task.id, priority = task.priority, "task enqueued");
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Snapshot lookup by id.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock_inner().tasks.get(id).cloned()
    }

    /// `pending -> assigned`, recording the assignee tag.
    pub fn assign(&self, id: &str, agent: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Assigned, |task| {
            task.assignee = Some(agent.to_owned());
        })
    }

    /// `assigned -> running`.
    pub fn start(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Running, |_| {})
    }

    /// `running -> complete`.
    pub fn complete(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Complete, |_| {})
    }

    /// `running -> failed`.
    pub fn fail(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Failed, |_| {})
    }

    /// `running -> blocked`.
    pub fn block(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Blocked, |_| {})
    }

    /// `failed|blocked -> pending`, incrementing the retry counter. Fails
    /// when the retry budget is exhausted.
    pub fn retry(&self, id: &str) -> Result<(), QueueError> {
        let (snapshot, from) = {
            let mut inner = self.lock_inner();
            let max = self.max_task_retries;
            let seq = {
                inner.seq += 1;
                inner.seq
            };
            let task = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.to_owned()))?;
            let from = task.status;
            if !TaskStatus::is_valid_transition(from, TaskStatus::Pending) {
                return Err(QueueError::InvalidTransition {
                    id: id.to_owned(),
                    from,
                    to: TaskStatus::Pending,
                });
            }
            if task.retry_count >= max {
                return Err(QueueError::RetryBudgetExhausted {
                    id: id.to_owned(),
                    retries: task.retry_count,
                    max,
                });
            }
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.assignee = None;
            let key = HeapKey {
                priority: task.priority,
                created_at: task.created_at,
                seq,
            };
            let snapshot = task.clone();
            inner.heap.push(Reverse((key, id.to_owned())));
            (snapshot, from)
        };
        debug!(task_id = id, retry = snapshot.retry_count, "task retried to pending");
        self.notify(&snapshot, from);
        Ok(())
    }

    /// Number of tasks currently pending.
    pub fn pending_count(&self) -> usize {
        self.count_with_status(TaskStatus::Pending)
    }

    /// Number of tasks currently assigned or running.
    pub fn active_count(&self) -> usize {
        let inner = self.lock_inner();
        inner
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
            .count()
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        let inner = self.lock_inner();
        inner.tasks.values().filter(|t| t.status == status).count()
    }

    /// Snapshot of all tasks with the given status, in id order.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        let inner = self.lock_inner();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Pop the highest-priority pending task, skipping heap entries whose
    /// task has since moved on.
    pub fn take_next_pending(&self) -> Option<Task> {
        let mut inner = self.lock_inner();
        while let Some(Reverse((_, id))) = inner.heap.pop() {
            if let Some(task) = inner.tasks.get(&id) {
                if task.status == TaskStatus::Pending {
                    return Some(task.clone());
                }
            }
        }
        None
    }

    fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<(), QueueError> {
        let (snapshot, from) = {
            let mut inner = self.lock_inner();
            let task = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.to_owned()))?;
            let from = task.status;
            if !TaskStatus::is_valid_transition(from, to) {
                return Err(QueueError::InvalidTransition {
                    id: id.to_owned(),
                    from,
                    to,
                });
            }
            task.status = to;
            mutate(task);
            (task.clone(), from)
        };
        debug!(task_id = id, from = %from, to = %to, "task transition");
        self.notify(&snapshot, from);
        Ok(())
    }

    fn notify(&self, task: &Task, from: TaskStatus) {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer(task, from);
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
