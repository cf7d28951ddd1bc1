//! Worker dispatcher: bounded-concurrency execution of tasks in sandbox
//! workers.
//!
//! Wraps the sandbox runner behind a semaphore of `max_workers` slots.
//! Each dispatch re-checks task state, registers scope claims, streams the
//! runner's stdout, enforces the wall-clock timeout, and parses the final
//! stdout line as the handoff. The slot is released on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventSink, SwarmEvent};
use crate::queue::TaskQueue;
use crate::runner::{LlmEndpointConfig, RunnerLine, SandboxRunner, TraceContext, WorkerPayload,
    classify_line};
use crate::scope::ScopeTracker;
use crate::task::{Handoff, HandoffStatus, Task, TaskStatus};

/// Fallback worker prompt when none is configured.
const DEFAULT_WORKER_PROMPT: &str = "You are an autonomous coding worker. Clone the repository, \
create the named branch, implement the task within its scope, commit, push the branch, and print \
the handoff JSON as your final stdout line.";

/// Static dispatch parameters, derived from config at assembly time.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_workers: usize,
    pub worker_timeout: Duration,
    pub system_prompt: Option<String>,
    pub repo_url: String,
    pub git_token: String,
    pub endpoints: Vec<LlmEndpointConfig>,
}

/// Bounded-concurrency launcher that turns tasks into handoffs.
pub struct WorkerDispatcher {
    runner: Arc<dyn SandboxRunner>,
    queue: Arc<TaskQueue>,
    scope: Arc<ScopeTracker>,
    config: DispatchConfig,
    semaphore: Arc<Semaphore>,
    handoff_tx: mpsc::UnboundedSender<Handoff>,
    sink: EventSink,
    /// Per-run trace id propagated to every worker.
    trace_id: String,
    endpoint_cursor: AtomicUsize,
    active: AtomicUsize,
    tokens_used: AtomicU64,
    tool_calls: Mutex<HashMap<String, u64>>,
    timed_out: Mutex<Vec<String>>,
}

impl WorkerDispatcher {
    pub fn new(
        runner: Arc<dyn SandboxRunner>,
        queue: Arc<TaskQueue>,
        scope: Arc<ScopeTracker>,
        config: DispatchConfig,
        handoff_tx: mpsc::UnboundedSender<Handoff>,
        sink: EventSink,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            runner,
            queue,
            scope,
            config,
            semaphore,
            handoff_tx,
            sink,
            trace_id: Uuid::new_v4().simple().to_string(),
            endpoint_cursor: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            tokens_used: AtomicU64::new(0),
            tool_calls: Mutex::new(HashMap::new()),
            timed_out: Mutex::new(Vec::new()),
        }
    }

    /// Workers currently holding a dispatch slot.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Sum of reported tool-call counts across in-flight tasks.
    pub fn active_tool_calls(&self) -> u64 {
        self.tool_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .sum()
    }

    /// Total tokens reported by completed handoffs so far.
    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::SeqCst)
    }

    /// Take the branches whose workers hit the wall-clock timeout; they
    /// are preserved for finalization retry.
    pub fn drain_timed_out_branches(&self) -> Vec<String> {
        std::mem::take(&mut *self.timed_out.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Fire-and-forget dispatch: run the task in the background and push
    /// its handoff to the planner's pending-handoffs channel.
    pub fn dispatch(self: &Arc<Self>, task: Task) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(handoff) = dispatcher.execute(&task).await {
                if dispatcher.handoff_tx.send(handoff).is_err() {
                    debug!(task_id = %task.id, "handoff channel closed; planner gone");
                }
            }
        });
    }

    /// Full dispatch lifecycle for one task. Returns `None` when the task
    /// was skipped because it had already moved past
    /// `pending`/`assigned`. Used directly by the subplanner, which
    /// aggregates child handoffs itself.
    pub async fn execute(&self, task: &Task) -> Option<Handoff> {
        // 1. Acquire a slot; suspends until capacity frees.
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return None; // semaphore closed during shutdown
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self.execute_inner(task).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn execute_inner(&self, task: &Task) -> Option<Handoff> {
        let task_id = task.id.as_str();
        let started = Instant::now();

        // 2. Re-check status; a retry or external transition may have
        //    overtaken this dispatch while it waited for a slot.
        let current = self.queue.get(task_id)?;
        if !matches!(current.status, TaskStatus::Pending | TaskStatus::Assigned) {
            debug!(task_id, status = %current.status, "skipping dispatch; task moved on");
            return None;
        }

        // 3. Register scope claims (overlaps are logged by the tracker).
        let overlaps = self.scope.register(task_id, &task.scope);
        if !overlaps.is_empty() {
            info!(task_id, overlaps = overlaps.len(), "dispatching despite scope overlap");
        }

        if current.status == TaskStatus::Pending {
            if let Err(e) = self.queue.assign(task_id, self.runner.name()) {
                warn!(task_id, error = %e, "failed to assign task");
                self.scope.release(task_id);
                return None;
            }
        }

        // 4. Build the payload.
        let payload = self.build_payload(task);

        // 5. Spawn the sandbox.
        let handle = match self.runner.spawn(&payload).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(task_id, error = %e, "sandbox runner failed to start");
                self.fail_from_any_state(task_id);
                self.scope.release(task_id);
                self.sink.emit(SwarmEvent::WorkerFailed {
                    task_id: task_id.to_owned(),
                    error: e.to_string(),
                });
                return Some(self.synthetic(task_id, format!("runner spawn failed: {e}"), started));
            }
        };

        if let Err(e) = self.queue.start(task_id) {
            warn!(task_id, error = %e, "failed to mark task running");
        }

        // 6. Stream stdout under the wall-clock timeout, retaining only
        //    the last complete line.
        let mut lines = self.runner.lines(&handle);
        let collect = async {
            let mut last_line: Option<String> = None;
            while let Some(line) = lines.next().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                self.observe_interim_line(task_id, trimmed);
                last_line = Some(trimmed.to_owned());
            }
            last_line
        };

        let last_line = match tokio::time::timeout(self.config.worker_timeout, collect).await {
            Ok(last_line) => last_line,
            Err(_elapsed) => {
                warn!(task_id, branch = %task.branch, "worker hit wall-clock timeout");
                if let Err(e) = self.runner.kill(&handle).await {
                    warn!(task_id, error = %e, "failed to kill timed-out worker");
                }
                self.timed_out
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(task.branch.clone());
                self.fail_from_any_state(task_id);
                self.scope.release(task_id);
                self.clear_tool_calls(task_id);
                self.sink.emit(SwarmEvent::WorkerTimeout {
                    task_id: task_id.to_owned(),
                    branch: task.branch.clone(),
                });
                return Some(self.synthetic(task_id, "worker timed out", started));
            }
        };

        // 7. Parse the final line as the handoff.
        let handoff = match last_line {
            Some(line) => match serde_json::from_str::<Handoff>(&line) {
                Ok(handoff) => match handoff.validate(task_id) {
                    Ok(()) => handoff,
                    Err(e) => {
                        warn!(task_id, error = %e, "handoff failed validation");
                        self.fail_from_any_state(task_id);
                        self.scope.release(task_id);
                        self.clear_tool_calls(task_id);
                        self.sink.emit(SwarmEvent::WorkerFailed {
                            task_id: task_id.to_owned(),
                            error: e.to_string(),
                        });
                        return Some(self.synthetic(task_id, format!("invalid handoff: {e}"), started));
                    }
                },
                Err(e) => {
                    warn!(task_id, error = %e, "final stdout line is not a handoff");
                    self.fail_from_any_state(task_id);
                    self.scope.release(task_id);
                    self.clear_tool_calls(task_id);
                    self.sink.emit(SwarmEvent::WorkerFailed {
                        task_id: task_id.to_owned(),
                        error: format!("malformed handoff: {e}"),
                    });
                    return Some(self.synthetic(task_id, format!("malformed handoff: {e}"), started));
                }
            },
            None => {
                warn!(task_id, "worker produced no stdout");
                self.fail_from_any_state(task_id);
                self.scope.release(task_id);
                self.clear_tool_calls(task_id);
                self.sink.emit(SwarmEvent::WorkerFailed {
                    task_id: task_id.to_owned(),
                    error: "no output from worker".to_owned(),
                });
                return Some(self.synthetic(task_id, "no output from worker", started));
            }
        };

        // 8. Apply the reported status and record metrics.
        match handoff.status {
            HandoffStatus::Complete => {
                if let Err(e) = self.queue.complete(task_id) {
                    warn!(task_id, error = %e, "failed to mark task complete");
                }
            }
            // Partial work is treated as a retryable failure; the handoff
            // itself is preserved verbatim for the planner.
            HandoffStatus::Partial | HandoffStatus::Failed => self.fail_from_any_state(task_id),
            HandoffStatus::Blocked => {
                if let Err(e) = self.queue.block(task_id) {
                    warn!(task_id, error = %e, "failed to mark task blocked");
                }
            }
        }

        self.tokens_used
            .fetch_add(handoff.metrics.tokens_used, Ordering::SeqCst);
        if handoff.files_changed.is_empty() {
            self.sink.emit(SwarmEvent::EmptyDiff {
                task_id: task_id.to_owned(),
            });
        }
        if handoff.metrics.tokens_used == 0 && handoff.metrics.tool_call_count == 0 {
            self.sink.emit(SwarmEvent::SuspiciousTask {
                task_id: task_id.to_owned(),
            });
        }

        self.scope.release(task_id);
        self.clear_tool_calls(task_id);
        self.sink.emit(SwarmEvent::TaskCompleted {
            handoff: handoff.clone(),
        });
        info!(
            task_id,
            status = %handoff.status,
            files = handoff.files_changed.len(),
            tokens = handoff.metrics.tokens_used,
            "worker handoff received"
        );
        Some(handoff)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn build_payload(&self, task: &Task) -> WorkerPayload {
        let endpoint = self.next_endpoint();
        WorkerPayload {
            task: task.clone(),
            system_prompt: self
                .config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKER_PROMPT.to_owned()),
            repo_url: self.config.repo_url.clone(),
            git_token: self.config.git_token.clone(),
            llm_config: endpoint,
            trace: Some(TraceContext {
                trace_id: self.trace_id.clone(),
                parent_span_id: Uuid::new_v4().simple().to_string(),
            }),
        }
    }

    fn next_endpoint(&self) -> LlmEndpointConfig {
        let n = self.config.endpoints.len().max(1);
        let idx = self.endpoint_cursor.fetch_add(1, Ordering::Relaxed) % n;
        self.config
            .endpoints
            .get(idx)
            .cloned()
            .unwrap_or(LlmEndpointConfig {
                endpoint: String::new(),
                model: String::new(),
                max_tokens: 0,
                temperature: 0.0,
                api_key: String::new(),
            })
    }

    fn observe_interim_line(&self, task_id: &str, line: &str) {
        match classify_line(line) {
            RunnerLine::Lifecycle(text) => debug!(task_id, %text, "sandbox lifecycle"),
            RunnerLine::Progress {
                worker_id,
                text,
                tool_calls,
            } => {
                if let Some(count) = tool_calls {
                    self.tool_calls
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(task_id.to_owned(), count);
                }
                debug!(task_id, worker_id = %worker_id, %text, "worker progress");
            }
            RunnerLine::Raw(text) => debug!(task_id, %text, "worker output"),
        }
    }

    fn clear_tool_calls(&self, task_id: &str) {
        self.tool_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }

    /// Force a task to `failed` from whatever non-terminal state it is in,
    /// walking the legal transition chain.
    fn fail_from_any_state(&self, task_id: &str) {
        let Some(task) = self.queue.get(task_id) else {
            return;
        };
        match task.status {
            TaskStatus::Running => {
                let _ = self.queue.fail(task_id);
            }
            TaskStatus::Assigned => {
                let _ = self.queue.start(task_id);
                let _ = self.queue.fail(task_id);
            }
            TaskStatus::Pending => {
                let _ = self.queue.assign(task_id, self.runner.name());
                let _ = self.queue.start(task_id);
                let _ = self.queue.fail(task_id);
            }
            _ => {}
        }
    }

    fn synthetic(&self, task_id: &str, summary: impl Into<String>, started: Instant) -> Handoff {
        Handoff::synthetic_failure(task_id, summary, started.elapsed().as_millis() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests (shell-script fake runners; full flows live in tests/)
// ---------------------------------------------------------------------------
