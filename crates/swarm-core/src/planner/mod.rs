//! Planner: the long-running conversational loop that turns a build
//! request into dispatched tasks.
//!
//! One model session spans the whole run. The first turn carries the full
//! repository state; later turns send only deltas plus accumulated
//! handoffs, fleet state, and the latest sweep. The planner is the only
//! component that enqueues-and-dispatches; external fix tasks enter the
//! same pipeline through [`PlannerHandle::inject_task`].

pub mod context;
pub mod parse;
pub mod subplan;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PlannerOptions;
use crate::dispatch::WorkerDispatcher;
use crate::events::{EventSink, SwarmEvent, TaskSource};
use crate::git::GitRepo;
use crate::llm::{LlmClient, LlmSession};
use crate::merge::MergeQueue;
use crate::queue::TaskQueue;
use crate::reconciler::SweepResult;
use crate::scope::ScopeTracker;
use crate::task::{Handoff, HandoffStatus, Task, TaskStatus};

use context::{PLANNER_SYSTEM_PROMPT, RepoSnapshot, SnapshotDelta, TurnContext};
use parse::{ParseError, extract_scratchpad, extract_task_array};
use subplan::SubplanDeps;

/// Initial backoff after a failed planning iteration.
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Idle pause between loop iterations when not planning.
const IDLE_PAUSE: Duration = Duration::from_millis(250);

/// Collaborators the planner is assembled from.
pub struct PlannerDeps {
    pub llm: Arc<dyn LlmClient>,
    pub queue: Arc<TaskQueue>,
    pub dispatcher: Arc<WorkerDispatcher>,
    pub scope: Arc<ScopeTracker>,
    pub merge_queue: Arc<MergeQueue>,
    pub git: GitRepo,
    pub options: PlannerOptions,
    pub max_workers: usize,
    pub max_task_retries: u32,
    pub branch_prefix: String,
    /// Every branch dispatched during the run; read by finalization.
    pub dispatched_branches: Arc<Mutex<HashSet<String>>>,
    pub handoff_rx: mpsc::UnboundedReceiver<Handoff>,
    pub handoff_tx: mpsc::UnboundedSender<Handoff>,
    pub sink: EventSink,
    pub cancel: CancellationToken,
}

/// Cloneable control handle: task injection and sweep delivery.
#[derive(Clone)]
pub struct PlannerHandle {
    inject_tx: mpsc::UnboundedSender<Task>,
    latest_sweep: Arc<Mutex<Option<SweepResult>>>,
}

impl PlannerHandle {
    /// Push an externally-created task into the dispatch pipeline,
    /// bypassing the model. Idempotent for already-dispatched task ids.
    pub fn inject_task(&self, task: Task) {
        if self.inject_tx.send(task).is_err() {
            debug!("planner gone; injected task dropped");
        }
    }

    /// Record the latest sweep result for the next planning turn.
    pub fn set_latest_sweep(&self, sweep: SweepResult) {
        *self.latest_sweep.lock().unwrap_or_else(|e| e.into_inner()) = Some(sweep);
    }
}

/// The planner loop.
pub struct Planner {
    session: LlmSession,
    llm: Arc<dyn LlmClient>,
    queue: Arc<TaskQueue>,
    dispatcher: Arc<WorkerDispatcher>,
    scope: Arc<ScopeTracker>,
    merge_queue: Arc<MergeQueue>,
    git: GitRepo,
    options: PlannerOptions,
    max_workers: usize,
    max_task_retries: u32,
    branch_prefix: String,
    dispatched_branches: Arc<Mutex<HashSet<String>>>,
    handoff_rx: mpsc::UnboundedReceiver<Handoff>,
    handoff_tx: mpsc::UnboundedSender<Handoff>,
    inject_rx: mpsc::UnboundedReceiver<Task>,
    latest_sweep: Arc<Mutex<Option<SweepResult>>>,
    dispatched_ids: HashSet<String>,
    handoff_history: Vec<Handoff>,
    since_last_plan: Vec<Handoff>,
    scratchpad: String,
    prev_snapshot: Option<RepoSnapshot>,
    task_counter: u64,
    iteration: u64,
    sink: EventSink,
    cancel: CancellationToken,
}

impl Planner {
    pub fn new(deps: PlannerDeps) -> (Self, PlannerHandle) {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let latest_sweep = Arc::new(Mutex::new(None));
        let session = LlmSession::new(Arc::clone(&deps.llm), PLANNER_SYSTEM_PROMPT);
        let handle = PlannerHandle {
            inject_tx,
            latest_sweep: Arc::clone(&latest_sweep),
        };
        let planner = Self {
            session,
            llm: deps.llm,
            queue: deps.queue,
            dispatcher: deps.dispatcher,
            scope: deps.scope,
            merge_queue: deps.merge_queue,
            git: deps.git,
            options: deps.options,
            max_workers: deps.max_workers,
            max_task_retries: deps.max_task_retries,
            branch_prefix: deps.branch_prefix,
            dispatched_branches: deps.dispatched_branches,
            handoff_rx: deps.handoff_rx,
            handoff_tx: deps.handoff_tx,
            inject_rx,
            latest_sweep,
            dispatched_ids: HashSet::new(),
            handoff_history: Vec::new(),
            since_last_plan: Vec::new(),
            scratchpad: String::new(),
            prev_snapshot: None,
            task_counter: 0,
            iteration: 0,
            sink: deps.sink,
            cancel: deps.cancel,
        };
        (planner, handle)
    }

    pub fn iterations(&self) -> u64 {
        self.iteration
    }

    pub fn scratchpad(&self) -> &str {
        &self.scratchpad
    }

    /// Every handoff the planner has folded into its session, in arrival
    /// order.
    pub fn handoff_history(&self) -> &[Handoff] {
        &self.handoff_history
    }

    /// Run the planning loop to quiescence (or abort on persistent
    /// failure). The session is disposed on exit.
    pub async fn run(&mut self, request: &str) -> Result<()> {
        let result = self.run_loop(request).await;
        self.session.close();
        result
    }

    async fn run_loop(&mut self, request: &str) -> Result<()> {
        let mut consecutive_errors: u32 = 0;
        let mut backoff = BACKOFF_INITIAL;
        let mut planned_once = false;

        while self.iteration < self.options.max_iterations {
            if self.cancel.is_cancelled() {
                info!("planner cancelled");
                return Ok(());
            }

            self.drain_incoming();

            let active = self.queue.active_count();
            let pending = self.queue.pending_count();
            let capacity = self.dispatcher.active_workers() < self.max_workers;

            let should_plan = capacity
                && (!planned_once
                    || self.since_last_plan.len() >= self.options.min_handoffs_for_replan
                    || (active == 0 && pending == 0));

            if should_plan {
                self.iteration += 1;
                match self.plan_once(request, planned_once).await {
                    Ok(new_tasks) => {
                        planned_once = true;
                        consecutive_errors = 0;
                        backoff = BACKOFF_INITIAL;
                        self.sink.emit(SwarmEvent::IterationComplete {
                            iteration: self.iteration,
                            new_tasks,
                        });
                        if new_tasks == 0
                            && self.queue.active_count() == 0
                            && self.queue.pending_count() == 0
                        {
                            info!(iterations = self.iteration, "planning quiescent, loop done");
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(
                            error = %e,
                            consecutive_errors,
                            "planning iteration failed"
                        );
                        self.sink.emit(SwarmEvent::Error {
                            context: "planner".to_owned(),
                            message: e.to_string(),
                        });
                        tokio::select! {
                            () = tokio::time::sleep(backoff) => {}
                            () = self.cancel.cancelled() => return Ok(()),
                        }
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                        if consecutive_errors >= self.options.max_consecutive_errors {
                            bail!(
                                "planner aborted after {consecutive_errors} consecutive failures: {e}"
                            );
                        }
                    }
                }
            } else {
                tokio::select! {
                    () = tokio::time::sleep(IDLE_PAUSE) => {}
                    () = self.cancel.cancelled() => return Ok(()),
                }
            }
        }

        warn!(max = self.options.max_iterations, "planner hit iteration cap");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Incoming work: handoffs, injections, auto-retry
    // -----------------------------------------------------------------

    fn drain_incoming(&mut self) {
        while let Ok(task) = self.inject_rx.try_recv() {
            self.admit(task, TaskSource::Injected);
        }
        while let Ok(handoff) = self.handoff_rx.try_recv() {
            self.record_handoff(handoff);
        }
    }

    fn record_handoff(&mut self, handoff: Handoff) {
        debug!(task_id = %handoff.task_id, status = %handoff.status, "handoff received by planner");
        if handoff.status != HandoffStatus::Complete {
            self.maybe_auto_retry(&handoff.task_id);
        }
        self.since_last_plan.push(handoff.clone());
        self.handoff_history.push(handoff);
    }

    /// A terminal failed/blocked task with retry budget left goes back to
    /// pending and is re-dispatched.
    fn maybe_auto_retry(&mut self, task_id: &str) {
        let Some(task) = self.queue.get(task_id) else {
            return;
        };
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
            return;
        }
        if task.retry_count >= self.max_task_retries {
            debug!(task_id, "retry budget exhausted; leaving task terminal");
            return;
        }
        match self.queue.retry(task_id) {
            Ok(()) => {
                if let Some(retried) = self.queue.get(task_id) {
                    info!(task_id, retry = retried.retry_count, "auto-retrying task");
                    self.dispatcher.dispatch(retried);
                }
            }
            Err(e) => debug!(task_id, error = %e, "auto-retry rejected"),
        }
    }

    /// Admit a task into the pipeline: enqueue, record, route. Duplicate
    /// ids are dropped, making injection idempotent.
    fn admit(&mut self, task: Task, source: TaskSource) {
        if self.dispatched_ids.contains(&task.id) {
            debug!(task_id = %task.id, "duplicate task id; dropping");
            return;
        }
        if let Err(e) = self.queue.enqueue(task.clone()) {
            debug!(task_id = %task.id, error = %e, "task not admitted");
            return;
        }
        self.dispatched_ids.insert(task.id.clone());
        self.dispatched_branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.branch.clone());
        self.sink.emit(SwarmEvent::TaskCreated {
            task_id: task.id.clone(),
            branch: task.branch.clone(),
            priority: task.priority,
            source,
        });

        if subplan::should_decompose(&task, &self.options, 0) {
            let deps = Arc::new(SubplanDeps {
                llm: Arc::clone(&self.llm),
                dispatcher: Arc::clone(&self.dispatcher),
                queue: Arc::clone(&self.queue),
                options: self.options.clone(),
                branch_prefix: self.branch_prefix.clone(),
                sink: self.sink.clone(),
            });
            let handoff_tx = self.handoff_tx.clone();
            tokio::spawn(async move {
                let aggregate = subplan::run_decomposed(deps, task, 0).await;
                if handoff_tx.send(aggregate).is_err() {
                    debug!("planner gone; aggregate handoff dropped");
                }
            });
        } else {
            self.dispatcher.dispatch(task);
        }
    }

    // -----------------------------------------------------------------
    // Planning turns
    // -----------------------------------------------------------------

    async fn plan_once(&mut self, request: &str, planned_once: bool) -> Result<usize> {
        let snapshot = RepoSnapshot::read(&self.git).await;

        let prompt = match (&self.prev_snapshot, planned_once) {
            (Some(prev), true) => {
                let delta = SnapshotDelta::between(prev, &snapshot);
                let latest_sweep = self
                    .latest_sweep
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .map(SweepResult::summary);
                let active_task_ids: Vec<String> = self
                    .queue
                    .tasks_with_status(TaskStatus::Assigned)
                    .into_iter()
                    .chain(self.queue.tasks_with_status(TaskStatus::Running))
                    .map(|t| t.id)
                    .collect();
                let ctx = TurnContext {
                    delta: &delta,
                    snapshot: &snapshot,
                    new_handoffs: &self.since_last_plan,
                    active_task_ids,
                    merge_stats: self.merge_queue.stats(),
                    merge_queued: self.merge_queue.queued_len(),
                    locked_files: self.scope.locked_files(),
                    latest_sweep,
                };
                context::continuation_prompt(&ctx)
            }
            _ => context::initial_prompt(request, &snapshot),
        };

        let completion = self.session.prompt(prompt).await?;

        if let Some(pad) = extract_scratchpad(&completion.text) {
            self.scratchpad = pad;
        }

        let drafts = match extract_task_array(&completion.text) {
            Ok(drafts) => drafts,
            Err(ParseError::NoArray) => {
                // A response with no array reads as "nothing to emit".
                warn!("planner response carried no task array; treating as empty batch");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut new_tasks = 0;
        for draft in drafts {
            self.task_counter += 1;
            let fallback_id = format!("task-{:03}", self.task_counter);
            let task = draft.into_task(fallback_id, &self.branch_prefix);
            if self.dispatched_ids.contains(&task.id) {
                debug!(task_id = %task.id, "model re-emitted a dispatched task; dropping");
                continue;
            }
            self.admit(task, TaskSource::Planner);
            new_tasks += 1;
        }

        info!(
            iteration = self.iteration,
            new_tasks,
            handoffs_folded = self.since_last_plan.len(),
            "planning turn complete"
        );
        self.since_last_plan.clear();
        self.prev_snapshot = Some(snapshot);
        Ok(new_tasks)
    }
}
