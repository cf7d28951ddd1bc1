//! Top-level assembly: wires the queue, scope tracker, merge queue,
//! dispatcher, reconciler, and planner; runs the planner loop to
//! quiescence; then executes the finalization phase.
//!
//! Components talk over typed channels; this module owns the single event
//! consumer, the observer registry, and the JSONL event log.

pub mod finalize;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::dispatch::{DispatchConfig, WorkerDispatcher};
use crate::events::{EventLog, EventRecord, EventSink, MetricsSnapshot, SwarmEvent};
use crate::git::GitRepo;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::merge::{ConflictInfo, MergeQueue};
use crate::planner::{Planner, PlannerDeps, PlannerHandle};
use crate::queue::TaskQueue;
use crate::reconciler::Reconciler;
use crate::runner::{LlmEndpointConfig, SandboxRunner, SubprocessRunner};
use crate::scope::ScopeTracker;
use crate::task::Task;

use finalize::{FinalizationReport, FinalizeCtx};

/// Branch-name marker identifying conflict-fix work; conflicts on such
/// branches never spawn further conflict-fix tasks.
const CONFLICT_FIX_MARKER: &str = "conflict-fix";

/// Observer over the orchestrator's event stream.
pub type EventObserver = Box<dyn Fn(&EventRecord) + Send + Sync>;

/// Build an orchestrator from configuration with the production LLM
/// client and subprocess sandbox runner.
pub async fn create_orchestrator(mut config: SwarmConfig) -> Result<Orchestrator> {
    config.validate()?;
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::from_options(&config.llm)?);
    let runner: Arc<dyn SandboxRunner> =
        Arc::new(SubprocessRunner::new(config.runner.executable.clone()));
    Orchestrator::new(config, llm, runner).await
}

/// The assembled control plane.
pub struct Orchestrator {
    config: SwarmConfig,
    queue: Arc<TaskQueue>,
    merge_queue: Arc<MergeQueue>,
    dispatcher: Arc<WorkerDispatcher>,
    reconciler: Arc<Reconciler>,
    planner: Option<Planner>,
    planner_handle: PlannerHandle,
    dispatched_branches: Arc<Mutex<HashSet<String>>>,
    sink: EventSink,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<EventRecord>>>,
    observers: Arc<Mutex<Vec<EventObserver>>>,
    metrics: Arc<Mutex<MetricsSnapshot>>,
    cancel: CancellationToken,
    running: AtomicBool,
    started: AtomicBool,
    services: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wire all components. The working copy must already exist at
    /// `config.target_repo_path`.
    pub async fn new(
        config: SwarmConfig,
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn SandboxRunner>,
    ) -> Result<Self> {
        let git = GitRepo::open(
            &config.target_repo_path,
            &config.git.main_branch,
            (!config.git.repo_url.is_empty()).then(|| config.git.repo_url.clone()),
            (!config.git.token.is_empty()).then(|| config.git.token.clone()),
        )
        .await
        .context("target repository is not usable")?;

        let (sink, event_rx) = EventSink::channel();
        let cancel = CancellationToken::new();

        let queue = Arc::new(TaskQueue::new(config.max_task_retries));
        {
            // Mirror queue transitions onto the event stream.
            let sink = sink.clone();
            queue.on_status_change(Box::new(move |task, from| {
                sink.emit(SwarmEvent::TaskStatusChanged {
                    task_id: task.id.clone(),
                    from,
                    to: task.status,
                });
            }));
        }
        let scope = Arc::new(ScopeTracker::new());

        let merge_queue = Arc::new(MergeQueue::new(
            git.clone(),
            config.merge_strategy,
            config.max_conflict_retries,
            sink.clone(),
        ));

        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let endpoints: Vec<LlmEndpointConfig> = config
            .llm
            .endpoints
            .iter()
            .map(|endpoint| LlmEndpointConfig {
                endpoint: endpoint.clone(),
                model: config.llm.model.clone(),
                max_tokens: config.llm.max_tokens,
                temperature: config.llm.temperature,
                api_key: config.llm.api_key.clone(),
            })
            .collect();
        let dispatcher = Arc::new(WorkerDispatcher::new(
            runner,
            Arc::clone(&queue),
            Arc::clone(&scope),
            DispatchConfig {
                max_workers: config.max_workers,
                worker_timeout: config.worker_timeout(),
                system_prompt: config.worker_system_prompt.clone(),
                repo_url: config.git.repo_url.clone(),
                git_token: config.git.token.clone(),
                endpoints,
            },
            handoff_tx.clone(),
            sink.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            git.clone(),
            Arc::clone(&llm),
            Arc::clone(&merge_queue),
            config.reconciler.clone(),
            config.git.branch_prefix.clone(),
            sink.clone(),
        ));

        let dispatched_branches = Arc::new(Mutex::new(HashSet::new()));
        let (planner, planner_handle) = Planner::new(PlannerDeps {
            llm,
            queue: Arc::clone(&queue),
            dispatcher: Arc::clone(&dispatcher),
            scope: Arc::clone(&scope),
            merge_queue: Arc::clone(&merge_queue),
            git: git.clone(),
            options: config.planner.clone(),
            max_workers: config.max_workers,
            max_task_retries: config.max_task_retries,
            branch_prefix: config.git.branch_prefix.clone(),
            dispatched_branches: Arc::clone(&dispatched_branches),
            handoff_rx,
            handoff_tx,
            sink: sink.clone(),
            cancel: cancel.child_token(),
        });

        let metrics = Arc::new(Mutex::new(MetricsSnapshot::default()));

        let orchestrator = Self {
            config,
            queue,
            merge_queue,
            dispatcher,
            reconciler,
            planner: Some(planner),
            planner_handle,
            dispatched_branches,
            sink,
            event_rx: Mutex::new(Some(event_rx)),
            observers: Arc::new(Mutex::new(Vec::new())),
            metrics,
            cancel,
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            services: Mutex::new(Vec::new()),
        };
        orchestrator.wire_conflict_handler();
        Ok(orchestrator)
    }

    /// Register an observer over every event the run emits.
    pub fn on_event(&self, observer: EventObserver) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn planner_handle(&self) -> PlannerHandle {
        self.planner_handle.clone()
    }

    /// Token observed by every long-running component; cancelling it
    /// winds the run down gracefully.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current aggregate metrics.
    pub fn get_snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let merge_stats = self.merge_queue.stats();
        snapshot.total_merged = merge_stats.total_merged;
        snapshot.total_skipped = merge_stats.total_skipped;
        snapshot.total_failed_merges = merge_stats.total_failed;
        snapshot.total_conflicts = merge_stats.total_conflicts;
        snapshot.tokens_used = self.dispatcher.tokens_used();
        snapshot
    }

    /// Start background services. Safe to call more than once.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());

        // Event consumer: completed-branch routing into the merge queue,
        // metrics aggregation, observers, JSONL log.
        if let Some(mut event_rx) = self.event_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            let metrics = Arc::clone(&self.metrics);
            let observers = Arc::clone(&self.observers);
            let queue = Arc::clone(&self.queue);
            let merge_queue = Arc::clone(&self.merge_queue);
            let log = match EventLog::open(&self.config.event_log_path) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!(error = %e, path = %self.config.event_log_path.display(), "event log unavailable");
                    None
                }
            };
            services.push(tokio::spawn(async move {
                while let Some(record) = event_rx.recv().await {
                    if let SwarmEvent::TaskCompleted { handoff } = &record.event {
                        if handoff.status == crate::task::HandoffStatus::Complete {
                            if let Some(task) = queue.get(&handoff.task_id) {
                                merge_queue.enqueue(&task.branch, task.priority);
                            }
                        }
                    }
                    aggregate_metrics(&metrics, &record.event);
                    if let Some(log) = &log {
                        log.append(&record);
                    }
                    let observers = observers.lock().unwrap_or_else(|e| e.into_inner());
                    for observer in observers.iter() {
                        observer(&record);
                    }
                }
            }));
        }

        // Merge queue background tick.
        {
            let merge_queue = Arc::clone(&self.merge_queue);
            let tick_ms = self.config.merge_tick_ms;
            let cancel = self.cancel.child_token();
            services.push(tokio::spawn(async move {
                merge_queue.run_background(tick_ms, cancel).await;
            }));
        }

        // Reconciler sweeps plus the sweep consumer.
        {
            let (sweep_tx, mut sweep_rx) = mpsc::channel(8);
            let reconciler = Arc::clone(&self.reconciler);
            let cancel = self.cancel.child_token();
            services.push(tokio::spawn(async move {
                reconciler.run_background(sweep_tx, cancel).await;
            }));

            let planner_handle = self.planner_handle.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            let metrics = Arc::clone(&self.metrics);
            services.push(tokio::spawn(async move {
                while let Some(sweep) = sweep_rx.recv().await {
                    let fix_tasks = sweep.fix_tasks.clone();
                    planner_handle.set_latest_sweep(sweep);
                    if !fix_tasks.is_empty() {
                        let mut metrics = metrics.lock().unwrap_or_else(|e| e.into_inner());
                        metrics.fix_tasks_injected += fix_tasks.len() as u64;
                    }
                    for task in fix_tasks {
                        planner_handle.inject_task(task);
                    }
                    // Timed-out branches drain after each sweep; they stay
                    // in the dispatched set for finalization retry.
                    let timed_out = dispatcher.drain_timed_out_branches();
                    if !timed_out.is_empty() {
                        info!(branches = ?timed_out, "preserving timed-out branches for finalization");
                    }
                }
            }));
        }

        // Health monitor.
        {
            let sink = self.sink.clone();
            let metrics = Arc::clone(&self.metrics);
            let merge_queue = Arc::clone(&self.merge_queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            let interval = Duration::from_secs(self.config.health_check_interval_secs.max(1));
            let cancel = self.cancel.child_token();
            services.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {}
                        () = cancel.cancelled() => return,
                    }
                    let mut snapshot = metrics.lock().unwrap_or_else(|e| e.into_inner()).clone();
                    let stats = merge_queue.stats();
                    snapshot.total_merged = stats.total_merged;
                    snapshot.total_skipped = stats.total_skipped;
                    snapshot.total_failed_merges = stats.total_failed;
                    snapshot.total_conflicts = stats.total_conflicts;
                    snapshot.tokens_used = dispatcher.tokens_used();
                    sink.emit(SwarmEvent::MetricsUpdate { snapshot });
                }
            }));
        }
    }

    /// Drive a full run: planner loop, then finalization, then the final
    /// metrics snapshot. Always returns a snapshot, even for truncated
    /// sessions.
    pub async fn run(&mut self, request: &str) -> MetricsSnapshot {
        let started_at = Instant::now();
        self.start();

        // Planner loop to quiescence.
        if let Some(mut planner) = self.planner.take() {
            if let Err(e) = planner.run(request).await {
                warn!(error = %e, "planner aborted");
                self.sink.emit(SwarmEvent::Error {
                    context: "planner".to_owned(),
                    message: e.to_string(),
                });
            }
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.planner_iterations = planner.iterations();
        } else {
            warn!("run() called twice; planner already consumed");
        }

        // Finalization phase.
        if self.config.finalization.enabled {
            let ctx = FinalizeCtx {
                merge_queue: Arc::clone(&self.merge_queue),
                reconciler: Arc::clone(&self.reconciler),
                planner: self.planner_handle.clone(),
                queue: Arc::clone(&self.queue),
                dispatched_branches: Arc::clone(&self.dispatched_branches),
                options: self.config.finalization.clone(),
                sink: self.sink.clone(),
            };
            let FinalizationReport { passed, attempts } = finalize::run(&ctx).await;
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.finalization_passed = passed;
            metrics.finalization_attempts = attempts;
        }

        {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.wall_time_ms = started_at.elapsed().as_millis() as u64;
        }

        self.stop().await;
        self.get_snapshot()
    }

    /// Stop background services. Idempotent; safe whether the planner is
    /// mid-loop or idle.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        // Give the event consumer a moment to flush, then detach services.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        for service in services.drain(..) {
            service.abort();
        }
        info!("orchestrator stopped");
    }

    /// Conflict-callback wiring: bounded conflict-fix task injection with
    /// cascade prevention.
    fn wire_conflict_handler(&self) {
        let planner = self.planner_handle.clone();
        let metrics = Arc::clone(&self.metrics);
        let budget = self.config.max_conflict_fix_tasks;
        let used = Arc::new(AtomicU64::new(0));
        let counter = Arc::new(AtomicU64::new(0));
        let branch_prefix = self.config.git.branch_prefix.clone();

        self.merge_queue.on_conflict(Box::new(move |info: &ConflictInfo| {
            if info.branch.contains(CONFLICT_FIX_MARKER) {
                debug!(branch = %info.branch, "conflict on a conflict-fix branch; not cascading");
                return;
            }
            let spent = used.fetch_add(1, Ordering::SeqCst);
            if spent >= budget {
                warn!(
                    branch = %info.branch,
                    budget,
                    "conflict-fix budget exhausted; preserving branch for finalization"
                );
                return;
            }
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("{CONFLICT_FIX_MARKER}-{n:03}");
            let mut task = Task::new(
                id,
                format!("Resolve merge conflicts on branch {}", info.branch),
                &branch_prefix,
            )
            .with_scope(info.conflicting_files.clone())
            .with_priority(1)
            .with_acceptance(
                "The branch rebases onto the mainline and merges without conflicts.",
            );
            // The fix happens on the conflicting branch itself.
            task.branch = info.branch.clone();
            task.conflict_source = Some(info.branch.clone());
            {
                let mut metrics = metrics.lock().unwrap_or_else(|e| e.into_inner());
                metrics.conflict_fix_tasks_injected += 1;
            }
            info!(task_id = %task.id, branch = %task.branch, "injecting conflict-fix task");
            planner.inject_task(task);
        }));
    }
}

/// Fold one event into the aggregate counters.
fn aggregate_metrics(metrics: &Mutex<MetricsSnapshot>, event: &SwarmEvent) {
    let mut metrics = metrics.lock().unwrap_or_else(|e| e.into_inner());
    match event {
        SwarmEvent::TaskCreated { .. } => {
            metrics.tasks_created += 1;
        }
        SwarmEvent::TaskCompleted { handoff } => {
            if handoff.status == crate::task::HandoffStatus::Complete {
                metrics.tasks_completed += 1;
            }
        }
        SwarmEvent::TaskStatusChanged { to, .. } => match to {
            crate::task::TaskStatus::Failed => metrics.failed_tasks += 1,
            crate::task::TaskStatus::Blocked => metrics.blocked_tasks += 1,
            _ => {}
        },
        SwarmEvent::EmptyDiff { .. } => metrics.empty_diffs += 1,
        SwarmEvent::SuspiciousTask { .. } => metrics.suspicious_tasks += 1,
        SwarmEvent::SweepComplete { .. } => metrics.sweeps += 1,
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests (full-run scenarios live in tests/)
// ---------------------------------------------------------------------------
