//! Finalization: the terminal bounded-attempt phase that drains unmerged
//! work and re-runs health checks before the run returns.
//!
//! Modelled as an explicit state machine per attempt:
//!
//! ```text
//! Drain -> ReEnqueueUnmerged -> Sweep -> Decide -> { done | inject -> AwaitFixes | give up }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::FinalizationOptions;
use crate::events::{EventSink, SwarmEvent};
use crate::merge::MergeQueue;
use crate::planner::PlannerHandle;
use crate::queue::TaskQueue;
use crate::reconciler::{Reconciler, SweepResult};

/// Poll period while waiting for injected fixes to settle.
const AWAIT_POLL: Duration = Duration::from_millis(500);

/// States of one finalization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizeState {
    Drain,
    ReEnqueueUnmerged,
    Sweep,
    Decide,
    AwaitFixes,
}

/// Outcome of the finalization phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizationReport {
    pub passed: bool,
    pub attempts: u32,
}

/// Collaborators finalization operates over.
pub struct FinalizeCtx {
    pub merge_queue: Arc<MergeQueue>,
    pub reconciler: Arc<Reconciler>,
    pub planner: PlannerHandle,
    pub queue: Arc<TaskQueue>,
    pub dispatched_branches: Arc<Mutex<HashSet<String>>>,
    pub options: FinalizationOptions,
    pub sink: EventSink,
}

impl FinalizeCtx {
    fn unmerged_branches(&self) -> Vec<String> {
        let dispatched = self
            .dispatched_branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let merged = self.merge_queue.merged_branches();
        let mut unmerged: Vec<String> = dispatched.difference(&merged).cloned().collect();
        unmerged.sort();
        unmerged
    }
}

/// Run the finalization phase to completion.
pub async fn run(ctx: &FinalizeCtx) -> FinalizationReport {
    ctx.sink.emit(SwarmEvent::FinalizationStart);
    info!(max_attempts = ctx.options.max_attempts, "finalization starting");

    let mut attempts = 0;
    let mut passed = false;

    'attempts: while attempts < ctx.options.max_attempts {
        attempts += 1;
        let mut state = FinalizeState::Drain;
        let mut sweep: Option<SweepResult> = None;

        loop {
            match state {
                // a. Flush whatever is already queued.
                FinalizeState::Drain => {
                    ctx.merge_queue.drain().await;
                    state = FinalizeState::ReEnqueueUnmerged;
                }

                // b. Give every dispatched-but-unmerged branch a fresh
                //    chance at high priority.
                FinalizeState::ReEnqueueUnmerged => {
                    let unmerged = ctx.unmerged_branches();
                    info!(attempt = attempts, unmerged = unmerged.len(), "re-enqueueing unmerged branches");
                    for branch in &unmerged {
                        ctx.merge_queue.reset_retry_count(branch);
                        ctx.merge_queue.enqueue(branch, 1);
                    }
                    ctx.merge_queue.drain().await;
                    state = FinalizeState::Sweep;
                }

                // c. One synchronous sweep under its own timeout.
                FinalizeState::Sweep => {
                    let timeout = Duration::from_millis(ctx.options.sweep_timeout_ms);
                    sweep = match tokio::time::timeout(timeout, ctx.reconciler.run_sweep()).await {
                        Ok(Ok(result)) => Some(result),
                        Ok(Err(e)) => {
                            warn!(attempt = attempts, error = %e, "finalization sweep failed");
                            None
                        }
                        Err(_) => {
                            warn!(attempt = attempts, "finalization sweep timed out");
                            None
                        }
                    };
                    state = FinalizeState::Decide;
                }

                // d/e. Decide: done, give up, or inject and wait.
                FinalizeState::Decide => {
                    let unmerged = ctx.unmerged_branches();
                    ctx.sink.emit(SwarmEvent::FinalizationAttempt {
                        attempt: attempts,
                        unmerged_branches: unmerged.len(),
                    });

                    let (green, fix_tasks) = match &sweep {
                        Some(s) => (s.is_green(), s.fix_tasks.clone()),
                        None => (false, Vec::new()),
                    };

                    if green && unmerged.is_empty() {
                        info!(attempt = attempts, "finalization passed");
                        passed = true;
                        break 'attempts;
                    }
                    if fix_tasks.is_empty() && unmerged.is_empty() {
                        // Failing checks the model has no answer for.
                        warn!(attempt = attempts, "no fix tasks and nothing to merge; giving up");
                        break 'attempts;
                    }

                    for task in fix_tasks {
                        ctx.planner.inject_task(task);
                    }
                    state = FinalizeState::AwaitFixes;
                }

                // f. Poll until the injected work settles or the attempt
                //    times out, then start the next attempt.
                FinalizeState::AwaitFixes => {
                    let deadline =
                        Instant::now() + Duration::from_millis(ctx.options.attempt_timeout_ms);
                    loop {
                        let active = ctx.queue.active_count();
                        let pending = ctx.queue.pending_count();
                        if active == 0 && pending == 0 {
                            break;
                        }
                        if Instant::now() >= deadline {
                            warn!(attempt = attempts, active, pending, "attempt timeout waiting for fixes");
                            break;
                        }
                        tokio::time::sleep(AWAIT_POLL).await;
                    }
                    break; // next attempt
                }
            }
        }
    }

    ctx.sink.emit(SwarmEvent::FinalizationComplete { passed, attempts });
    info!(passed, attempts, "finalization complete");
    FinalizationReport { passed, attempts }
}
