//! Recursive task decomposition.
//!
//! A task whose scope is large enough is split by a short-lived model
//! session into smaller children that execute concurrently; their
//! handoffs aggregate into a single parent handoff. Nested children
//! follow the same rule up to the configured depth.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::PlannerOptions;
use crate::dispatch::WorkerDispatcher;
use crate::events::{EventSink, SwarmEvent, TaskSource};
use crate::llm::{ChatMessage, LlmClient};
use crate::queue::TaskQueue;
use crate::task::{Handoff, HandoffMetrics, HandoffStatus, Task, TaskStatus};

use super::parse::extract_task_array;

/// Shared collaborators for decomposition runs.
pub struct SubplanDeps {
    pub llm: Arc<dyn LlmClient>,
    pub dispatcher: Arc<WorkerDispatcher>,
    pub queue: Arc<TaskQueue>,
    pub options: PlannerOptions,
    pub branch_prefix: String,
    pub sink: EventSink,
}

/// Whether a task should be routed through the subplanner at this depth.
pub fn should_decompose(task: &Task, options: &PlannerOptions, depth: u32) -> bool {
    task.scope.len() >= options.decompose_threshold && depth < options.max_depth
}

/// Decompose `parent` and run its children to completion, returning the
/// aggregated handoff. The parent task's status is driven to the
/// aggregate outcome.
pub fn run_decomposed(
    deps: Arc<SubplanDeps>,
    parent: Task,
    depth: u32,
) -> Pin<Box<dyn Future<Output = Handoff> + Send>> {
    Box::pin(async move {
        info!(task_id = %parent.id, depth, scope = parent.scope.len(), "decomposing task");

        let children = match split_into_children(&deps, &parent).await {
            Ok(children) => children,
            Err(e) => {
                warn!(task_id = %parent.id, error = %e, "decomposition failed");
                drive_parent(&deps.queue, &parent.id, HandoffStatus::Failed);
                return Handoff::synthetic_failure(
                    &parent.id,
                    format!("decomposition failed: {e}"),
                    0,
                );
            }
        };

        if children.is_empty() {
            warn!(task_id = %parent.id, "decomposition produced no children");
            drive_parent(&deps.queue, &parent.id, HandoffStatus::Blocked);
            let mut handoff =
                Handoff::synthetic_failure(&parent.id, "decomposition produced no subtasks", 0);
            handoff.status = HandoffStatus::Blocked;
            return handoff;
        }

        // Enqueue every child, then run them concurrently; the dispatch
        // semaphore still bounds actual parallelism.
        for child in &children {
            if let Err(e) = deps.queue.enqueue(child.clone()) {
                warn!(child_id = %child.id, error = %e, "failed to enqueue subtask");
            } else {
                deps.sink.emit(SwarmEvent::TaskCreated {
                    task_id: child.id.clone(),
                    branch: child.branch.clone(),
                    priority: child.priority,
                    source: TaskSource::Subplanner,
                });
            }
        }

        let child_runs = children.iter().map(|child| {
            let deps = Arc::clone(&deps);
            let child = child.clone();
            async move {
                if should_decompose(&child, &deps.options, depth + 1) {
                    run_decomposed(Arc::clone(&deps), child, depth + 1).await
                } else {
                    let child_id = child.id.clone();
                    match deps.dispatcher.execute(&child).await {
                        Some(handoff) => handoff,
                        None => Handoff::synthetic_failure(&child_id, "subtask skipped", 0),
                    }
                }
            }
        });
        let handoffs = futures::future::join_all(child_runs).await;

        let aggregate = aggregate_handoffs(&parent.id, &handoffs);
        drive_parent(&deps.queue, &parent.id, aggregate.status);
        info!(
            task_id = %parent.id,
            children = handoffs.len(),
            status = %aggregate.status,
            "decomposed task finished"
        );
        aggregate
    })
}

/// Ask a short-lived session to split the parent into children, filtered
/// to the parent's scope and capped at `max_subtasks`.
async fn split_into_children(deps: &SubplanDeps, parent: &Task) -> anyhow::Result<Vec<Task>> {
    let messages = [
        ChatMessage::system(
            "You split one large coding task into smaller independent subtasks. \
             Respond with ONLY a JSON array: \
             [{\"description\": string, \"scope\": [file paths], \"acceptance\": string}]. \
             Every subtask scope must be a subset of the parent scope.",
        ),
        ChatMessage::user(format!(
            "Parent task: {}\n\nAcceptance: {}\n\nScope ({} files):\n{}\n\n\
             Split this into at most {} subtasks.",
            parent.description,
            parent.acceptance,
            parent.scope.len(),
            parent.scope.join("\n"),
            deps.options.max_subtasks,
        )),
    ];

    let completion = deps.llm.complete(&messages).await?;
    let drafts = extract_task_array(&completion.text)?;

    let parent_scope: HashSet<&String> = parent.scope.iter().collect();
    let mut children = Vec::new();
    for (i, draft) in drafts
        .into_iter()
        .take(deps.options.max_subtasks)
        .enumerate()
    {
        if draft.description.trim().is_empty() {
            continue;
        }
        let id = format!("{}.{}", parent.id, i + 1);
        let mut child = draft.into_task(id, &deps.branch_prefix);
        // Children may only touch files the parent claimed.
        child.scope.retain(|f| parent_scope.contains(f));
        child.priority = parent.priority;
        child.parent_id = Some(parent.id.clone());
        children.push(child);
    }
    Ok(children)
}

/// Combine child handoffs into the parent's handoff: complete if all
/// children completed, failed if all failed, partial if mixed, blocked
/// otherwise. Metrics are summed except duration, which takes the max.
fn aggregate_handoffs(parent_id: &str, handoffs: &[Handoff]) -> Handoff {
    let total = handoffs.len();
    let complete = handoffs
        .iter()
        .filter(|h| h.status == HandoffStatus::Complete)
        .count();
    let failed = handoffs
        .iter()
        .filter(|h| h.status == HandoffStatus::Failed)
        .count();

    let status = if total == 0 {
        HandoffStatus::Blocked
    } else if complete == total {
        HandoffStatus::Complete
    } else if failed == total {
        HandoffStatus::Failed
    } else if complete > 0 || handoffs.iter().any(|h| h.status == HandoffStatus::Partial) {
        HandoffStatus::Partial
    } else {
        HandoffStatus::Blocked
    };

    let mut metrics = HandoffMetrics::default();
    let mut files_changed = Vec::new();
    let mut seen_files = HashSet::new();
    let mut concerns = Vec::new();
    let mut suggestions = Vec::new();
    let mut summary_lines = Vec::new();
    for handoff in handoffs {
        metrics.absorb(&handoff.metrics);
        for file in &handoff.files_changed {
            if seen_files.insert(file.clone()) {
                files_changed.push(file.clone());
            }
        }
        concerns.extend(handoff.concerns.iter().cloned());
        suggestions.extend(handoff.suggestions.iter().cloned());
        summary_lines.push(format!("[{}] {}: {}", handoff.status, handoff.task_id, handoff.summary));
    }

    Handoff {
        task_id: parent_id.to_owned(),
        status,
        summary: summary_lines.join("\n"),
        diff: String::new(),
        files_changed,
        concerns,
        suggestions,
        metrics,
    }
}

/// Drive the parent task's queue record to the aggregate outcome.
fn drive_parent(queue: &TaskQueue, parent_id: &str, status: HandoffStatus) {
    let Some(task) = queue.get(parent_id) else {
        return;
    };
    if task.status == TaskStatus::Pending {
        let _ = queue.assign(parent_id, "subplanner");
    }
    if matches!(queue.get(parent_id).map(|t| t.status), Some(TaskStatus::Assigned)) {
        let _ = queue.start(parent_id);
    }
    match status {
        HandoffStatus::Complete => {
            let _ = queue.complete(parent_id);
        }
        HandoffStatus::Partial | HandoffStatus::Failed => {
            let _ = queue.fail(parent_id);
        }
        HandoffStatus::Blocked => {
            let _ = queue.block(parent_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
