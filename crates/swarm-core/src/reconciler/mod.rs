//! Reconciler: periodic build/test/conflict sweeps with adaptive cadence.
//!
//! Each sweep runs the configured typed check, build, and test commands in
//! the target working copy, scans for unresolved conflict markers, and on
//! failure asks the language model for targeted fix tasks. Fix tasks are
//! never enqueued here; the sweep result is delivered to subscribers and
//! the orchestrator decides to inject them into the planner.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconcilerOptions;
use crate::events::{EventSink, SwarmEvent, SweepSummary};
use crate::git::GitRepo;
use crate::llm::{ChatMessage, LlmClient};
use crate::merge::MergeQueue;
use crate::planner::parse::extract_task_array;
use crate::task::Task;

/// Source-file extensions scanned for conflict markers.
const CONFLICT_SCAN_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "rs", "py", "go", "java", "rb", "c", "h", "cpp", "hpp", "cs",
];

/// Output patterns that mean a check is simply not configured for this
/// project; such a check counts as green regardless of exit code.
const NOT_CONFIGURED_PATTERNS: &[&str] = &[
    "not configured",
    "command not found",
    "Missing script",
    "missing script",
    "no test specified",
    "No such file or directory",
];

/// Cap on build/test output forwarded into the fix-task prompt.
const OUTPUT_TRUNCATE_CHARS: usize = 4_000;

/// Floor the adaptive interval never drops below, unless the configured
/// ceiling is already lower.
const INTERVAL_FLOOR_MS: u64 = 60_000;

/// Consecutive green sweeps required before the interval is restored to
/// its ceiling.
const GREEN_STREAK_FOR_RESTORE: u32 = 3;

/// Result of one sweep.
#[derive(Debug, Clone)]
pub struct SweepResult {
    pub build_ok: bool,
    pub tests_ok: bool,
    pub has_conflict_markers: bool,
    pub conflict_files: Vec<String>,
    pub fix_tasks: Vec<Task>,
    pub build_output: String,
    pub test_output: String,
    /// Merges landed while the sweep ran; results are stale and no fix
    /// tasks were generated.
    pub stale: bool,
}

impl SweepResult {
    pub fn is_green(&self) -> bool {
        self.build_ok && self.tests_ok && !self.has_conflict_markers
    }

    pub fn summary(&self) -> SweepSummary {
        SweepSummary {
            build_ok: self.build_ok,
            tests_ok: self.tests_ok,
            has_conflict_markers: self.has_conflict_markers,
            conflict_files: self.conflict_files.clone(),
            fix_task_count: self.fix_tasks.len(),
        }
    }
}

struct CheckOutcome {
    ok: bool,
    output: String,
}

struct ReconcilerState {
    green_streak: u32,
    /// File paths covered by recently-generated fix tasks; cleared on
    /// green sweeps.
    recent_fix_scopes: HashSet<String>,
    fix_counter: u64,
    interval_ms: u64,
}

/// Periodic sweeper over the shared working copy.
pub struct Reconciler {
    git: GitRepo,
    llm: Arc<dyn LlmClient>,
    merge_queue: Arc<MergeQueue>,
    options: ReconcilerOptions,
    branch_prefix: String,
    state: Mutex<ReconcilerState>,
    sink: EventSink,
}

impl Reconciler {
    pub fn new(
        git: GitRepo,
        llm: Arc<dyn LlmClient>,
        merge_queue: Arc<MergeQueue>,
        options: ReconcilerOptions,
        branch_prefix: String,
        sink: EventSink,
    ) -> Self {
        let interval_ms = options.interval_ms;
        Self {
            git,
            llm,
            merge_queue,
            options,
            branch_prefix,
            state: Mutex::new(ReconcilerState {
                green_streak: 0,
                recent_fix_scopes: HashSet::new(),
                fix_counter: 0,
                interval_ms,
            }),
            sink,
        }
    }

    /// Current adaptive sweep interval.
    pub fn current_interval_ms(&self) -> u64 {
        self.lock_state().interval_ms
    }

    fn interval_floor(&self) -> u64 {
        INTERVAL_FLOOR_MS.min(self.options.interval_ms)
    }

    /// Background sweep loop delivering results to `tx`.
    pub async fn run_background(&self, tx: mpsc::Sender<SweepResult>, cancel: CancellationToken) {
        loop {
            let interval = self.current_interval_ms();
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(interval)) => {}
                () = cancel.cancelled() => return,
            }
            match self.run_sweep().await {
                Ok(result) => {
                    if tx.send(result).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "sweep aborted; will retry next cycle");
                }
            }
        }
    }

    /// Run one sweep: checks, conflict scan, and (when failing) fix-task
    /// generation. The LLM call failing aborts the sweep with an error
    /// after tightening the cadence; the next cycle retries.
    pub async fn run_sweep(&self) -> Result<SweepResult> {
        let merged_before = self.merge_queue.stats().total_merged;

        // Typed check and project build fold into one build verdict.
        let check = self.run_check(self.options.check_command.as_deref()).await;
        let build = self.run_check(self.options.build_command.as_deref()).await;
        let tests = self.run_check(self.options.test_command.as_deref()).await;

        let build_ok = check.ok && build.ok;
        let tests_ok = tests.ok;
        let build_output = join_outputs(&check.output, &build.output);
        let test_output = tests.output;

        let conflict_files = self
            .git
            .conflict_marker_files(CONFLICT_SCAN_EXTENSIONS)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "conflict marker scan failed");
                Vec::new()
            });
        let has_conflict_markers = !conflict_files.is_empty();

        // Green path: streak bookkeeping and interval restoration.
        if build_ok && tests_ok && !has_conflict_markers {
            let result = SweepResult {
                build_ok,
                tests_ok,
                has_conflict_markers,
                conflict_files,
                fix_tasks: Vec::new(),
                build_output,
                test_output,
                stale: false,
            };
            {
                let mut state = self.lock_state();
                state.green_streak += 1;
                state.recent_fix_scopes.clear();
                if state.green_streak >= GREEN_STREAK_FOR_RESTORE {
                    state.interval_ms = self.options.interval_ms;
                }
                info!(green_streak = state.green_streak, "sweep green");
            }
            self.sink.emit(SwarmEvent::SweepComplete {
                sweep: result.summary(),
            });
            return Ok(result);
        }

        // Stale path: merges landed mid-sweep, results no longer describe
        // the current mainline.
        if self.merge_queue.stats().total_merged > merged_before {
            info!("sweep results stale (merges landed mid-sweep), no action");
            let result = SweepResult {
                build_ok,
                tests_ok,
                has_conflict_markers,
                conflict_files,
                fix_tasks: Vec::new(),
                build_output,
                test_output,
                stale: true,
            };
            self.sink.emit(SwarmEvent::SweepComplete {
                sweep: result.summary(),
            });
            return Ok(result);
        }

        // Failure path tightens the cadence whether or not the model
        // produces usable fix tasks.
        {
            let mut state = self.lock_state();
            state.green_streak = 0;
            state.interval_ms = self.interval_floor();
        }

        let fix_tasks = self
            .generate_fix_tasks(&build_output, &test_output, &conflict_files)
            .await?;

        let result = SweepResult {
            build_ok,
            tests_ok,
            has_conflict_markers,
            conflict_files,
            fix_tasks,
            build_output,
            test_output,
            stale: false,
        };
        self.sink.emit(SwarmEvent::SweepComplete {
            sweep: result.summary(),
        });
        Ok(result)
    }

    // -----------------------------------------------------------------
    // Command execution
    // -----------------------------------------------------------------

    async fn run_check(&self, command: Option<&str>) -> CheckOutcome {
        let Some(command) = command.filter(|c| !c.trim().is_empty()) else {
            return CheckOutcome {
                ok: true,
                output: String::new(),
            };
        };

        match self.run_shell(command).await {
            Ok((status_ok, output)) => {
                if status_ok {
                    CheckOutcome { ok: true, output }
                } else if NOT_CONFIGURED_PATTERNS.iter().any(|p| output.contains(p)) {
                    debug!(command, "check not configured for this project; treating as green");
                    CheckOutcome { ok: true, output }
                } else {
                    CheckOutcome { ok: false, output }
                }
            }
            Err(e) => {
                warn!(command, error = %e, "check command failed to run");
                CheckOutcome {
                    ok: false,
                    output: e.to_string(),
                }
            }
        }
    }

    /// Run a shell command in the working copy, capturing interleaved
    /// stdout/stderr with a timeout.
    async fn run_shell(&self, command: &str) -> Result<(bool, String)> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.git.path())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn check command {command:?}"))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let timeout = Duration::from_secs(self.options.command_timeout_secs.max(1));
        match tokio::time::timeout(timeout, async {
            let (wait, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
            (wait, stdout, stderr)
        })
        .await
        {
            Ok((Ok(status), stdout, stderr)) => {
                Ok((status.success(), join_outputs(&stdout, &stderr)))
            }
            Ok((Err(e), _, _)) => {
                Err(e).with_context(|| format!("failed to wait on check command {command:?}"))
            }
            Err(_) => {
                let _ = child.kill().await;
                Ok((false, format!("check command {command:?} timed out")))
            }
        }
    }

    // -----------------------------------------------------------------
    // Fix-task generation
    // -----------------------------------------------------------------

    async fn generate_fix_tasks(
        &self,
        build_output: &str,
        test_output: &str,
        conflict_files: &[String],
    ) -> Result<Vec<Task>> {
        let prompt = self.compose_fix_prompt(build_output, test_output, conflict_files).await;
        let messages = [
            ChatMessage::system(
                "You repair a shared codebase. Respond with ONLY a JSON array of fix tasks, \
                 each {\"description\": string, \"scope\": [file paths], \"acceptance\": string}. \
                 Emit the smallest set of targeted tasks that makes the build and tests green.",
            ),
            ChatMessage::user(prompt),
        ];

        let llm_timeout = Duration::from_millis(self.options.llm_timeout_ms);
        let completion = tokio::time::timeout(llm_timeout, self.llm.complete(&messages))
            .await
            .context("fix-task LLM call timed out")?
            .context("fix-task LLM call failed")?;

        let drafts = extract_task_array(&completion.text)
            .context("fix-task response did not contain a task array")?;

        let mut state = self.lock_state();
        let mut tasks = Vec::new();
        for draft in drafts.into_iter().take(self.options.max_fix_tasks) {
            // Skip tasks whose scope is wholly covered by recent fixes.
            if !draft.scope.is_empty()
                && draft.scope.iter().all(|f| state.recent_fix_scopes.contains(f))
            {
                debug!(scope = ?draft.scope, "dropping fix task; scope already covered");
                continue;
            }
            state.fix_counter += 1;
            let id = format!("fix-{:03}", state.fix_counter);
            let mut task = draft.into_task(id, &self.branch_prefix);
            task.priority = 1;
            for file in &task.scope {
                state.recent_fix_scopes.insert(file.clone());
            }
            tasks.push(task);
        }
        info!(count = tasks.len(), "generated fix tasks");
        Ok(tasks)
    }

    async fn compose_fix_prompt(
        &self,
        build_output: &str,
        test_output: &str,
        conflict_files: &[String],
    ) -> String {
        let commits = self.git.recent_commits(10).await.unwrap_or_default();
        let pending_scopes: Vec<String> = {
            let state = self.lock_state();
            let mut scopes: Vec<String> = state.recent_fix_scopes.iter().cloned().collect();
            scopes.sort();
            scopes
        };

        let mut prompt = String::with_capacity(2048);
        prompt.push_str("The shared mainline is failing its health checks.\n\n");
        prompt.push_str("## Build output (truncated)\n");
        prompt.push_str(&truncate_tail(build_output, OUTPUT_TRUNCATE_CHARS));
        prompt.push_str("\n\n## Test output (truncated)\n");
        prompt.push_str(&truncate_tail(test_output, OUTPUT_TRUNCATE_CHARS));
        prompt.push_str("\n\n## Recent commits\n");
        for commit in &commits {
            prompt.push_str("- ");
            prompt.push_str(commit);
            prompt.push('\n');
        }
        if !pending_scopes.is_empty() {
            prompt.push_str(
                "\n## Files already covered by pending fix tasks (do not re-fix)\n",
            );
            for scope in &pending_scopes {
                prompt.push_str("- ");
                prompt.push_str(scope);
                prompt.push('\n');
            }
        }
        if !conflict_files.is_empty() {
            prompt.push_str("\n## Files with unresolved conflict markers\n");
            for file in conflict_files {
                prompt.push_str("- ");
                prompt.push_str(file);
                prompt.push('\n');
            }
        }
        prompt.push_str(&format!(
            "\nEmit at most {} fix tasks as a JSON array.",
            self.options.max_fix_tasks
        ));
        prompt
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReconcilerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn join_outputs(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_owned(),
        (_, true) => a.to_owned(),
        _ => format!("{a}\n{b}"),
    }
}

/// Keep the tail of long output; failures usually report at the end.
fn truncate_tail(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_owned();
    }
    let tail: String = s
        .chars()
        .rev()
        .take(max_chars)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

// ---------------------------------------------------------------------------
// Tests (sweep flows with real commands live in tests/)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_the_tail() {
        let long = format!("{}END", "x".repeat(5000));
        let truncated = truncate_tail(&long, 100);
        assert!(truncated.ends_with("END"));
        assert!(truncated.starts_with("..."));
        assert!(truncated.chars().count() <= 103);
    }

    #[test]
    fn truncate_short_passthrough() {
        assert_eq!(truncate_tail("short", 100), "short");
    }

    #[test]
    fn join_outputs_skips_empties() {
        assert_eq!(join_outputs("", "b"), "b");
        assert_eq!(join_outputs("a", ""), "a");
        assert_eq!(join_outputs("a", "b"), "a\nb");
    }

    #[test]
    fn not_configured_patterns_cover_common_tools() {
        for output in [
            "npm ERR! Missing script: \"build\"",
            "sh: tsc: command not found",
            "Error: no test specified",
        ] {
            assert!(
                NOT_CONFIGURED_PATTERNS.iter().any(|p| output.contains(p)),
                "pattern set should match {output:?}"
            );
        }
    }
}
