//! Shared test fixtures: throwaway git repositories, a scripted LLM
//! client, and a mock sandbox runner that does real git work.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::Stream;

use swarm_core::llm::{ChatMessage, Completion, LlmClient};
use swarm_core::runner::{RunnerHandle, SandboxRunner, WorkerPayload};

// ---------------------------------------------------------------------------
// Git fixture
// ---------------------------------------------------------------------------

/// A bare origin plus the orchestrator's working clone.
pub struct GitFixture {
    pub origin_dir: tempfile::TempDir,
    pub work_dir: tempfile::TempDir,
}

impl GitFixture {
    pub fn new() -> Self {
        let origin_dir = tempfile::tempdir().expect("origin tempdir");
        let work_dir = tempfile::tempdir().expect("work tempdir");

        git_ok(origin_dir.path(), &["init", "--bare", "-b", "main"]);

        // Seed the origin through a scratch clone.
        let seed = tempfile::tempdir().expect("seed tempdir");
        git_ok(
            seed.path(),
            &["clone", origin_dir.path().to_str().unwrap(), "checkout"],
        );
        let seed_checkout = seed.path().join("checkout");
        configure_user(&seed_checkout);
        std::fs::write(seed_checkout.join("README.md"), "seed\n").unwrap();
        git_ok(&seed_checkout, &["add", "-A"]);
        git_ok(&seed_checkout, &["commit", "-m", "init"]);
        git_ok(&seed_checkout, &["push", "origin", "main"]);

        // The orchestrator's working copy.
        let fixture = Self {
            origin_dir,
            work_dir,
        };
        git_ok(
            fixture.work_dir.path(),
            &[
                "clone",
                fixture.origin_url().as_str(),
                fixture.work_path().to_str().unwrap(),
            ],
        );
        configure_user(&fixture.work_path());
        fixture
    }

    pub fn origin_url(&self) -> String {
        self.origin_dir.path().to_str().unwrap().to_owned()
    }

    /// Path of the orchestrator's working clone.
    pub fn work_path(&self) -> PathBuf {
        self.work_dir.path().join("repo")
    }

    /// Create `branch` off current origin main in a scratch clone, write
    /// `file` with `content`, commit, and push the branch to origin.
    pub fn commit_on_branch(&self, branch: &str, file: &str, content: &str) {
        let scratch = tempfile::tempdir().expect("scratch tempdir");
        let checkout = scratch.path().join("checkout");
        git_ok(
            scratch.path(),
            &["clone", self.origin_url().as_str(), checkout.to_str().unwrap()],
        );
        configure_user(&checkout);
        git_ok(&checkout, &["checkout", "-b", branch]);
        if let Some(parent) = Path::new(file).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(checkout.join(parent)).unwrap();
            }
        }
        std::fs::write(checkout.join(file), content).unwrap();
        git_ok(&checkout, &["add", "-A"]);
        git_ok(&checkout, &["commit", "-m", &format!("work on {branch}")]);
        git_ok(&checkout, &["push", "origin", branch]);
    }

    /// Commit directly onto origin main (used to manufacture conflicts).
    pub fn commit_on_main(&self, file: &str, content: &str) {
        let scratch = tempfile::tempdir().expect("scratch tempdir");
        let checkout = scratch.path().join("checkout");
        git_ok(
            scratch.path(),
            &["clone", self.origin_url().as_str(), checkout.to_str().unwrap()],
        );
        configure_user(&checkout);
        std::fs::write(checkout.join(file), content).unwrap();
        git_ok(&checkout, &["add", "-A"]);
        git_ok(&checkout, &["commit", "-m", &format!("mainline change to {file}")]);
        git_ok(&checkout, &["push", "origin", "main"]);
        // Keep the orchestrator's working copy in sync.
        git_ok(&self.work_path(), &["pull", "--ff-only", "origin", "main"]);
    }

    /// Read a file from the working clone's mainline checkout.
    pub fn read_work_file(&self, file: &str) -> Option<String> {
        std::fs::read_to_string(self.work_path().join(file)).ok()
    }
}

pub fn git_ok(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn configure_user(dir: &Path) {
    git_ok(dir, &["config", "user.email", "swarm@localhost"]);
    git_ok(dir, &["config", "user.name", "swarm"]);
}

// ---------------------------------------------------------------------------
// Scripted LLM client
// ---------------------------------------------------------------------------

/// Returns canned completions in order; errors once the script runs dry
/// unless a repeat-last fallback is enabled.
pub struct ScriptedLlm {
    responses: Mutex<Vec<String>>,
    repeat_last: bool,
    last: Mutex<Option<String>>,
    pub calls: AtomicU32,
}

impl ScriptedLlm {
    pub fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().rev().map(|s| (*s).to_owned()).collect()),
            repeat_last: false,
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    /// Keep returning the final scripted response once the list is empty.
    pub fn repeating(responses: &[&str]) -> Self {
        let mut scripted = Self::new(responses);
        scripted.repeat_last = true;
        scripted
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop();
        let text = match next {
            Some(text) => {
                *self.last.lock().unwrap() = Some(text.clone());
                text
            }
            None if self.repeat_last => self
                .last
                .lock()
                .unwrap()
                .clone()
                .context("scripted LLM has no responses at all")?,
            None => bail!("scripted LLM ran out of responses"),
        };
        Ok(Completion {
            text,
            tokens_used: 25,
        })
    }
}

/// Routes responses by substring match on the latest user message;
/// avoids ordering races when one client serves several call sites.
pub struct RoutedLlm {
    routes: Vec<(String, String)>,
    fallback: String,
}

impl RoutedLlm {
    pub fn new(routes: &[(&str, &str)], fallback: &str) -> Self {
        Self {
            routes: routes
                .iter()
                .map(|(needle, response)| ((*needle).to_owned(), (*response).to_owned()))
                .collect(),
            fallback: fallback.to_owned(),
        }
    }
}

#[async_trait]
impl LlmClient for RoutedLlm {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let text = self
            .routes
            .iter()
            .find(|(needle, _)| last_user.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.fallback.clone());
        Ok(Completion {
            text,
            tokens_used: 25,
        })
    }
}

/// An LLM client that always fails, for backoff/abort tests.
pub struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<Completion> {
        bail!("endpoint unavailable")
    }
}

// ---------------------------------------------------------------------------
// Mock sandbox runner
// ---------------------------------------------------------------------------

/// Per-task behavior of the mock runner.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Do real git work: branch off origin main, write the file, push,
    /// then hand off complete.
    CompleteWithFile {
        file: String,
        content: String,
        tokens: u64,
    },
    /// Like `CompleteWithFile`, but the handoff only appears after a
    /// delay. Useful to keep the planner loop alive while background
    /// merges settle.
    CompleteWithFileAfter {
        file: String,
        content: String,
        tokens: u64,
        delay_ms: u64,
    },
    /// Recreate the task's branch from the latest origin main with the
    /// given file content and force-push it. This is how a conflict-fix
    /// worker resolves a branch that cannot merge.
    ForceBranchFromMain { file: String, content: String },
    /// Hand off complete without touching the repository (empty diff).
    CompleteEmpty { tokens: u64, tool_calls: u64 },
    /// Hand off failed.
    FailTask,
    /// Never produce output; the dispatcher timeout must fire.
    Hang,
}

/// A sandbox runner that performs scripted behaviors against the shared
/// origin, like a real worker would.
pub struct MockRunner {
    origin_url: String,
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    default: MockBehavior,
    lines_by_pid: Mutex<HashMap<u32, Vec<String>>>,
    delay_by_pid: Mutex<HashMap<u32, u64>>,
    hang_pids: Mutex<Vec<u32>>,
    next_pid: AtomicU32,
}

impl MockRunner {
    pub fn new(origin_url: String, default: MockBehavior) -> Self {
        Self {
            origin_url,
            behaviors: Mutex::new(HashMap::new()),
            default,
            lines_by_pid: Mutex::new(HashMap::new()),
            delay_by_pid: Mutex::new(HashMap::new()),
            hang_pids: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(1),
        }
    }

    pub fn set_behavior(&self, task_id: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(task_id.to_owned(), behavior);
    }

    fn behavior_for(&self, task_id: &str) -> MockBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    fn handoff_line(
        task_id: &str,
        status: &str,
        files: &[String],
        tokens: u64,
        tool_calls: u64,
    ) -> String {
        let files_json: Vec<String> = files.iter().map(|f| format!("{f:?}")).collect();
        format!(
            "{{\"taskId\":{task_id:?},\"status\":{status:?},\"summary\":\"mock work\",\
             \"diff\":\"\",\"filesChanged\":[{}],\"concerns\":[],\"suggestions\":[],\
             \"metrics\":{{\"linesAdded\":1,\"linesRemoved\":0,\"filesCreated\":1,\
             \"filesModified\":0,\"tokensUsed\":{tokens},\"toolCallCount\":{tool_calls},\
             \"durationMs\":10}}}}",
            files_json.join(",")
        )
    }
}

#[async_trait]
impl SandboxRunner for MockRunner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spawn(&self, payload: &WorkerPayload) -> Result<RunnerHandle> {
        let task = &payload.task;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior_for(&task.id);

        let lines = match behavior {
            MockBehavior::CompleteWithFile {
                file,
                content,
                tokens,
            } => {
                let origin = self.origin_url.clone();
                let branch = task.branch.clone();
                let file_clone = file.clone();
                // Real git work happens off the async thread.
                tokio::task::spawn_blocking(move || {
                    do_branch_work(&origin, &branch, &file_clone, &content)
                })
                .await??;
                vec![
                    "[spawn] sandbox ready".to_owned(),
                    format!("[worker:{}] Tool calls: 3", task.id),
                    Self::handoff_line(&task.id, "complete", &[file], tokens, 3),
                ]
            }
            MockBehavior::CompleteWithFileAfter {
                file,
                content,
                tokens,
                delay_ms,
            } => {
                let origin = self.origin_url.clone();
                let branch = task.branch.clone();
                let file_clone = file.clone();
                tokio::task::spawn_blocking(move || {
                    do_branch_work(&origin, &branch, &file_clone, &content)
                })
                .await??;
                self.delay_by_pid.lock().unwrap().insert(pid, delay_ms);
                vec![Self::handoff_line(&task.id, "complete", &[file], tokens, 2)]
            }
            MockBehavior::ForceBranchFromMain { file, content } => {
                let origin = self.origin_url.clone();
                let branch = task.branch.clone();
                let file_clone = file.clone();
                tokio::task::spawn_blocking(move || {
                    do_force_branch_work(&origin, &branch, &file_clone, &content)
                })
                .await??;
                vec![Self::handoff_line(&task.id, "complete", &[file], 50, 4)]
            }
            MockBehavior::CompleteEmpty { tokens, tool_calls } => vec![Self::handoff_line(
                &task.id,
                "complete",
                &[],
                tokens,
                tool_calls,
            )],
            MockBehavior::FailTask => vec![Self::handoff_line(&task.id, "failed", &[], 5, 1)],
            MockBehavior::Hang => {
                self.hang_pids.lock().unwrap().push(pid);
                Vec::new()
            }
        };

        self.lines_by_pid.lock().unwrap().insert(pid, lines);
        Ok(RunnerHandle {
            pid,
            task_id: task.id.clone(),
            runner_name: "mock".to_owned(),
        })
    }

    fn lines(&self, handle: &RunnerHandle) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        if self.hang_pids.lock().unwrap().contains(&handle.pid) {
            return Box::pin(futures::stream::pending());
        }
        let lines = self
            .lines_by_pid
            .lock()
            .unwrap()
            .remove(&handle.pid)
            .unwrap_or_default();
        let delay_ms = self.delay_by_pid.lock().unwrap().remove(&handle.pid);
        match delay_ms {
            Some(delay_ms) => Box::pin(async_stream::stream! {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                for line in lines {
                    yield line;
                }
            }),
            None => Box::pin(futures::stream::iter(lines)),
        }
    }

    async fn kill(&self, _handle: &RunnerHandle) -> Result<()> {
        Ok(())
    }
}

/// Recreate `branch` from the latest origin main with the given content
/// and force-push it over the remote branch.
fn do_force_branch_work(origin: &str, branch: &str, file: &str, content: &str) -> Result<()> {
    let scratch = tempfile::tempdir().context("scratch tempdir")?;
    let checkout = scratch.path().join("checkout");
    git_ok(scratch.path(), &["clone", origin, checkout.to_str().unwrap()]);
    configure_user(&checkout);
    git_ok(&checkout, &["checkout", "-B", branch, "origin/main"]);
    if let Some(parent) = Path::new(file).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(checkout.join(parent))?;
        }
    }
    std::fs::write(checkout.join(file), content)?;
    git_ok(&checkout, &["add", "-A"]);
    git_ok(&checkout, &["commit", "-m", &format!("resolve conflicts on {branch}")]);
    git_ok(&checkout, &["push", "--force", "origin", branch]);
    Ok(())
}

/// Clone origin, branch, write the file, commit, push the branch.
fn do_branch_work(origin: &str, branch: &str, file: &str, content: &str) -> Result<()> {
    let scratch = tempfile::tempdir().context("scratch tempdir")?;
    let checkout = scratch.path().join("checkout");
    git_ok(scratch.path(), &["clone", origin, checkout.to_str().unwrap()]);
    configure_user(&checkout);
    git_ok(&checkout, &["checkout", "-b", branch]);
    if let Some(parent) = Path::new(file).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(checkout.join(parent))?;
        }
    }
    std::fs::write(checkout.join(file), content)?;
    git_ok(&checkout, &["add", "-A"]);
    git_ok(&checkout, &["commit", "-m", &format!("mock: {branch}")]);
    git_ok(&checkout, &["push", "origin", branch]);
    Ok(())
}
