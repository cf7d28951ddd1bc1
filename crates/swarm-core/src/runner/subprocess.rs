//! Subprocess adapter for the sandbox runner contract.
//!
//! Spawns the configured runner executable in its own process group,
//! writes the JSON payload to stdin, and streams stdout line by line.
//! stderr is drained concurrently (bounded) and scanned for error markers
//! for diagnostic logging only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use super::types::{RunnerHandle, STDERR_ERROR_MARKERS, WorkerPayload};
use super::SandboxRunner;

/// Cap on retained stderr lines per process.
const STDERR_LINE_CAP: usize = 200;

/// Internal state kept per spawned process.
struct ProcessState {
    child: Child,
    /// Stdout reader; `Option` so it can be `.take()`-ed once for streaming.
    stdout: Option<ChildStdout>,
}

/// Runner adapter that executes an external sandbox binary.
#[derive(Clone)]
pub struct SubprocessRunner {
    executable: PathBuf,
    /// Per-process bookkeeping, keyed by OS pid.
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for SubprocessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessRunner")
            .field("executable", &self.executable)
            .finish()
    }
}

impl SubprocessRunner {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl SandboxRunner for SubprocessRunner {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn spawn(&self, payload: &WorkerPayload) -> Result<RunnerHandle> {
        let payload_json =
            serde_json::to_string(payload).context("failed to serialize worker payload")?;

        let mut cmd = Command::new(&self.executable);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        // Own process group so a timeout kill reaches any grandchildren.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn sandbox runner at '{}' -- is it installed and executable?",
                self.executable.display()
            )
        })?;

        let pid = child.id().context("child process has no pid")?;

        // Deliver the payload and close stdin so the runner starts.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(payload_json.as_bytes()).await {
                warn!(pid, error = %e, "failed to write payload to runner stdin");
            }
            drop(stdin);
        }

        let stdout = child.stdout.take();

        // Drain stderr in the background so the child never blocks on a
        // full pipe; keep a bounded tail and log error markers.
        if let Some(stderr) = child.stderr.take() {
            let task_id = payload.task.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut retained: Vec<String> = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    if STDERR_ERROR_MARKERS.iter().any(|m| line.contains(m)) {
                        warn!(task_id = %task_id, line = %line, "runner stderr error marker");
                    }
                    if retained.len() < STDERR_LINE_CAP {
                        retained.push(line);
                    }
                }
                debug!(task_id = %task_id, lines = retained.len(), "runner stderr closed");
            });
        }

        {
            let mut processes = self.processes.lock().await;
            processes.insert(pid, ProcessState { child, stdout });
        }

        Ok(RunnerHandle {
            pid,
            task_id: payload.task.id.clone(),
            runner_name: self.name().to_owned(),
        })
    }

    fn lines(&self, handle: &RunnerHandle) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);

        let stream = async_stream::stream! {
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "no stdout available for pid -- already consumed or process missing");
                return;
            };

            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(next) = lines.next().await {
                match next {
                    Ok(line) => yield line,
                    Err(e) => {
                        warn!(pid, error = %e, "error reading runner stdout");
                        break;
                    }
                }
            }
        };

        Box::pin(stream)
    }

    async fn kill(&self, handle: &RunnerHandle) -> Result<()> {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            // SIGTERM the whole process group first, then escalate.
            #[cfg(unix)]
            {
                // SAFETY: pid came from a child we spawned with its own
                // process group (pgid == pid).
                let ret = unsafe { libc::killpg(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM to process group failed, proceeding to SIGKILL");
                }
            }

            let exited = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                state.child.wait(),
            )
            .await;

            match exited {
                Ok(Ok(_status)) => {
                    debug!(pid, "runner exited after SIGTERM");
                }
                _ => {
                    debug!(pid, "runner did not exit after SIGTERM, sending SIGKILL");
                    #[cfg(unix)]
                    {
                        // SAFETY: same pgid as above.
                        unsafe { libc::killpg(pid as i32, libc::SIGKILL) };
                    }
                    let _ = state.child.kill().await;
                }
            }

            processes.remove(&pid);
        } else {
            debug!(pid, "kill called but process not in map (already exited?)");
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::runner::types::LlmEndpointConfig;
    use crate::task::Task;

    fn test_payload() -> WorkerPayload {
        WorkerPayload {
            task: Task::new("t-1", "test task", "worker/"),
            system_prompt: "prompt".to_owned(),
            repo_url: "https://example.com/repo.git".to_owned(),
            git_token: String::new(),
            llm_config: LlmEndpointConfig {
                endpoint: "https://api.example.com/v1".to_owned(),
                model: "m".to_owned(),
                max_tokens: 1024,
                temperature: 0.0,
                api_key: String::new(),
            },
            trace: None,
        }
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn streams_stdout_lines_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_runner.sh",
            "#!/bin/sh\n\
             echo '[spawn] booting'\n\
             echo '[worker:t-1] Tool calls: 2'\n\
             echo '{\"taskId\":\"t-1\"}'\n",
        );

        let runner = SubprocessRunner::new(&script);
        let handle = runner.spawn(&test_payload()).await.unwrap();
        assert!(handle.pid > 0);

        let lines: Vec<String> = runner.lines(&handle).collect().await;
        assert_eq!(
            lines,
            vec![
                "[spawn] booting",
                "[worker:t-1] Tool calls: 2",
                "{\"taskId\":\"t-1\"}",
            ]
        );
    }

    #[tokio::test]
    async fn payload_arrives_on_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        // Echo the payload back; the dispatcher-facing contract is that
        // stdin carries the full JSON document.
        let script = write_script(tmp.path(), "stdin_runner.sh", "#!/bin/sh\ncat\n");

        let runner = SubprocessRunner::new(&script);
        let handle = runner.spawn(&test_payload()).await.unwrap();
        let lines: Vec<String> = runner.lines(&handle).collect().await;

        assert_eq!(lines.len(), 1);
        let parsed: WorkerPayload = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed.task.id, "t-1");
        assert_eq!(parsed.system_prompt, "prompt");
    }

    #[tokio::test]
    async fn spawn_missing_binary_is_error() {
        let runner = SubprocessRunner::new("/nonexistent/swarm-runner");
        let result = runner.spawn(&test_payload()).await;
        assert!(result.is_err());
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("failed to spawn sandbox runner"));
    }

    #[tokio::test]
    async fn kill_terminates_a_sleeping_runner() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy_runner.sh", "#!/bin/sh\nsleep 3600\n");

        let runner = SubprocessRunner::new(&script);
        let handle = runner.spawn(&test_payload()).await.unwrap();
        runner.kill(&handle).await.unwrap();

        // Killing again is a no-op.
        runner.kill(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn lines_called_twice_yields_empty_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "once_runner.sh", "#!/bin/sh\necho done\n");

        let runner = SubprocessRunner::new(&script);
        let handle = runner.spawn(&test_payload()).await.unwrap();

        let first: Vec<String> = runner.lines(&handle).collect().await;
        assert_eq!(first, vec!["done"]);

        let second: Vec<String> = runner.lines(&handle).collect().await;
        assert!(second.is_empty());
    }
}
