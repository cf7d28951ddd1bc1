//! Wire types for the sandbox runner contract.

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// LLM endpoint parameters handed to the sandbox. The endpoint is already
/// normalized to terminate in `/v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmEndpointConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub api_key: String,
}

/// Distributed tracing context propagated into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_span_id: String,
}

/// The JSON payload delivered to the runner executable on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub task: Task,
    pub system_prompt: String,
    pub repo_url: String,
    pub git_token: String,
    pub llm_config: LlmEndpointConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

/// Handle on a spawned sandbox process.
#[derive(Debug)]
pub struct RunnerHandle {
    /// OS pid; with process groups enabled this is also the pgid.
    pub pid: u32,
    pub task_id: String,
    pub runner_name: String,
}

/// Classification of one interim stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerLine {
    /// `[spawn] <text>`: sandbox lifecycle progress.
    Lifecycle(String),
    /// `[worker:<id>] <text>`: in-sandbox agent progress; carries the
    /// active tool-call count when the text matches `Tool calls: <n>`.
    Progress {
        worker_id: String,
        text: String,
        tool_calls: Option<u64>,
    },
    /// Anything else.
    Raw(String),
}

/// Classify an interim stdout line per the runner conventions.
pub fn classify_line(line: &str) -> RunnerLine {
    if let Some(text) = line.strip_prefix("[spawn] ") {
        return RunnerLine::Lifecycle(text.to_owned());
    }
    if let Some(rest) = line.strip_prefix("[worker:") {
        if let Some(close) = rest.find(']') {
            let worker_id = rest[..close].to_owned();
            let text = rest[close + 1..].trim_start().to_owned();
            let tool_calls = parse_tool_calls(&text);
            return RunnerLine::Progress {
                worker_id,
                text,
                tool_calls,
            };
        }
    }
    RunnerLine::Raw(line.to_owned())
}

/// Extract `n` from a `Tool calls: <n>` progress line.
fn parse_tool_calls(text: &str) -> Option<u64> {
    let rest = text.split("Tool calls:").nth(1)?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Markers scanned for in captured stderr, for diagnostic logging only.
pub const STDERR_ERROR_MARKERS: &[&str] = &["error", "Error", "ERROR", "panic", "fatal"];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn classify_lifecycle_line() {
        assert_eq!(
            classify_line("[spawn] container booted"),
            RunnerLine::Lifecycle("container booted".to_owned())
        );
    }

    #[test]
    fn classify_progress_line_with_tool_calls() {
        let line = classify_line("[worker:task-003] Tool calls: 17");
        assert_eq!(
            line,
            RunnerLine::Progress {
                worker_id: "task-003".to_owned(),
                text: "Tool calls: 17".to_owned(),
                tool_calls: Some(17),
            }
        );
    }

    #[test]
    fn classify_progress_line_without_tool_calls() {
        let line = classify_line("[worker:fix-001] editing src/app.ts");
        assert_eq!(
            line,
            RunnerLine::Progress {
                worker_id: "fix-001".to_owned(),
                text: "editing src/app.ts".to_owned(),
                tool_calls: None,
            }
        );
    }

    #[test]
    fn classify_raw_line() {
        assert_eq!(
            classify_line("npm WARN deprecated"),
            RunnerLine::Raw("npm WARN deprecated".to_owned())
        );
        // Malformed worker marker falls through to raw.
        assert_eq!(
            classify_line("[worker:unclosed"),
            RunnerLine::Raw("[worker:unclosed".to_owned())
        );
    }

    #[test]
    fn payload_wire_shape() {
        let payload = WorkerPayload {
            task: Task::new("t-1", "do a thing", "worker/"),
            system_prompt: "be careful".to_owned(),
            repo_url: "https://github.com/acme/app.git".to_owned(),
            git_token: String::new(),
            llm_config: LlmEndpointConfig {
                endpoint: "https://api.example.com/v1".to_owned(),
                model: "coder".to_owned(),
                max_tokens: 4096,
                temperature: 0.2,
                api_key: "k".to_owned(),
            },
            trace: Some(TraceContext {
                trace_id: "abc".to_owned(),
                parent_span_id: "def".to_owned(),
            }),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["systemPrompt"], "be careful");
        assert_eq!(json["llmConfig"]["maxTokens"], 4096);
        assert_eq!(json["trace"]["traceId"], "abc");
        assert_eq!(json["task"]["id"], "t-1");
    }

    #[test]
    fn payload_omits_absent_trace() {
        let payload = WorkerPayload {
            task: Task::new("t-1", "x", "worker/"),
            system_prompt: String::new(),
            repo_url: String::new(),
            git_token: String::new(),
            llm_config: LlmEndpointConfig {
                endpoint: String::new(),
                model: String::new(),
                max_tokens: 0,
                temperature: 0.0,
                api_key: String::new(),
            },
            trace: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("trace").is_none());
    }
}
