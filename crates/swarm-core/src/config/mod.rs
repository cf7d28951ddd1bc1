//! Run configuration: every recognized option with its documented default.
//!
//! Resolution chain: explicit struct > `SWARM_*` env vars (secrets only) >
//! TOML config file > defaults. Validation fails fast on unusable values.
//!
//! Three limits interact without a central coherence check:
//! `max_conflict_retries` is per branch (merge queue),
//! `max_conflict_fix_tasks` is global per run (orchestrator), and
//! `reconciler.max_fix_tasks` is per sweep. Tightening one does not
//! tighten the others.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::git::MergeStrategy;

/// Top-level configuration for an orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Dispatch semaphore capacity.
    pub max_workers: usize,
    /// Per-task wall-clock limit, seconds.
    pub worker_timeout_secs: u64,
    /// Strategy for integrating worker branches into the mainline.
    pub merge_strategy: MergeStrategy,
    /// Conflict retries per branch before the conflict callback fires.
    pub max_conflict_retries: u32,
    /// Global budget of conflict-fix tasks per run.
    pub max_conflict_fix_tasks: u64,
    /// Retry budget per task for failed/blocked handoffs.
    pub max_task_retries: u32,
    /// Working copy of the target repository.
    pub target_repo_path: PathBuf,
    /// Monitor poll period, seconds.
    pub health_check_interval_secs: u64,
    /// Merge queue background tick cadence, milliseconds.
    pub merge_tick_ms: u64,
    /// Structured JSONL event log location.
    pub event_log_path: PathBuf,
    /// System prompt handed to every sandbox worker. When unset, a
    /// minimal built-in prompt is used.
    pub worker_system_prompt: Option<String>,
    pub llm: LlmOptions,
    pub git: GitOptions,
    pub runner: RunnerOptions,
    pub finalization: FinalizationOptions,
    pub reconciler: ReconcilerOptions,
    pub planner: PlannerOptions,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            worker_timeout_secs: 1800,
            merge_strategy: MergeStrategy::Rebase,
            max_conflict_retries: 2,
            max_conflict_fix_tasks: 30,
            max_task_retries: 2,
            target_repo_path: PathBuf::from("."),
            health_check_interval_secs: 30,
            merge_tick_ms: 2_000,
            event_log_path: PathBuf::from("swarm-events.jsonl"),
            worker_system_prompt: None,
            llm: LlmOptions::default(),
            git: GitOptions::default(),
            runner: RunnerOptions::default(),
            finalization: FinalizationOptions::default(),
            reconciler: ReconcilerOptions::default(),
            planner: PlannerOptions::default(),
        }
    }
}

/// Language-model client parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmOptions {
    /// Chat-completions base endpoints. Normalized to terminate in `/v1`.
    pub endpoints: Vec<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Request timeout, milliseconds.
    pub timeout_ms: u64,
    /// API key; overridable via `SWARM_LLM_API_KEY`.
    pub api_key: String,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            model: "default".to_owned(),
            max_tokens: 8192,
            temperature: 0.2,
            timeout_ms: 300_000,
            api_key: String::new(),
        }
    }
}

/// Target repository addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitOptions {
    pub repo_url: String,
    pub main_branch: String,
    pub branch_prefix: String,
    /// Credential; overridable via `SWARM_GIT_TOKEN`.
    pub token: String,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            main_branch: "main".to_owned(),
            branch_prefix: "worker/".to_owned(),
            token: String::new(),
        }
    }
}

/// Sandbox runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Executable that runs one task in an ephemeral sandbox.
    pub executable: PathBuf,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("swarm-runner"),
        }
    }
}

/// Finalization phase behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizationOptions {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Timeout for the synchronous sweep inside each attempt, ms.
    pub sweep_timeout_ms: u64,
    /// Wait ceiling for injected fix tasks per attempt, ms.
    pub attempt_timeout_ms: u64,
}

impl Default for FinalizationOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            sweep_timeout_ms: 300_000,
            attempt_timeout_ms: 900_000,
        }
    }
}

/// Reconciler sweep cadence and output cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerOptions {
    /// Sweep interval ceiling, ms. The adaptive interval never exceeds it.
    pub interval_ms: u64,
    /// Max fix tasks emitted per sweep.
    pub max_fix_tasks: usize,
    /// Typed build check (e.g. a compiler with no emit). Empty = skipped.
    pub check_command: Option<String>,
    /// Project build command. Empty = skipped.
    pub build_command: Option<String>,
    /// Project test command. Empty = skipped.
    pub test_command: Option<String>,
    /// Timeout for the sweep's LLM call, ms.
    pub llm_timeout_ms: u64,
    /// Timeout per swept command, seconds.
    pub command_timeout_secs: u64,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            interval_ms: 120_000,
            max_fix_tasks: 5,
            check_command: None,
            build_command: None,
            test_command: None,
            llm_timeout_ms: 120_000,
            command_timeout_secs: 600,
        }
    }
}

/// Planner loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerOptions {
    /// Handoffs that must accumulate before a mid-run replan.
    pub min_handoffs_for_replan: usize,
    /// Hard bound on planner loop iterations.
    pub max_iterations: u64,
    /// Consecutive planning failures tolerated before aborting.
    pub max_consecutive_errors: u32,
    /// Scope size at which a task is routed through the subplanner.
    pub decompose_threshold: usize,
    /// Max children per decomposition.
    pub max_subtasks: usize,
    /// Max recursion depth for nested decomposition.
    pub max_depth: u32,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            min_handoffs_for_replan: 3,
            max_iterations: 500,
            max_consecutive_errors: 10,
            decompose_threshold: 8,
            max_subtasks: 5,
            max_depth: 3,
        }
    }
}

impl SwarmConfig {
    /// Load from a TOML file and apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let mut config: SwarmConfig =
            toml::from_str(&contents).context("failed to parse config file")?;
        config.apply_env();
        Ok(config)
    }

    /// Pull secrets from the environment. Env wins over file values.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("SWARM_GIT_TOKEN") {
            self.git.token = token;
        }
        if let Ok(key) = std::env::var("SWARM_LLM_API_KEY") {
            self.llm.api_key = key;
        }
    }

    /// Fail fast on unusable configuration; normalize LLM endpoints to
    /// terminate in `/v1`.
    pub fn validate(&mut self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must be at least 1");
        }
        if self.git.main_branch.trim().is_empty() {
            bail!("git.main_branch must not be empty");
        }
        if self.llm.endpoints.is_empty() {
            bail!("llm.endpoints must list at least one endpoint");
        }
        for endpoint in &mut self.llm.endpoints {
            *endpoint = normalize_endpoint(endpoint);
        }
        if self.finalization.max_attempts == 0 {
            bail!("finalization.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn worker_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.worker_timeout_secs)
    }
}

/// Trim trailing slashes and ensure the endpoint terminates in `/v1`.
fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/v1")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = SwarmConfig::default();
        assert_eq!(config.max_workers, 50);
        assert_eq!(config.worker_timeout_secs, 1800);
        assert_eq!(config.merge_strategy, MergeStrategy::Rebase);
        assert_eq!(config.max_conflict_retries, 2);
        assert_eq!(config.max_conflict_fix_tasks, 30);
        assert_eq!(config.git.main_branch, "main");
        assert_eq!(config.git.branch_prefix, "worker/");
        assert_eq!(config.finalization.max_attempts, 3);
        assert!(config.finalization.enabled);
        assert_eq!(config.reconciler.max_fix_tasks, 5);
        assert_eq!(config.planner.max_consecutive_errors, 10);
        assert_eq!(config.planner.max_depth, 3);
    }

    #[test]
    fn parse_partial_toml() {
        let toml = r#"
max_workers = 8

[llm]
endpoints = ["https://api.example.com"]
model = "big-coder"

[git]
repo_url = "https://github.com/acme/app.git"

[reconciler]
interval_ms = 60000
max_fix_tasks = 3
test_command = "npm test"
"#;
        let config: SwarmConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.llm.model, "big-coder");
        assert_eq!(config.reconciler.max_fix_tasks, 3);
        assert_eq!(config.reconciler.test_command.as_deref(), Some("npm test"));
        // Untouched sections keep their defaults.
        assert_eq!(config.worker_timeout_secs, 1800);
    }

    #[test]
    fn validate_normalizes_endpoints() {
        let mut config = SwarmConfig {
            llm: LlmOptions {
                endpoints: vec![
                    "https://a.example.com/".to_owned(),
                    "https://b.example.com/v1".to_owned(),
                ],
                ..LlmOptions::default()
            },
            ..SwarmConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.llm.endpoints[0], "https://a.example.com/v1");
        assert_eq!(config.llm.endpoints[1], "https://b.example.com/v1");
    }

    #[test]
    fn validate_rejects_empty_endpoints() {
        let mut config = SwarmConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = SwarmConfig {
            max_workers: 0,
            ..SwarmConfig::default()
        };
        config.llm.endpoints.push("https://a/v1".to_owned());
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_secrets() {
        // Env var access is process-global; keep this test self-contained.
        unsafe {
            std::env::set_var("SWARM_GIT_TOKEN", "env-token");
        }
        let mut config = SwarmConfig::default();
        config.git.token = "file-token".to_owned();
        config.apply_env();
        assert_eq!(config.git.token, "env-token");
        unsafe {
            std::env::remove_var("SWARM_GIT_TOKEN");
        }
    }
}
