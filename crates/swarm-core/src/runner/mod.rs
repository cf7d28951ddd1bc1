//! Sandbox runner interface for ephemeral cloud workers.
//!
//! The core sees a worker as a function: given a task payload, it returns
//! a handoff record or fails. Concretely the runner is an external
//! executable that receives the JSON payload on stdin and prints
//! newline-delimited progress to stdout; the **last** stdout line must be
//! the handoff JSON (§ wire contract in [`crate::task::Handoff`]).
//!
//! ```text
//! WorkerDispatcher
//!     |
//!     v
//! &dyn SandboxRunner
//!     |   spawn(payload) ---> RunnerHandle { pid, ... }
//!     |   lines(handle) ---> Stream<String>   (raw stdout lines)
//!     |   kill(handle)
//! ```

pub mod subprocess;
pub mod types;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

pub use subprocess::SubprocessRunner;
pub use types::{
    LlmEndpointConfig, RunnerHandle, RunnerLine, TraceContext, WorkerPayload, classify_line,
};

/// Adapter interface for executing one task in an isolated sandbox.
///
/// Object-safe so the dispatcher can hold `Arc<dyn SandboxRunner>` and
/// tests can substitute scripted fakes.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &str;

    /// Launch the sandbox process for the given payload.
    async fn spawn(&self, payload: &WorkerPayload) -> Result<RunnerHandle>;

    /// Stream raw stdout lines until the process closes its stdout. The
    /// stream must be line-buffered; callers retain only the last
    /// complete line as the handoff candidate.
    fn lines(&self, handle: &RunnerHandle) -> Pin<Box<dyn Stream<Item = String> + Send>>;

    /// Terminate the sandbox (process group where supported).
    async fn kill(&self, handle: &RunnerHandle) -> Result<()>;
}

// If this compiles, the trait can be used as `dyn SandboxRunner`.
const _: () = {
    fn _assert_object_safe(_: &dyn SandboxRunner) {}
};
