//! Language-model client seam.
//!
//! The core consumes a single contract: `complete(messages) -> (text,
//! tokens)`. The HTTP implementation speaks the OpenAI-style
//! chat-completions shape against a configured `/v1` endpoint. Weighted
//! multi-endpoint routing and health probing live outside this crate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmOptions;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// One turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_owned(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_owned(),
            content: content.into(),
        }
    }
}

/// A model completion with its token accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
}

/// The language-model contract the core consumes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion>;
}

// If this compiles, the trait can be used as `dyn LlmClient`.
const _: () = {
    fn _assert_object_safe(_: &dyn LlmClient) {}
};

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

/// OpenAI-compatible chat-completions client over a single endpoint.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    api_key: String,
}

impl HttpLlmClient {
    /// Build a client from validated [`LlmOptions`] (first endpoint).
    pub fn from_options(options: &LlmOptions) -> Result<Self> {
        let endpoint = options
            .endpoints
            .first()
            .context("llm.endpoints is empty")?
            .clone();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(options.timeout_ms))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            api_key: options.api_key.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut request = self.http.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("LLM request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("LLM endpoint returned {status}: {text}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("failed to parse LLM response body")?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .context("LLM response contained no choices")?;
        let tokens_used = parsed.usage.unwrap_or_default().total_tokens;

        debug!(tokens_used, "LLM completion received");
        Ok(Completion {
            text: choice.message.content,
            tokens_used,
        })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Stateful conversation handle owned by the planner.
///
/// The session accumulates turns; `prompt` appends the user turn, runs one
/// completion, and records the assistant turn. `close` disposes the
/// history; further prompts are errors.
pub struct LlmSession {
    client: Arc<dyn LlmClient>,
    messages: Vec<ChatMessage>,
    tokens_used: u64,
    closed: bool,
}

impl LlmSession {
    pub fn new(client: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            messages: vec![ChatMessage::system(system_prompt)],
            tokens_used: 0,
            closed: false,
        }
    }

    /// Append a user turn and complete.
    pub async fn prompt(&mut self, text: impl Into<String>) -> Result<Completion> {
        if self.closed {
            bail!("LLM session is closed");
        }
        self.messages.push(ChatMessage::user(text));
        let completion = self.client.complete(&self.messages).await?;
        self.messages.push(ChatMessage::assistant(&completion.text));
        self.tokens_used += completion.tokens_used;
        Ok(completion)
    }

    /// Dispose the session. Idempotent.
    pub fn close(&mut self) {
        self.messages.clear();
        self.closed = true;
    }

    pub fn turns(&self) -> usize {
        self.messages.len()
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
