//! # Reasoning Backend Client
//!
//! Talks to an OpenAI-compatible `/v1/chat/completions` endpoint to get
//! feedback on the user's code. The orchestrator treats every failure mode
//! here uniformly — timeout, connection error, bad status, malformed JSON,
//! empty content — so all of them collapse into [`BackendError`] and the
//! caller recovers with the fallback analyzer.
//!
//! The [`ReasoningBackend`] trait is the seam for tests: the orchestrator
//! holds an `Arc<dyn ReasoningBackend>` and never knows whether it is
//! talking to HTTP or a double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;

use crate::config::AnalysisConfig;

/// Unified failure for any backend call.
#[derive(Debug)]
pub enum BackendError {
    /// Transport or connection failure
    Request(String),

    /// The call did not complete within the configured bound
    Timeout,

    /// Non-success HTTP status from the backend
    Status(u16),

    /// The response body could not be parsed
    Parse(String),

    /// The backend answered with no usable text
    Empty,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Request(msg) => write!(f, "backend request failed: {}", msg),
            BackendError::Timeout => write!(f, "backend request timed out"),
            BackendError::Status(code) => write!(f, "backend returned HTTP {}", code),
            BackendError::Parse(msg) => write!(f, "failed to parse backend response: {}", msg),
            BackendError::Empty => write!(f, "backend returned an empty response"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Request(err.to_string())
        }
    }
}

/// One prior exchange in the session's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exchange {
    /// "user" or "assistant"
    pub role: String,
    pub text: String,
}

/// Everything the backend needs to produce feedback for one trigger.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub code: String,
    pub language: String,
    pub question: String,
    pub conversation: Vec<Exchange>,
    /// Finalized transcript of what the user just said, if this trigger
    /// came from speech rather than an edit
    pub current_message: Option<String>,
    pub is_chat: bool,
}

/// External reasoning collaborator.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Request feedback text for the given context.
    async fn request_feedback(&self, ctx: &AnalysisContext) -> Result<String, BackendError>;
}

/// HTTP implementation over an OpenAI-compatible chat-completions API
/// (Ollama in OpenAI mode, OpenAI, Groq, vLLM, ...).
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let timeout = Duration::from_secs(config.backend_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            model: config.backend_model.clone(),
            timeout,
        }
    }

    /// Assemble the chat messages for one analysis call. The system prompt
    /// is deliberately plain; prompt engineering is not this crate's job.
    fn build_messages(ctx: &AnalysisContext) -> Vec<serde_json::Value> {
        let mut messages = vec![json!({
            "role": "system",
            "content": "You are a friendly coding interview coach. Give short, spoken-style feedback on the candidate's code and approach. Two or three sentences at most.",
        })];

        for exchange in &ctx.conversation {
            messages.push(json!({ "role": exchange.role, "content": exchange.text }));
        }

        let mut prompt = format!(
            "Question: {}\nLanguage: {}\nCurrent code:\n{}",
            ctx.question, ctx.language, ctx.code
        );
        if let Some(message) = &ctx.current_message {
            prompt.push_str("\nThe candidate just said: ");
            prompt.push_str(message);
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        messages
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl ReasoningBackend for HttpBackend {
    async fn request_feedback(&self, ctx: &AnalysisContext) -> Result<String, BackendError> {
        let body = json!({
            "model": self.model,
            "messages": Self::build_messages(ctx),
            "stream": false,
        });

        let url = format!("{}/v1/chat/completions", self.base_url);

        // reqwest enforces its own per-request timeout; this outer bound
        // guards the whole call including response body reads.
        let request = async {
            let response = self.client.post(&url).json(&body).send().await?;

            if !response.status().is_success() {
                return Err(BackendError::Status(response.status().as_u16()));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| BackendError::Parse(e.to_string()))?;

            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();

            let content = content.trim().to_string();
            if content.is_empty() {
                return Err(BackendError::Empty);
            }
            Ok(content)
        };

        match tokio::time::timeout(self.timeout + Duration::from_secs(1), request).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        }
    }
}
