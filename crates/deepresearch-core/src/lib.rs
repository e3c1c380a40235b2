use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("search failed: {0}")]
    Search(String),
    /// Connection-level failure talking to a model endpoint (connect, timeout, body read).
    #[error("llm transport failed: {0}")]
    LlmTransport(String),
    /// The model endpoint answered with a non-success HTTP status.
    #[error("llm endpoint returned HTTP {status}: {message}")]
    LlmStatus { status: u16, message: String },
    #[error("llm failed: {0}")]
    Llm(String),
    /// All completion attempts (including history repair) were used up.
    #[error("completion failed after {attempts} attempts: {last}")]
    Completion { attempts: u32, last: String },
    #[error("tool failed: {0}")]
    Tool(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The endpoint refused the history because two assistant turns were adjacent.
    pub fn is_consecutive_assistant_rejection(&self) -> bool {
        match self {
            Error::LlmStatus { status, message } => {
                *status == 500 && message.to_ascii_lowercase().contains("assistant messages")
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered transcript of one research run.
///
/// Messages are only ever appended; the single in-place edit is
/// [`Conversation::replace_last_content`], used when the context budget is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt), Message::user(question)],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Message::assistant(content));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    pub fn replace_last_content(&mut self, content: impl Into<String>) {
        if let Some(m) = self.messages.last_mut() {
            m.content = content.into();
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

/// Classified meaning of one model response.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    ToolCall {
        name: String,
        arguments: serde_json::Value,
        /// Argument text as the model wrote it; used for repeat detection.
        raw_arguments: String,
        /// True when `raw_arguments` was not valid JSON and `arguments` fell back to `{}`.
        arguments_malformed: bool,
    },
    Answer {
        text: String,
    },
    Plain {
        text: String,
    },
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Answer,
    MaxRounds,
    TokenLimit,
    CallsExhausted,
    Timeout,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Answer => "answer",
            Termination::MaxRounds => "max_rounds",
            Termination::TokenLimit => "token_limit",
            Termination::CallsExhausted => "calls_exhausted",
            Termination::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One question to research.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTask {
    pub question: String,
    /// Reference answer carried through to the result for offline scoring.
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default = "default_rollout_id")]
    pub rollout_id: u64,
}

fn default_rollout_id() -> u64 {
    1
}

/// Terminal record of one rollout. This is the only artifact handed to consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub question: String,
    pub answer: String,
    pub messages: Vec<Message>,
    pub prediction: String,
    pub termination: Termination,
    pub rollout_id: u64,
    pub rounds: u32,
    pub llm_calls: u32,
    pub elapsed_ms: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Model endpoints
// ---------------------------------------------------------------------------

/// Where an OpenAI-compatible chat endpoint lives and which model to ask for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelEndpoint {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl ModelEndpoint {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Per-request timeout; transports fall back to their own default.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: Vec::new(),
            timeout: None,
        }
    }
}

/// A single round-trip to a chat-completion endpoint. No retries at this layer.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, endpoint: &ModelEndpoint, req: &ChatRequest) -> Result<String>;
}

/// Turns a conversation into the next model reply, retrying as it sees fit.
///
/// Implementations may append repair messages to `conversation`.
#[async_trait::async_trait]
pub trait Completer: Send + Sync {
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        conversation: &mut Conversation,
    ) -> Result<String>;
}

/// Context-size estimate for a conversation. Must grow monotonically with content.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, conversation: &Conversation) -> usize;
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// A tool the model can invoke.
#[async_trait::async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON-schema-like parameter description, shown to the model.
    fn parameters(&self) -> serde_json::Value;
    async fn call(&self, arguments: &serde_json::Value) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Fetch / search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Timeout for the operation (network + body read).
    pub timeout_ms: Option<u64>,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: Option<u64>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: None,
            max_bytes: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub elapsed_ms: u128,
}

impl FetchResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait::async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: Option<usize>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub provider: String,
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
}

/// Validate that `raw` is an absolute http(s) URL.
pub fn parse_http_url(raw: &str) -> Result<url::Url> {
    let u = url::Url::parse(raw.trim()).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    match u.scheme() {
        "http" | "https" => Ok(u),
        other => Err(Error::InvalidUrl(format!("unsupported scheme: {other}"))),
    }
}
