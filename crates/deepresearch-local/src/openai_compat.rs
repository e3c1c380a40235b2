use crate::{ChatBackend, ChatRequest, Error, Message, ModelEndpoint, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default request timeout when a [`ChatRequest`] does not carry one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
/// Error bodies are clipped before they land in logs and errors.
const MAX_ERROR_BODY_CHARS: usize = 2_000;

/// OpenAI chat-completions transport. One HTTP round-trip per call; retries live in
/// [`crate::completion::CompletionClient`].
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn with_default_client() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::LlmTransport(e.to_string()))?;
        Ok(Self::new(client))
    }
}

/// `{base}/v1/chat/completions`, tolerating a base that already ends in `/v1`.
pub fn endpoint_chat_completions(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait::async_trait]
impl ChatBackend for OpenAiCompatClient {
    async fn chat(&self, endpoint: &ModelEndpoint, req: &ChatRequest) -> Result<String> {
        let body = ChatCompletionsRequest {
            model: &endpoint.model,
            messages: &req.messages,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stop: (!req.stop.is_empty()).then_some(req.stop.as_slice()),
            stream: false,
        };

        let mut rb = self
            .client
            .post(endpoint_chat_completions(&endpoint.base_url))
            .timeout(req.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &endpoint.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::LlmTransport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(Error::LlmStatus {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .await
            .map_err(|e| Error::LlmTransport(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Llm("response carried no choices".to_string()))?;
        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
