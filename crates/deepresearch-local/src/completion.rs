//! Retrying completion client on top of a [`ChatBackend`].

use crate::prompts::HISTORY_REPAIR_NOTICE;
use crate::{ChatBackend, ChatRequest, Completer, Conversation, Error, Message, ModelEndpoint, Result, Role};
use std::sync::Arc;
use std::time::Duration;

/// Fixed sampling parameters for planner calls.
#[derive(Debug, Clone)]
pub struct Sampling {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u64,
    /// Keeps the model from writing its own observation block.
    pub stop: Vec<String>,
    pub timeout: Duration,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_p: 0.95,
            max_tokens: 4_000,
            stop: vec!["\n<tool_response>".to_string(), "<tool_response>".to_string()],
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the zero-based `attempt` failed: `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub struct CompletionClient {
    backend: Arc<dyn ChatBackend>,
    sampling: Sampling,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            sampling: Sampling::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_request(&self, conversation: &Conversation) -> ChatRequest {
        let mut messages: Vec<Message> = Vec::with_capacity(conversation.len() + 1);
        for m in conversation.messages() {
            // Endpoints reject adjacent assistant turns; separate them on the wire.
            if m.role == Role::Assistant
                && messages.last().is_some_and(|p| p.role == Role::Assistant)
            {
                tracing::debug!("separating adjacent assistant messages in request");
                messages.push(Message::user(HISTORY_REPAIR_NOTICE));
            }
            messages.push(m.clone());
        }
        let mut req = ChatRequest::new(messages);
        req.temperature = Some(self.sampling.temperature);
        req.top_p = Some(self.sampling.top_p);
        req.max_tokens = Some(self.sampling.max_tokens);
        req.stop = self.sampling.stop.clone();
        req.timeout = Some(self.sampling.timeout);
        req
    }
}

#[async_trait::async_trait]
impl Completer for CompletionClient {
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        conversation: &mut Conversation,
    ) -> Result<String> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut repaired = false;
        let mut last = String::new();

        for attempt in 0..max_attempts {
            let req = self.build_request(conversation);
            match self.backend.chat(endpoint, &req).await {
                Ok(text) => return Ok(text.trim().to_string()),
                Err(e) if e.is_consecutive_assistant_rejection() => {
                    if repaired {
                        return Err(Error::Completion {
                            attempts: attempt + 1,
                            last: e.to_string(),
                        });
                    }
                    tracing::warn!(attempt = attempt + 1, "history rejected; appending repair observation");
                    conversation.push_user(HISTORY_REPAIR_NOTICE);
                    repaired = true;
                    last = e.to_string();
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "completion attempt failed"
                    );
                    last = e.to_string();
                }
            }
            if attempt + 1 < max_attempts {
                let delay = self.retry.delay_for(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(Error::Completion {
            attempts: max_attempts,
            last,
        })
    }
}
