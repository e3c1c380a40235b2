//! Optional HTML → Markdown conversion through a local reader model.

use crate::{ChatBackend, ChatRequest, Error, Message, ModelEndpoint, Result};
use std::sync::Arc;
use std::time::Duration;

pub const TRUNCATION_MARKER: &str = "\n<!-- Content truncated -->";

/// Turns sanitized markup into readable text.
#[async_trait::async_trait]
pub trait ContentConverter: Send + Sync {
    async fn convert(&self, html: &str) -> Result<String>;
}

pub struct ReaderLm {
    backend: Arc<dyn ChatBackend>,
    endpoint: ModelEndpoint,
    max_chars: usize,
    timeout: Duration,
}

impl ReaderLm {
    pub fn new(backend: Arc<dyn ChatBackend>, endpoint: ModelEndpoint, max_chars: usize) -> Self {
        Self {
            backend,
            endpoint,
            max_chars,
            timeout: Duration::from_secs(120),
        }
    }
}

#[async_trait::async_trait]
impl ContentConverter for ReaderLm {
    async fn convert(&self, html: &str) -> Result<String> {
        let (mut input, truncated) = crate::extract::truncate_chars(html, self.max_chars);
        if truncated {
            input.push_str(TRUNCATION_MARKER);
        }
        let mut req = ChatRequest::new(vec![Message::user(input)]);
        req.temperature = Some(0.0);
        req.max_tokens = Some(4_000);
        req.timeout = Some(self.timeout);

        let out = self.backend.chat(&self.endpoint, &req).await?;
        let out = out.trim();
        if out.is_empty() {
            return Err(Error::Llm("reader model returned empty output".to_string()));
        }
        Ok(out.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::tests::ScriptedBackend;

    #[tokio::test]
    async fn truncates_input_and_marks_it() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok("  # Converted \n".to_string())]));
        let reader = ReaderLm::new(backend.clone(), ModelEndpoint::new("http://unused", "readerlm"), 10);
        let out = reader.convert("<p>0123456789abcdef</p>").await.unwrap();
        assert_eq!(out, "# Converted");

        let reqs = backend.requests.lock().unwrap();
        assert_eq!(reqs[0].messages[0].content, format!("<p>0123456{TRUNCATION_MARKER}"));
        assert_eq!(reqs[0].temperature, Some(0.0));
    }

    #[tokio::test]
    async fn empty_output_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok("   ".to_string())]));
        let reader = ReaderLm::new(backend, ModelEndpoint::new("http://unused", "readerlm"), 100);
        assert!(reader.convert("<p>x</p>").await.is_err());
    }
}
