//! Web-visit pipeline: fetch → sanitize → convert/extract → truncate → summarize with repair.
//!
//! Every failure mode ends in text. An unreachable page, an empty extraction or a summary that
//! never parses all yield the canned record for that URL; a multi-URL visit never aborts.

use crate::config::{AgentConfig, VisitConfig};
use crate::extract::{bytes_look_like_pdf, fallback_extract, pdf_to_text, truncate_chars};
use crate::prompts::extractor_prompt;
use crate::openai_compat::OpenAiCompatClient;
use crate::reader::{ContentConverter, ReaderLm};
use crate::sanitize::sanitize_html;
use crate::search::BLOCK_SEPARATOR;
use crate::tokens::Tokenizer;
use crate::{
    Capability, ChatBackend, ChatRequest, Error, FetchBackend, FetchRequest, LocalFetcher,
    Message, ModelEndpoint, Result,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const INVALID_VISIT_REQUEST: &str =
    "[Visit] Invalid request format: Input must be a JSON object containing 'url' and 'goal' fields";
pub const UNREACHABLE_EVIDENCE: &str =
    "The provided webpage content could not be accessed. Please check the URL or file format.";
pub const UNPROCESSED_SUMMARY: &str =
    "The webpage content could not be processed, and therefore, no information is available.";

/// Summary record for one URL.
pub fn summary_record(url: &str, goal: &str, evidence: &str, summary: &str) -> String {
    format!(
        "The useful information in {url} for user goal {goal} as follows: \n\nEvidence in page: \n{evidence}\n\nSummary: \n{summary}\n\n"
    )
}

pub fn canned_record(url: &str, goal: &str) -> String {
    summary_record(url, goal, UNREACHABLE_EVIDENCE, UNPROCESSED_SUMMARY)
}

/// Produces the raw (expected JSON) summary of `content` for `goal`.
///
/// Implementations never fail; an empty string signals that nothing usable came back.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, content: &str, goal: &str) -> String;
}

/// Summarizer for deployments without a summary model. Every page gets the canned record.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSummarizer;

#[async_trait::async_trait]
impl Summarizer for DisabledSummarizer {
    async fn summarize(&self, _content: &str, _goal: &str) -> String {
        String::new()
    }
}

pub struct LlmSummarizer {
    backend: Arc<dyn ChatBackend>,
    endpoint: ModelEndpoint,
    max_retries: u32,
    timeout: Duration,
}

impl LlmSummarizer {
    pub fn new(backend: Arc<dyn ChatBackend>, endpoint: ModelEndpoint, max_retries: u32) -> Self {
        Self {
            backend,
            endpoint,
            max_retries: max_retries.max(1),
            timeout: Duration::from_secs(300),
        }
    }
}

/// If `reply` is not JSON on its own, keep the outermost `{…}` span.
fn isolate_json_object(reply: &str) -> &str {
    if serde_json::from_str::<Value>(reply).is_ok() {
        return reply;
    }
    match (reply.find('{'), reply.rfind('}')) {
        (Some(l), Some(r)) if l <= r => &reply[l..=r],
        _ => reply,
    }
}

#[async_trait::async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, content: &str, goal: &str) -> String {
        let mut req = ChatRequest::new(vec![Message::user(extractor_prompt(content, goal))]);
        req.temperature = Some(0.7);
        req.timeout = Some(self.timeout);

        for attempt in 0..self.max_retries {
            match self.backend.chat(&self.endpoint, &req).await {
                Ok(reply) if !reply.is_empty() => return isolate_json_object(&reply).to_string(),
                Ok(_) => tracing::debug!(attempt = attempt + 1, "summary model returned empty text"),
                Err(e) => tracing::warn!(attempt = attempt + 1, error = %e, "summary call failed"),
            }
        }
        String::new()
    }
}

/// Remove markdown code-fence wrappers around a JSON reply.
fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

fn render_field(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// `(evidence, summary)` from a JSON reply; both fields must be present.
fn parse_page_summary(raw: &str) -> Option<(String, String)> {
    let v: Value = serde_json::from_str(raw).ok()?;
    let obj = v.as_object()?;
    let evidence = obj.get("evidence").and_then(render_field)?;
    let summary = obj.get("summary").and_then(render_field)?;
    Some((evidence, summary))
}

/// Run CPU-bound extraction on tokio's blocking pool.
async fn off_runtime<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Fetch(format!("extraction task failed: {e}")))
}

pub struct VisitPipeline {
    fetcher: Arc<dyn FetchBackend>,
    converter: Option<Arc<dyn ContentConverter>>,
    summarizer: Arc<dyn Summarizer>,
    tokenizer: Option<Arc<Tokenizer>>,
    config: VisitConfig,
}

impl VisitPipeline {
    pub fn new(
        fetcher: Arc<dyn FetchBackend>,
        summarizer: Arc<dyn Summarizer>,
        config: VisitConfig,
    ) -> Self {
        Self {
            fetcher,
            converter: None,
            summarizer,
            tokenizer: Tokenizer::new().ok().map(Arc::new),
            config,
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn ContentConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Local fetcher plus the summary and reader models named in `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let llm: Arc<dyn ChatBackend> = Arc::new(OpenAiCompatClient::with_default_client()?);
        let summarizer: Arc<dyn Summarizer> = match &config.summary {
            Some(endpoint) => Arc::new(LlmSummarizer::new(
                llm.clone(),
                endpoint.clone(),
                config.summary_max_retries,
            )),
            None => {
                tracing::warn!("no summary model configured; visits return canned records");
                Arc::new(DisabledSummarizer)
            }
        };
        let fetcher: Arc<dyn FetchBackend> = Arc::new(LocalFetcher::new()?);
        let mut pipeline = Self::new(fetcher, summarizer, config.visit.clone());
        if let Some(endpoint) = &config.reader {
            pipeline = pipeline.with_converter(Arc::new(ReaderLm::new(
                llm,
                endpoint.clone(),
                config.visit.reader_max_chars,
            )));
        }
        Ok(pipeline)
    }

    /// Visit `urls` in order under one shared deadline and join the records.
    ///
    /// PDF parsing, markup cleanup and tokenization run on the blocking pool so one large page
    /// does not stall other runs polled on the same task.
    pub async fn visit(&self, urls: &[String], goal: &str) -> String {
        let t0 = Instant::now();
        let mut records = Vec::with_capacity(urls.len());
        for url in urls {
            if t0.elapsed() >= self.config.batch_deadline {
                tracing::warn!(%url, "visit deadline reached; skipping fetch");
                records.push(canned_record(url, goal));
                continue;
            }
            records.push(self.read_page(url, goal).await);
        }
        records.join(BLOCK_SEPARATOR).trim().to_string()
    }

    /// Full sequence for one URL. Never fails.
    pub async fn read_page(&self, url: &str, goal: &str) -> String {
        let Some(content) = self.fetch_content(url).await else {
            return canned_record(url, goal);
        };
        let content = match self.truncate_tokens(content).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%url, error = %e, "token truncation failed");
                return canned_record(url, goal);
            }
        };
        self.summarize_with_repair(url, goal, content).await
    }

    async fn truncate_tokens(&self, content: String) -> Result<String> {
        let max = self.config.max_content_tokens;
        match self.tokenizer.clone() {
            Some(t) => off_runtime(move || t.truncate(&content, max)).await,
            None => Ok(truncate_chars(&content, max.saturating_mul(4)).0),
        }
    }

    async fn fetch_content(&self, url: &str) -> Option<String> {
        let attempts = self.config.fetch_attempts.max(1);
        for attempt in 0..attempts {
            match self.read_once(url).await {
                Ok(text) if !text.trim().is_empty() => return Some(text),
                Ok(_) => tracing::debug!(%url, attempt = attempt + 1, "no content extracted"),
                Err(e) => tracing::warn!(%url, attempt = attempt + 1, error = %e, "page read failed"),
            }
            if attempt + 1 < attempts && !self.config.fetch_retry_pause.is_zero() {
                tokio::time::sleep(self.config.fetch_retry_pause).await;
            }
        }
        None
    }

    async fn read_once(&self, url: &str) -> Result<String> {
        let mut req = FetchRequest::new(url);
        req.timeout_ms = Some(self.config.fetch_timeout.as_millis() as u64);
        req.max_bytes = Some(self.config.max_page_bytes);
        let resp = self.fetcher.fetch(&req).await?;
        if !resp.is_success() {
            return Err(Error::Fetch(format!("HTTP {} for {url}", resp.status)));
        }

        let content_type = resp
            .content_type
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();
        if content_type.contains("application/pdf") || bytes_look_like_pdf(&resp.bytes) {
            let bytes = resp.bytes;
            return off_runtime(move || pdf_to_text(&bytes))
                .await?
                .map_err(Error::Fetch);
        }
        let body = resp.text_lossy();
        if content_type.starts_with("text/plain") || content_type.contains("json") {
            return Ok(body);
        }

        let cleaned = off_runtime(move || sanitize_html(&body)).await?;
        if let Some(converter) = &self.converter {
            match converter.convert(&cleaned).await {
                Ok(text) => return Ok(text),
                Err(e) => tracing::warn!(%url, error = %e, "reader conversion failed; using fallback extraction"),
            }
        }
        off_runtime(move || fallback_extract(&cleaned)).await
    }

    async fn summarize_with_repair(&self, url: &str, goal: &str, mut content: String) -> String {
        let cfg = &self.config;
        let mut raw = self.summarizer.summarize(&content, goal).await;

        // Undersized replies: shrink the content and ask again.
        let mut retries_left = cfg.max_summary_retries;
        while raw.chars().count() < cfg.min_summary_chars && retries_left > 0 {
            let len = content.chars().count();
            let target = if retries_left > 1 {
                (len as f64 * cfg.summary_truncation_ratio) as usize
            } else {
                cfg.summary_truncation_floor.min(len)
            };
            tracing::info!(%url, from = len, to = target, "summary too short; truncating content");
            content = truncate_chars(&content, target).0;
            raw = self.summarizer.summarize(&content, goal).await;
            retries_left -= 1;
        }

        let mut parse_attempts = 1;
        loop {
            if let Some((evidence, summary)) = parse_page_summary(&strip_code_fences(&raw)) {
                return summary_record(url, goal, &evidence, &summary);
            }
            if parse_attempts >= cfg.max_parse_attempts {
                tracing::warn!(%url, attempts = parse_attempts, "summary never parsed; using canned record");
                return canned_record(url, goal);
            }
            raw = self.summarizer.summarize(&content, goal).await;
            parse_attempts += 1;
        }
    }
}

/// The `visit` tool.
pub struct Visit {
    pipeline: Arc<VisitPipeline>,
}

impl Visit {
    pub fn new(pipeline: Arc<VisitPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl Capability for Visit {
    fn name(&self) -> &'static str {
        "visit"
    }

    fn description(&self) -> &'static str {
        "Visit webpage(s) and return the summary of the content."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": ["string", "array"],
                    "items": {"type": "string"},
                    "minItems": 1,
                    "description": "The URL(s) of the webpage(s) to visit. Can be a single URL or an array of URLs."
                },
                "goal": {
                    "type": "string",
                    "description": "The goal of the visit for webpage(s)."
                }
            },
            "required": ["url", "goal"]
        })
    }

    async fn call(&self, arguments: &Value) -> Result<String> {
        let goal = arguments.get("goal").and_then(Value::as_str);
        let urls: Option<Vec<String>> = match arguments.get("url") {
            Some(Value::String(s)) => Some(vec![s.clone()]),
            Some(Value::Array(xs)) => xs.iter().map(|x| x.as_str().map(str::to_string)).collect(),
            _ => None,
        };
        match (urls, goal) {
            (Some(urls), Some(goal)) if !urls.is_empty() => Ok(self.pipeline.visit(&urls, goal).await),
            _ => Ok(INVALID_VISIT_REQUEST.to_string()),
        }
    }
}
