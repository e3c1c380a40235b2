use crate::config::env;
use crate::{Capability, Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Provider requests can hang without an explicit timeout.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);

fn brave_api_key_from_env() -> Option<String> {
    env("DEEPRESEARCH_BRAVE_API_KEY").or_else(|| env("BRAVE_SEARCH_API_KEY"))
}

fn tavily_api_key_from_env() -> Option<String> {
    env("DEEPRESEARCH_TAVILY_API_KEY").or_else(|| env("TAVILY_API_KEY"))
}

pub fn searxng_endpoints_from_env() -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    // Comma/whitespace-separated list for simple load spreading.
    if let Some(v) = env("DEEPRESEARCH_SEARXNG_ENDPOINTS") {
        for raw in v.split(|c: char| c == ',' || c.is_whitespace()) {
            let s = raw.trim();
            if !s.is_empty() && !out.iter().any(|e| e == s) {
                out.push(s.to_string());
            }
        }
    }
    if let Some(s) = env("DEEPRESEARCH_SEARXNG_ENDPOINT") {
        if !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct BraveSearchProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Clone)]
pub struct TavilySearchProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Clone)]
pub struct SearxngSearchProvider {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl BraveSearchProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = brave_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing DEEPRESEARCH_BRAVE_API_KEY (or BRAVE_SEARCH_API_KEY)".to_string(),
            )
        })?;
        let endpoint = env("DEEPRESEARCH_BRAVE_ENDPOINT")
            .unwrap_or_else(|| "https://api.search.brave.com/res/v1/web/search".to_string());
        Ok(Self {
            client,
            api_key,
            endpoint,
        })
    }
}

impl TavilySearchProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = tavily_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing DEEPRESEARCH_TAVILY_API_KEY (or TAVILY_API_KEY)".to_string(),
            )
        })?;
        let endpoint = env("DEEPRESEARCH_TAVILY_ENDPOINT")
            .unwrap_or_else(|| "https://api.tavily.com/search".to_string());
        Ok(Self {
            client,
            api_key,
            endpoint,
        })
    }
}

impl SearxngSearchProvider {
    pub fn new(client: reqwest::Client, endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NotConfigured(
                "missing DEEPRESEARCH_SEARXNG_ENDPOINT (or DEEPRESEARCH_SEARXNG_ENDPOINTS)"
                    .to_string(),
            ));
        }
        Ok(Self { client, endpoints })
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        Self::new(client, searxng_endpoints_from_env())
    }

    fn endpoint_search_for(base_endpoint: &str) -> String {
        // Accept either a base URL or a full /search endpoint.
        let mut base = base_endpoint.trim().trim_end_matches('/').to_string();
        if !base.ends_with("/search") {
            base.push_str("/search");
        }
        base
    }

    fn stable_hash64(query: &SearchQuery) -> u64 {
        // FNV-1a; stable across runs, unlike RandomState.
        let mut h: u64 = 1469598103934665603;
        for b in query.query.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(1099511628211);
        }
        h
    }

    fn pick_endpoint_index(&self, q: &SearchQuery) -> usize {
        if self.endpoints.is_empty() {
            return 0;
        }
        (Self::stable_hash64(q) as usize) % self.endpoints.len()
    }
}

#[derive(Debug, Deserialize)]
struct BraveWebSearchResponse {
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Option<Vec<BraveWebResult>>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    url: String,
    title: Option<String>,
    description: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for BraveSearchProvider {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let mut req = self
            .client
            .get(&self.endpoint)
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", q.query.as_str())]);
        if let Some(n) = q.max_results {
            req = req.query(&[("count", n.to_string())]);
        }

        let resp = req
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("brave search HTTP {status}")));
        }
        let parsed: BraveWebSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let results = parsed
            .web
            .and_then(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .map(|r| SearchResult {
                url: r.url,
                title: r.title,
                snippet: r.description,
                source: "brave".to_string(),
            })
            .collect();
        Ok(SearchResponse {
            results,
            provider: "brave".to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    title: Option<String>,
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for TavilySearchProvider {
    fn name(&self) -> &'static str {
        "tavily"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let body = json!({
            "query": q.query,
            "max_results": q.max_results.unwrap_or(10).min(20),
            "include_answer": false,
            "include_raw_content": false,
            "search_depth": "basic",
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&body)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("tavily search HTTP {status}")));
        }
        let parsed: TavilySearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let results = parsed
            .results
            .into_iter()
            .map(|r| SearchResult {
                url: r.url,
                title: r.title,
                snippet: r.content,
                source: "tavily".to_string(),
            })
            .collect();
        Ok(SearchResponse {
            results,
            provider: "tavily".to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearxngSearchResponse {
    results: Option<Vec<SearxngResult>>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    url: Option<String>,
    title: Option<String>,
    // SearXNG uses `content` for snippets.
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for SearxngSearchProvider {
    fn name(&self) -> &'static str {
        "searxng"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let max_results = q.max_results.unwrap_or(10).min(20);
        let base = self
            .endpoints
            .get(self.pick_endpoint_index(q))
            .map(String::as_str)
            .unwrap_or("");

        let resp = self
            .client
            .get(Self::endpoint_search_for(base))
            .query(&[("q", q.query.as_str()), ("format", "json")])
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("searxng search HTTP {status}")));
        }
        let parsed: SearxngSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let results = parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| {
                Some(SearchResult {
                    url: r.url?,
                    title: r.title,
                    snippet: r.content,
                    source: "searxng".to_string(),
                })
            })
            .take(max_results)
            .collect();
        Ok(SearchResponse {
            results,
            provider: "searxng".to_string(),
        })
    }
}

/// Resolve a provider by name; `auto` picks the first configured of brave, tavily, searxng.
pub fn provider_from_env(
    client: reqwest::Client,
    name: &str,
) -> Result<Arc<dyn SearchProvider>> {
    match name {
        "brave" => Ok(Arc::new(BraveSearchProvider::from_env(client)?)),
        "tavily" => Ok(Arc::new(TavilySearchProvider::from_env(client)?)),
        "searxng" => Ok(Arc::new(SearxngSearchProvider::from_env(client)?)),
        "auto" => {
            if let Ok(p) = BraveSearchProvider::from_env(client.clone()) {
                return Ok(Arc::new(p));
            }
            if let Ok(p) = TavilySearchProvider::from_env(client.clone()) {
                return Ok(Arc::new(p));
            }
            SearxngSearchProvider::from_env(client)
                .map(|p| Arc::new(p) as Arc<dyn SearchProvider>)
                .map_err(|_| {
                    Error::NotConfigured(
                        "no search provider configured (brave, tavily or searxng)".to_string(),
                    )
                })
        }
        other => Err(Error::NotSupported(format!("unknown search provider: {other}"))),
    }
}

/// Queries in a `query` argument: one string or a list of strings.
pub(crate) fn string_or_list(v: Option<&Value>) -> Vec<String> {
    let raw: Vec<&str> = match v {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(xs)) => xs.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn format_results(query: &str, resp: &SearchResponse) -> String {
    if resp.results.is_empty() {
        return format!("No results found for '{query}'. Try with a more general query.");
    }
    let lines: Vec<String> = resp
        .results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let title = r.title.as_deref().unwrap_or(&r.url);
            let mut line = format!("{}. [{}]({})", i + 1, title, r.url);
            if let Some(s) = r.snippet.as_deref().filter(|s| !s.trim().is_empty()) {
                line.push('\n');
                line.push_str(s.trim());
            }
            line
        })
        .collect();
    format!(
        "A search for '{query}' found {} results:\n\n## Web Results\n{}",
        resp.results.len(),
        lines.join("\n\n")
    )
}

/// The `search` tool: runs each query in order and joins the formatted blocks.
pub struct WebSearch {
    provider: Arc<dyn SearchProvider>,
    max_results: usize,
}

impl WebSearch {
    pub fn new(provider: Arc<dyn SearchProvider>) -> Self {
        Self {
            provider,
            max_results: 10,
        }
    }
}

pub(crate) const BLOCK_SEPARATOR: &str = "\n=======\n";

#[async_trait::async_trait]
impl Capability for WebSearch {
    fn name(&self) -> &'static str {
        "search"
    }

    fn description(&self) -> &'static str {
        "Perform web searches and return the top results for each query. Accepts a single query or an array of queries."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": ["string", "array"],
                    "items": {"type": "string"},
                    "description": "The search query, or an array of queries."
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, arguments: &Value) -> Result<String> {
        let queries = string_or_list(arguments.get("query"));
        if queries.is_empty() {
            return Err(Error::Tool(
                "[Search] Invalid request format: 'query' must be a string or an array of strings"
                    .to_string(),
            ));
        }
        let mut blocks = Vec::with_capacity(queries.len());
        for q in &queries {
            let mut sq = SearchQuery::new(q.clone());
            sq.max_results = Some(self.max_results);
            let block = match self.provider.search(&sq).await {
                Ok(resp) => format_results(q, &resp),
                Err(e) => {
                    tracing::warn!(provider = self.provider.name(), query = %q, error = %e, "search failed");
                    format!("[Search] '{q}' failed: {e}")
                }
            };
            blocks.push(block);
        }
        Ok(blocks.join(BLOCK_SEPARATOR))
    }
}
