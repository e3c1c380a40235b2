//! Scholarly lookup behind the `google_scholar` tool.
//!
//! Semantic Scholar is asked first; OpenAlex is the fallback when it errors (it is heavily
//! rate-limited) or returns nothing. Every request is bounded by `limit` and a timeout.
//!
//! Providers:
//! - Semantic Scholar Graph API: https://api.semanticscholar.org/
//! - OpenAlex: https://api.openalex.org/

use crate::config::env;
use crate::search::{string_or_list, BLOCK_SEPARATOR};
use crate::{Capability, Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const SEMANTIC_SCHOLAR_SEARCH: &str = "https://api.semanticscholar.org/graph/v1/paper/search";
const OPENALEX_WORKS: &str = "https://api.openalex.org/works";

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Paper {
    pub title: String,
    pub year: Option<u32>,
    pub authors: Vec<String>,
    pub venue: Option<String>,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
    pub doi: Option<String>,
    pub citation_count: Option<u64>,
    pub abstract_text: Option<String>,
    pub source: &'static str,
}

#[derive(Debug, Clone)]
pub struct ScholarClient {
    http: reqwest::Client,
    semantic_scholar_endpoint: String,
    openalex_endpoint: String,
    limit: usize,
    timeout: Duration,
}

impl ScholarClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            semantic_scholar_endpoint: SEMANTIC_SCHOLAR_SEARCH.to_string(),
            openalex_endpoint: OPENALEX_WORKS.to_string(),
            limit: 10,
            timeout: Duration::from_secs(20),
        }
    }

    pub fn from_env(http: reqwest::Client) -> Self {
        let mut c = Self::new(http);
        if let Some(e) = env("DEEPRESEARCH_SEMANTIC_SCHOLAR_ENDPOINT") {
            c.semantic_scholar_endpoint = e;
        }
        if let Some(e) = env("DEEPRESEARCH_OPENALEX_ENDPOINT") {
            c.openalex_endpoint = e;
        }
        c
    }

    pub fn with_endpoints(mut self, semantic_scholar: String, openalex: String) -> Self {
        self.semantic_scholar_endpoint = semantic_scholar;
        self.openalex_endpoint = openalex;
        self
    }

    /// Semantic Scholar, falling back to OpenAlex.
    pub async fn search(&self, query: &str) -> Result<Vec<Paper>> {
        match self.semantic_scholar_search(query).await {
            Ok(papers) if !papers.is_empty() => return Ok(papers),
            Ok(_) => tracing::debug!(query, "semantic scholar returned nothing; trying openalex"),
            Err(e) => tracing::warn!(query, error = %e, "semantic scholar failed; trying openalex"),
        }
        self.openalex_search(query).await
    }

    async fn semantic_scholar_search(&self, query: &str) -> Result<Vec<Paper>> {
        #[derive(Debug, Deserialize)]
        struct Resp {
            data: Option<Vec<Item>>,
        }
        #[derive(Debug, Deserialize)]
        struct Item {
            title: Option<String>,
            year: Option<u32>,
            venue: Option<String>,
            url: Option<String>,
            #[serde(rename = "citationCount")]
            citation_count: Option<u64>,
            authors: Option<Vec<Author>>,
            #[serde(rename = "externalIds")]
            external_ids: Option<ExternalIds>,
            #[serde(rename = "openAccessPdf")]
            open_access_pdf: Option<OpenAccessPdf>,
            #[serde(rename = "abstract")]
            abstract_text: Option<String>,
        }
        #[derive(Debug, Deserialize)]
        struct Author {
            name: Option<String>,
        }
        #[derive(Debug, Deserialize)]
        struct ExternalIds {
            #[serde(rename = "DOI")]
            doi: Option<String>,
        }
        #[derive(Debug, Deserialize)]
        struct OpenAccessPdf {
            url: Option<String>,
        }

        let fields = "title,year,venue,authors,externalIds,url,openAccessPdf,citationCount,abstract";
        let limit = self.limit.clamp(1, 50).to_string();
        let resp = self
            .http
            .get(&self.semantic_scholar_endpoint)
            .query(&[("query", query), ("limit", limit.as_str()), ("fields", fields)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Search(format!(
                "semantic_scholar search failed: HTTP {}",
                resp.status().as_u16()
            )));
        }
        let parsed: Resp = resp.json().await.map_err(|e| Error::Search(e.to_string()))?;

        Ok(parsed
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|it| {
                let title = normalize_ws(&it.title?);
                if title.is_empty() {
                    return None;
                }
                Some(Paper {
                    title,
                    year: it.year,
                    authors: it
                        .authors
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|a| a.name)
                        .map(|s| normalize_ws(&s))
                        .filter(|s| !s.is_empty())
                        .collect(),
                    venue: it.venue.map(|s| normalize_ws(&s)).filter(|s| !s.is_empty()),
                    url: it.url,
                    pdf_url: it.open_access_pdf.and_then(|p| p.url),
                    doi: it.external_ids.and_then(|x| x.doi),
                    citation_count: it.citation_count,
                    abstract_text: it
                        .abstract_text
                        .map(|s| normalize_ws(&s))
                        .filter(|s| !s.is_empty()),
                    source: "semantic_scholar",
                })
            })
            .collect())
    }

    async fn openalex_search(&self, query: &str) -> Result<Vec<Paper>> {
        #[derive(Debug, Deserialize)]
        struct Resp {
            results: Option<Vec<Item>>,
        }
        #[derive(Debug, Deserialize)]
        struct Item {
            display_name: Option<String>,
            publication_year: Option<u32>,
            doi: Option<String>,
            cited_by_count: Option<u64>,
            primary_location: Option<Location>,
            authorships: Option<Vec<Authorship>>,
            abstract_inverted_index: Option<BTreeMap<String, Vec<u32>>>,
        }
        #[derive(Debug, Deserialize)]
        struct Location {
            landing_page_url: Option<String>,
            pdf_url: Option<String>,
            source: Option<Source>,
        }
        #[derive(Debug, Deserialize)]
        struct Source {
            display_name: Option<String>,
        }
        #[derive(Debug, Deserialize)]
        struct Authorship {
            author: Option<AuthorObj>,
        }
        #[derive(Debug, Deserialize)]
        struct AuthorObj {
            display_name: Option<String>,
        }

        let select = "id,display_name,publication_year,primary_location,authorships,doi,cited_by_count,abstract_inverted_index";
        let per_page = self.limit.clamp(1, 200).to_string();
        let resp = self
            .http
            .get(&self.openalex_endpoint)
            .query(&[("search", query), ("per-page", per_page.as_str()), ("select", select)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Search(format!(
                "openalex search failed: HTTP {}",
                resp.status().as_u16()
            )));
        }
        let parsed: Resp = resp.json().await.map_err(|e| Error::Search(e.to_string()))?;

        Ok(parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(|it| {
                let title = normalize_ws(&it.display_name?);
                if title.is_empty() {
                    return None;
                }
                // DOIs come back as "https://doi.org/10....".
                let doi = it
                    .doi
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.strip_prefix("https://doi.org/").unwrap_or(s).to_string());
                let (url, pdf_url, venue) = match it.primary_location {
                    Some(l) => (
                        l.landing_page_url,
                        l.pdf_url,
                        l.source
                            .and_then(|s| s.display_name)
                            .map(|s| normalize_ws(&s))
                            .filter(|s| !s.is_empty()),
                    ),
                    None => (None, None, None),
                };
                Some(Paper {
                    title,
                    year: it.publication_year,
                    authors: it
                        .authorships
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|a| a.author.and_then(|x| x.display_name))
                        .map(|s| normalize_ws(&s))
                        .filter(|s| !s.is_empty())
                        .collect(),
                    venue,
                    url,
                    pdf_url,
                    doi,
                    citation_count: it.cited_by_count,
                    abstract_text: it
                        .abstract_inverted_index
                        .map(|inv| inverted_index_to_text(&inv))
                        .filter(|s| !s.is_empty()),
                    source: "openalex",
                })
            })
            .collect())
    }
}

/// OpenAlex ships abstracts as token -> positions; rebuild the text in position order.
fn inverted_index_to_text(inv: &BTreeMap<String, Vec<u32>>) -> String {
    let mut positions: BTreeMap<u32, &str> = BTreeMap::new();
    for (tok, ps) in inv {
        for p in ps {
            positions.entry(*p).or_insert(tok.as_str());
        }
    }
    normalize_ws(&positions.into_values().collect::<Vec<_>>().join(" "))
}

const MAX_ABSTRACT_CHARS: usize = 500;

fn format_papers(query: &str, papers: &[Paper]) -> String {
    if papers.is_empty() {
        return format!("No scholarly results found for '{query}'. Try with a more general query.");
    }
    let entries: Vec<String> = papers
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let link = p
                .url
                .as_deref()
                .or(p.pdf_url.as_deref())
                .unwrap_or("no link");
            let mut s = format!("{}. [{}]({})", i + 1, p.title, link);
            let mut meta = Vec::new();
            if !p.authors.is_empty() {
                let mut a = p.authors.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
                if p.authors.len() > 3 {
                    a.push_str(" et al.");
                }
                meta.push(a);
            }
            if let Some(v) = &p.venue {
                meta.push(v.clone());
            }
            if let Some(y) = p.year {
                meta.push(y.to_string());
            }
            if let Some(c) = p.citation_count {
                meta.push(format!("cited by {c}"));
            }
            if !meta.is_empty() {
                s.push('\n');
                s.push_str(&meta.join(" - "));
            }
            if let Some(abs) = &p.abstract_text {
                s.push('\n');
                s.push_str(&abs.chars().take(MAX_ABSTRACT_CHARS).collect::<String>());
            }
            s
        })
        .collect();
    format!(
        "A scholarly search for '{query}' found {} results:\n\n## Scholar Results\n{}",
        papers.len(),
        entries.join("\n\n")
    )
}

/// The `google_scholar` tool.
pub struct Scholar {
    client: ScholarClient,
}

impl Scholar {
    pub fn new(client: ScholarClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Capability for Scholar {
    fn name(&self) -> &'static str {
        "google_scholar"
    }

    fn description(&self) -> &'static str {
        "Search academic literature and return matching papers with authors, venue, year and citation counts. Accepts a single query or an array of queries."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": ["string", "array"],
                    "items": {"type": "string"},
                    "description": "The scholarly search query, or an array of queries."
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, arguments: &Value) -> Result<String> {
        let queries = string_or_list(arguments.get("query"));
        if queries.is_empty() {
            return Err(Error::Tool(
                "[google_scholar] Invalid request format: 'query' must be a string or an array of strings"
                    .to_string(),
            ));
        }
        let mut blocks = Vec::with_capacity(queries.len());
        for q in &queries {
            blocks.push(match self.client.search(q).await {
                Ok(papers) => format_papers(q, &papers),
                Err(e) => format!("[google_scholar] '{q}' failed: {e}"),
            });
        }
        Ok(blocks.join(BLOCK_SEPARATOR))
    }
}
