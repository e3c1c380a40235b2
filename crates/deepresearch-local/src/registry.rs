//! Immutable name → capability map.

use crate::config::AgentConfig;
use crate::files::FileParser;
use crate::papers::{Scholar, ScholarClient};
use crate::prompts::{unknown_tool, ToolSpec};
use crate::python::PythonInterpreter;
use crate::search::{provider_from_env, WebSearch};
use crate::visit::{Visit, VisitPipeline};
use crate::{
    Capability, Error, LocalFetcher, Result, SearchProvider, SearchQuery, SearchResponse,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The set of tools one agent may call. Built once and never mutated.
pub struct CapabilityRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    tools: Vec<Arc<dyn Capability>>,
}

impl RegistryBuilder {
    pub fn with(mut self, tool: Arc<dyn Capability>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> Result<CapabilityRegistry> {
        let mut tools = BTreeMap::new();
        for tool in self.tools {
            let name = tool.name();
            if tools.insert(name, tool).is_some() {
                return Err(Error::NotConfigured(format!("tool registered twice: {name}")));
            }
        }
        Ok(CapabilityRegistry { tools })
    }
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn catalogue(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Run `name` and return its observation. Errors become observation text.
    pub async fn dispatch(&self, name: &str, arguments: &Value) -> String {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool = %name, "unknown tool requested");
            return unknown_tool(name);
        };
        tracing::info!(tool = %name, "dispatching tool");
        match tool.call(arguments).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool failed");
                format!("[{name}] {e}")
            }
        }
    }

    /// The five research tools wired from configuration.
    ///
    /// A missing search provider does not fail construction; the `search` tool then reports
    /// the configuration problem as its observation.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let http = LocalFetcher::new()?.client().clone();
        let provider: Arc<dyn SearchProvider> =
            match provider_from_env(http.clone(), &config.search_provider) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "web search unavailable");
                    Arc::new(UnavailableSearch(e.to_string()))
                }
            };
        let pipeline = VisitPipeline::from_config(config)?;

        Self::builder()
            .with(Arc::new(WebSearch::new(provider)))
            .with(Arc::new(Visit::new(Arc::new(pipeline))))
            .with(Arc::new(Scholar::new(ScholarClient::from_env(http))))
            .with(Arc::new(PythonInterpreter::new(
                config.python_bin.clone(),
                config.python_timeout,
            )))
            .with(Arc::new(FileParser::new(config.file_root.clone())))
            .build()
    }
}

/// Stand-in provider when no backend is configured; every query fails with the setup error.
struct UnavailableSearch(String);

#[async_trait::async_trait]
impl SearchProvider for UnavailableSearch {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn search(&self, _query: &SearchQuery) -> Result<SearchResponse> {
        Err(Error::NotConfigured(self.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait::async_trait]
    impl Capability for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn description(&self) -> &'static str {
            "echo arguments"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn call(&self, arguments: &Value) -> Result<String> {
            match arguments.get("fail") {
                Some(_) => Err(Error::Tool("asked to fail".to_string())),
                None => Ok(arguments.to_string()),
            }
        }
    }

    #[tokio::test]
    async fn dispatches_and_converts_errors_to_text() {
        let reg = CapabilityRegistry::builder().with(Arc::new(Echo)).build().unwrap();
        assert_eq!(reg.dispatch("echo", &json!({"a": 1})).await, "{\"a\":1}");
        assert_eq!(
            reg.dispatch("echo", &json!({"fail": true})).await,
            "[echo] tool failed: asked to fail"
        );
        assert_eq!(reg.dispatch("nope", &json!({})).await, "Error: Tool nope not found");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = CapabilityRegistry::builder()
            .with(Arc::new(Echo))
            .with(Arc::new(Echo))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("echo"));
    }

    #[test]
    fn configured_registry_has_the_five_tools() {
        let _lock = crate::config::tests::ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g = crate::config::tests::EnvGuard::set("DEEPRESEARCH_SEARCH_PROVIDER", "bogus");
        let cfg = AgentConfig::from_env().unwrap();
        let reg = CapabilityRegistry::from_config(&cfg).unwrap();
        assert_eq!(
            reg.names(),
            vec!["PythonInterpreter", "google_scholar", "parse_file", "search", "visit"]
        );
        let catalogue = reg.catalogue();
        assert!(catalogue.iter().all(|t| t.parameters.is_object()));
    }

    #[tokio::test]
    async fn unavailable_search_reports_inline() {
        let tool = WebSearch::new(Arc::new(UnavailableSearch("no keys".to_string())));
        let out = tool.call(&json!({"query": ["a"]})).await.unwrap();
        assert!(out.contains("no keys"), "{out}");
    }
}
