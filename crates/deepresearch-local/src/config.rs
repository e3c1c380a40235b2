//! Environment-driven configuration.
//!
//! Every knob is read from a `DEEPRESEARCH_*` variable; values are trimmed and empty strings
//! are treated as unset. The CLI layers its flags on top of [`AgentConfig::from_env`].

use crate::{ModelEndpoint, Result};
use std::path::PathBuf;
use std::time::Duration;

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env(key).and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

pub(crate) fn env_bool(key: &str, default: bool) -> bool {
    match env(key).map(|s| s.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

pub const DEFAULT_PLANNER_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_PLANNER_MODEL: &str = "deepresearch";
pub const DEFAULT_READER_BASE_URL: &str = "http://localhost:8081";
pub const DEFAULT_READER_MODEL: &str = "readerlm";

/// Hard ceilings for one rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLimits {
    pub max_rounds: u32,
    pub max_llm_calls: u32,
    pub max_runtime: Duration,
    pub max_context_tokens: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_rounds: 15,
            max_llm_calls: 100,
            max_runtime: Duration::from_secs(150 * 60),
            max_context_tokens: 108 * 1024,
        }
    }
}

impl AgentLimits {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_rounds: env_parse("DEEPRESEARCH_MAX_ROUNDS", d.max_rounds).max(1),
            max_llm_calls: env_parse("DEEPRESEARCH_MAX_LLM_CALLS", d.max_llm_calls).max(1),
            max_runtime: Duration::from_secs(env_parse(
                "DEEPRESEARCH_MAX_RUNTIME_S",
                d.max_runtime.as_secs(),
            )),
            max_context_tokens: env_parse(
                "DEEPRESEARCH_MAX_CONTEXT_TOKENS",
                d.max_context_tokens,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisitConfig {
    /// Shared wall-clock ceiling for a multi-URL visit.
    pub batch_deadline: Duration,
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    pub fetch_retry_pause: Duration,
    pub max_page_bytes: u64,
    /// Markup handed to the reader model is cut to this many characters.
    pub reader_max_chars: usize,
    /// Extracted text is cut to this many tokens before summarization.
    pub max_content_tokens: usize,
    /// Summaries shorter than this are treated as empty.
    pub min_summary_chars: usize,
    pub summary_truncation_floor: usize,
    pub summary_truncation_ratio: f64,
    pub max_summary_retries: u32,
    pub max_parse_attempts: u32,
}

impl Default for VisitConfig {
    fn default() -> Self {
        Self {
            batch_deadline: Duration::from_secs(900),
            fetch_timeout: Duration::from_secs(30),
            fetch_attempts: 3,
            fetch_retry_pause: Duration::from_millis(500),
            max_page_bytes: 10_000_000,
            reader_max_chars: 15_000,
            max_content_tokens: 95_000,
            min_summary_chars: 10,
            summary_truncation_floor: 25_000,
            summary_truncation_ratio: 0.7,
            max_summary_retries: 3,
            max_parse_attempts: 3,
        }
    }
}

impl VisitConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            batch_deadline: Duration::from_secs(env_parse(
                "DEEPRESEARCH_VISIT_DEADLINE_S",
                d.batch_deadline.as_secs(),
            )),
            fetch_timeout: Duration::from_secs(env_parse(
                "DEEPRESEARCH_VISIT_FETCH_TIMEOUT_S",
                d.fetch_timeout.as_secs(),
            )),
            max_content_tokens: env_parse(
                "DEEPRESEARCH_VISIT_MAX_CONTENT_TOKENS",
                d.max_content_tokens,
            ),
            ..d
        }
    }
}

/// Everything the binary needs to assemble an agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub planner: ModelEndpoint,
    pub limits: AgentLimits,
    pub summary: Option<ModelEndpoint>,
    pub summary_max_retries: u32,
    pub reader: Option<ModelEndpoint>,
    pub visit: VisitConfig,
    pub search_provider: String,
    pub python_bin: String,
    pub python_timeout: Duration,
    pub file_root: PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let planner = ModelEndpoint::new(
            env("DEEPRESEARCH_PLANNER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PLANNER_BASE_URL.to_string()),
            env("DEEPRESEARCH_PLANNER_MODEL").unwrap_or_else(|| DEFAULT_PLANNER_MODEL.to_string()),
        )
        .with_api_key(env("DEEPRESEARCH_PLANNER_API_KEY"));

        // The summary model is optional: without it every visit yields the canned record.
        let summary = env("DEEPRESEARCH_SUMMARY_BASE_URL").map(|base| {
            ModelEndpoint::new(
                base,
                env("DEEPRESEARCH_SUMMARY_MODEL").unwrap_or_default(),
            )
            .with_api_key(env("DEEPRESEARCH_SUMMARY_API_KEY"))
        });

        let reader = env_bool("DEEPRESEARCH_READER_ENABLED", false).then(|| {
            ModelEndpoint::new(
                env("DEEPRESEARCH_READER_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_READER_BASE_URL.to_string()),
                env("DEEPRESEARCH_READER_MODEL").unwrap_or_else(|| DEFAULT_READER_MODEL.to_string()),
            )
        });

        Ok(Self {
            planner,
            limits: AgentLimits::from_env(),
            summary,
            summary_max_retries: env_parse("DEEPRESEARCH_SUMMARY_MAX_RETRIES", 1u32).max(1),
            reader,
            visit: VisitConfig::from_env(),
            search_provider: env("DEEPRESEARCH_SEARCH_PROVIDER")
                .unwrap_or_else(|| "auto".to_string())
                .to_ascii_lowercase(),
            python_bin: env("DEEPRESEARCH_PYTHON_BIN").unwrap_or_else(|| "python3".to_string()),
            python_timeout: Duration::from_millis(
                env_parse("DEEPRESEARCH_PYTHON_TIMEOUT_MS", 50_000u64).clamp(100, 600_000),
            ),
            file_root: env("DEEPRESEARCH_FILE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./eval_data/file_corpus")),
        })
    }
}

/// Load `KEY=VALUE` lines from `path` into the process environment without overriding
/// variables that are already set. Blank lines and `#` comments are skipped.
pub fn load_env_file(path: &std::path::Path) -> std::io::Result<usize> {
    let txt = std::fs::read_to_string(path)?;
    let mut n = 0usize;
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
            n += 1;
        }
    }
    Ok(n)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize tests that mutate them.
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) struct EnvGuard {
        k: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        pub(crate) fn set(k: &'static str, v: &str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::set_var(k, v);
            Self { k, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(v) = self.prev.take() {
                std::env::set_var(self.k, v);
            } else {
                std::env::remove_var(self.k);
            }
        }
    }

    #[test]
    fn limits_default_to_original_budgets() {
        let l = AgentLimits::default();
        assert_eq!(l.max_rounds, 15);
        assert_eq!(l.max_llm_calls, 100);
        assert_eq!(l.max_runtime, Duration::from_secs(9_000));
        assert_eq!(l.max_context_tokens, 110_592);
    }

    #[test]
    fn limits_read_env_and_ignore_garbage() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g1 = EnvGuard::set("DEEPRESEARCH_MAX_ROUNDS", "7");
        let _g2 = EnvGuard::set("DEEPRESEARCH_MAX_LLM_CALLS", "not-a-number");
        let l = AgentLimits::from_env();
        assert_eq!(l.max_rounds, 7);
        assert_eq!(l.max_llm_calls, 100);
    }

    #[test]
    fn empty_values_are_treated_as_unset() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g1 = EnvGuard::set("DEEPRESEARCH_SUMMARY_BASE_URL", "   ");
        let _g2 = EnvGuard::set("DEEPRESEARCH_PLANNER_MODEL", "");
        let cfg = AgentConfig::from_env().unwrap();
        assert!(cfg.summary.is_none());
        assert_eq!(cfg.planner.model, DEFAULT_PLANNER_MODEL);
    }

    #[test]
    fn reader_is_opt_in() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g1 = EnvGuard::set("DEEPRESEARCH_READER_ENABLED", "false");
        assert!(AgentConfig::from_env().unwrap().reader.is_none());
        let _g2 = EnvGuard::set("DEEPRESEARCH_READER_ENABLED", "true");
        let cfg = AgentConfig::from_env().unwrap();
        assert_eq!(cfg.reader.unwrap().model, DEFAULT_READER_MODEL);
    }

    #[test]
    fn env_file_does_not_override_process_env() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g = EnvGuard::set("DEEPRESEARCH_TEST_PRESET", "from-process");
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "# comment\nDEEPRESEARCH_TEST_PRESET=from-file\nDEEPRESEARCH_TEST_FRESH=\"new\"\n",
        )
        .unwrap();
        let n = load_env_file(tmp.path()).unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            std::env::var("DEEPRESEARCH_TEST_PRESET").unwrap(),
            "from-process"
        );
        assert_eq!(std::env::var("DEEPRESEARCH_TEST_FRESH").unwrap(), "new");
        std::env::remove_var("DEEPRESEARCH_TEST_FRESH");
    }
}
