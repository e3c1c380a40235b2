//! The `PythonInterpreter` tool: run a snippet in a bounded subprocess.
//!
//! - **Bounded**: wall-clock timeout (the child is killed) and capped output.
//! - **Isolated working dir**: each call runs in a fresh temp directory.
//! - **No env dumps**: only stdout/stderr are surfaced.

use crate::{Capability, Error, Result};
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;

const MAX_OUTPUT_CHARS: usize = 20_000;

pub struct PythonInterpreter {
    bin: String,
    timeout: Duration,
}

impl PythonInterpreter {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    pub async fn run(&self, code: &str) -> Result<String> {
        let dir = tempfile::tempdir().map_err(|e| Error::Tool(e.to_string()))?;
        let script = dir.path().join("snippet.py");
        tokio::fs::write(&script, code)
            .await
            .map_err(|e| Error::Tool(e.to_string()))?;

        let child = tokio::process::Command::new(&self.bin)
            .arg(&script)
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tool(format!("[Python] failed to start {}: {e}", self.bin)))?;

        let out = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(r) => r.map_err(|e| Error::Tool(e.to_string()))?,
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "python snippet timed out");
                return Err(Error::Tool(format!(
                    "[Python] Execution timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);
        let mut report = String::new();
        if !stdout.trim().is_empty() {
            report.push_str("stdout:\n");
            report.push_str(stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            if !report.is_empty() {
                report.push('\n');
            }
            report.push_str("stderr:\n");
            report.push_str(stderr.trim_end());
        }
        if report.is_empty() {
            report = if out.status.success() {
                "Finished execution.".to_string()
            } else {
                format!("Process exited with {}", out.status)
            };
        }
        Ok(clip(&report))
    }
}

fn clip(s: &str) -> String {
    let (mut out, truncated) = crate::extract::truncate_chars(s, MAX_OUTPUT_CHARS);
    if truncated {
        out.push_str("\n[output truncated]");
    }
    out
}

/// Code from `{"code": ...}` or a bare string, with markdown fences removed.
fn code_from_arguments(arguments: &Value) -> Option<String> {
    let raw = match arguments {
        Value::String(s) => s.as_str(),
        Value::Object(m) => m.get("code").and_then(Value::as_str)?,
        _ => return None,
    };
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```python")
        .or_else(|| trimmed.strip_prefix("```py"))
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed)
        .trim();
    (!body.is_empty()).then(|| body.to_string())
}

#[async_trait::async_trait]
impl Capability for PythonInterpreter {
    fn name(&self) -> &'static str {
        "PythonInterpreter"
    }

    fn description(&self) -> &'static str {
        "Execute Python code in a sandboxed subprocess and return its printed output. Use print() to see results."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "The Python code to execute."}
            },
            "required": ["code"]
        })
    }

    async fn call(&self, arguments: &Value) -> Result<String> {
        let code = code_from_arguments(arguments).ok_or_else(|| {
            Error::Tool("[Python] Invalid request format: provide Python source in 'code'".to_string())
        })?;
        self.run(&code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `sh` stands in for the interpreter so the tests do not depend on a Python install.
    fn shell(timeout_ms: u64) -> PythonInterpreter {
        PythonInterpreter::new("sh", Duration::from_millis(timeout_ms))
    }

    #[test]
    fn code_accepts_object_or_bare_string_and_strips_fences() {
        assert_eq!(
            code_from_arguments(&json!({"code": "```python\nprint(1)\n```"})).as_deref(),
            Some("print(1)")
        );
        assert_eq!(
            code_from_arguments(&json!("print(2)")).as_deref(),
            Some("print(2)")
        );
        assert!(code_from_arguments(&json!({"other": 1})).is_none());
        assert!(code_from_arguments(&json!({"code": "   "})).is_none());
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let out = shell(5_000)
            .call(&json!({"code": "echo hello; echo oops 1>&2"}))
            .await
            .unwrap();
        assert_eq!(out, "stdout:\nhello\nstderr:\noops");
    }

    #[tokio::test]
    async fn silent_success_reports_finished() {
        let out = shell(5_000).call(&json!("true")).await.unwrap();
        assert_eq!(out, "Finished execution.");
    }

    #[tokio::test]
    async fn slow_snippets_time_out() {
        let err = shell(200).call(&json!("sleep 5")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_tool_error() {
        let p = PythonInterpreter::new("definitely-not-a-python-binary", Duration::from_secs(1));
        let err = p.call(&json!("print(1)")).await.unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }
}
