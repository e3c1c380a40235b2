//! Classify free-form model output into a [`Directive`].
//!
//! Priority: a complete `<answer>…</answer>` span, then a `<tool_call>` block, else plain text.
//! Nothing here can fail; malformed input degrades to `Plain` or to a tool call whose
//! arguments are `{}` with `arguments_malformed` set.

use crate::Directive;
use regex::Regex;
use std::sync::OnceLock;

const ANSWER_OPEN: &str = "<answer>";
const ANSWER_CLOSE: &str = "</answer>";

fn tool_call_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)<tool_call>\s*\{\s*"name"\s*:\s*"(\w+)"\s*,\s*"arguments"\s*:\s*(\{.*?\})\s*\}\s*</tool_call>"#,
        )
        .ok()
    })
    .as_ref()
}

fn think_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").ok())
        .as_ref()
}

/// Text between the first `<answer>` and the following `</answer>`, trimmed.
pub fn extract_answer(text: &str) -> Option<String> {
    let start = text.find(ANSWER_OPEN)? + ANSWER_OPEN.len();
    let rest = &text[start..];
    let end = rest.find(ANSWER_CLOSE)?;
    Some(rest[..end].trim().to_string())
}

pub fn has_answer(text: &str) -> bool {
    text.contains(ANSWER_OPEN) && text.contains(ANSWER_CLOSE)
}

/// Content of the first `<think>` block, trimmed.
pub fn extract_think(text: &str) -> Option<String> {
    think_re()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Tool arguments as a JSON object. Models often emit JSON5 (single quotes, trailing
/// commas, bare keys), so that is accepted too.
fn parse_arguments(raw: &str) -> Option<serde_json::Value> {
    let value = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .or_else(|| json5::from_str::<serde_json::Value>(raw).ok())?;
    value.is_object().then_some(value)
}

pub fn classify(text: &str) -> Directive {
    if let Some(answer) = extract_answer(text) {
        return Directive::Answer { text: answer };
    }
    if let Some(caps) = tool_call_re().and_then(|re| re.captures(text)) {
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let raw = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let (arguments, malformed) = match parse_arguments(raw) {
            Some(v) => (v, false),
            None => (serde_json::json!({}), true),
        };
        return Directive::ToolCall {
            name: name.to_string(),
            arguments,
            raw_arguments: raw.to_string(),
            arguments_malformed: malformed,
        };
    }
    Directive::Plain {
        text: text.to_string(),
    }
}
