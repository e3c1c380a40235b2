//! Prompt templates and the fixed strings the loop feeds back to the model.

use serde_json::Value;

pub const OBS_START: &str = "<tool_response>";
pub const OBS_END: &str = "\n</tool_response>";

pub const REPEAT_NOTICE: &str = "Repeated tool—synthesize existing info into answer.";
pub const TOOL_NUDGE: &str = "You have gathered sufficient information from tools. Synthesize all into a final <answer> now—do not call more tools.";
pub const DUMMY_NUDGE: &str =
    "Observation: This is a simple query. No tools needed—provide final answer now.";
pub const STRONG_NUDGE: &str =
    "End with <answer> your final response now—no more thinking or tools.";
pub const CONTEXT_LIMIT_NOTICE: &str =
    "You have now reached the maximum context length. Provide your final answer.";
pub const HISTORY_REPAIR_NOTICE: &str =
    "Observation: No new information from previous step. Proceed to think and answer.";
pub const MALFORMED_ARGS_NOTICE: &str =
    "[Notice] The tool arguments could not be parsed as JSON; the tool ran with empty arguments.";

pub const TIMEOUT_PREDICTION: &str = "No answer found after 2h30mins";
pub const FALLBACK_PREDICTION: &str =
    "Based on reasoning, the answer is a comprehensive summary of the query.";

pub fn unknown_tool(name: &str) -> String {
    format!("Error: Tool {name} not found")
}

pub fn wrap_observation(observation: &str) -> String {
    format!("{OBS_START}{observation}{OBS_END}")
}

/// One entry of the tool catalogue shown to the planner.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

const SYSTEM_PREAMBLE: &str = "You are a deep research assistant. Your core function is to conduct thorough, multi-source investigations into any topic. You must handle both broad, open-domain inquiries and queries within specialized academic fields. For every request, synthesize information from credible, diverse sources to deliver a comprehensive, accurate, and objective response. When you have gathered sufficient information and are ready to provide the definitive response, you must enclose the entire final answer within <answer></answer> tags.";

/// System prompt: role, tool catalogue, call format, then the current date.
pub fn system_prompt(tools: &[ToolSpec], today: &str) -> String {
    let mut out = String::new();
    out.push_str(SYSTEM_PREAMBLE);
    out.push_str("\n\n# Tools\n\nYou may call one or more functions to assist with the user query.\n\nYou are provided with function signatures within <tools></tools> XML tags:\n<tools>\n");
    for t in tools {
        let line = serde_json::json!({
            "type": "function",
            "function": {
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            }
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out.push_str("</tools>\n\nFor each function call, return a json object with function name and arguments within <tool_call></tool_call> XML tags:\n<tool_call>\n{\"name\": <function-name>, \"arguments\": <args-json-object>}\n</tool_call>\n\nCurrent date: ");
    out.push_str(today);
    out
}

pub fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

const EXTRACTOR_TEMPLATE: &str = r#"Please process the following webpage content and user goal to extract relevant information:

## **Webpage Content**
{webpage_content}

## **User Goal**
{goal}

## **Task Guidelines**
1. **Content Scanning for Rational**: Locate the **specific sections/data** directly related to the user's goal within the webpage content
2. **Key Extraction for Evidence**: Identify and extract the **most relevant information** from the content, you never miss any important information, output the **full original context** of the content as far as possible, it can be more than three paragraphs.
3. **Summary Output for Summary**: Organize into a concise paragraph with logical flow, prioritizing clarity and judge the contribution of the information to the goal.

**Final Output Format using JSON format has "rational", "evidence", "summary" feilds**
"#;

pub fn extractor_prompt(content: &str, goal: &str) -> String {
    // Substitute the goal first so page text containing "{goal}" is left alone.
    EXTRACTOR_TEMPLATE
        .replace("{goal}", goal)
        .replacen("{webpage_content}", content, 1)
}
