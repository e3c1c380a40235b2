//! The research loop: ask the planner, act on its directive, feed observations back, repeat.
//!
//! One [`Agent`] may serve many concurrent runs. Everything a run mutates (conversation,
//! budget, repeat/nudge trackers) lives on the stack of [`Agent::run`].

use crate::config::AgentLimits;
use crate::parser::{classify, extract_answer, extract_think, has_answer};
use crate::prompts::{
    system_prompt, today, wrap_observation, CONTEXT_LIMIT_NOTICE, DUMMY_NUDGE,
    FALLBACK_PREDICTION, MALFORMED_ARGS_NOTICE, REPEAT_NOTICE, STRONG_NUDGE, TIMEOUT_PREDICTION,
    TOOL_NUDGE,
};
use crate::registry::CapabilityRegistry;
use crate::{
    Completer, Conversation, Directive, ModelEndpoint, ResearchTask, RunResult, Termination,
    TokenEstimator,
};
use std::sync::Arc;
use std::time::Instant;

/// Per-run ceilings and counters.
struct RunBudget {
    rounds: u32,
    calls_remaining: u32,
    started: Instant,
}

impl RunBudget {
    fn new(limits: &AgentLimits) -> Self {
        Self {
            rounds: 0,
            calls_remaining: limits.max_llm_calls,
            started: Instant::now(),
        }
    }

    /// Spend one completion call. Returns false when none are left.
    fn take_call(&mut self) -> bool {
        if self.calls_remaining == 0 {
            return false;
        }
        self.calls_remaining -= 1;
        true
    }
}

#[derive(Default)]
struct LoopState {
    /// `(name, raw_arguments)` of the last dispatched call.
    last_call: Option<(String, String)>,
    dummy_rounds: u32,
    executed_tools: u32,
}

pub struct Agent {
    completer: Arc<dyn Completer>,
    registry: Arc<CapabilityRegistry>,
    estimator: Arc<dyn TokenEstimator>,
    limits: AgentLimits,
}

impl Agent {
    pub fn new(
        completer: Arc<dyn Completer>,
        registry: Arc<CapabilityRegistry>,
        estimator: Arc<dyn TokenEstimator>,
        limits: AgentLimits,
    ) -> Self {
        Self {
            completer,
            registry,
            estimator,
            limits,
        }
    }

    /// Drive one rollout to completion. Never fails; problems end up in the result.
    pub async fn run(&self, task: &ResearchTask, endpoint: &ModelEndpoint) -> RunResult {
        let limits = &self.limits;
        let prompt = system_prompt(&self.registry.catalogue(), &today());
        let mut conv = Conversation::new(prompt, task.question.clone());
        let mut budget = RunBudget::new(limits);
        let mut state = LoopState::default();
        let mut outcome: Option<(String, Termination)> = None;
        let mut error: Option<String> = None;

        tracing::info!(rollout = task.rollout_id, model = %endpoint.model, "research run started");

        while budget.rounds < limits.max_rounds && budget.calls_remaining > 0 {
            if budget.started.elapsed() >= limits.max_runtime {
                tracing::warn!(rollout = task.rollout_id, rounds = budget.rounds, "runtime ceiling reached");
                outcome = Some((TIMEOUT_PREDICTION.to_string(), Termination::Timeout));
                break;
            }
            if !budget.take_call() {
                break;
            }
            budget.rounds += 1;
            tracing::info!(
                rollout = task.rollout_id,
                round = budget.rounds,
                calls_left = budget.calls_remaining,
                "round"
            );

            let content = match self.completer.complete(endpoint, &mut conv).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(rollout = task.rollout_id, error = %e, "completion failed; ending run");
                    error = Some(e.to_string());
                    outcome = Some((salvage(&conv), Termination::CallsExhausted));
                    break;
                }
            };

            let directive = classify(&content);
            conv.push_assistant(content);
            match directive {
                Directive::Answer { text } => {
                    let prediction = if text.is_empty() { salvage(&conv) } else { text };
                    outcome = Some((prediction, Termination::Answer));
                    break;
                }
                Directive::ToolCall {
                    name,
                    arguments,
                    raw_arguments,
                    arguments_malformed,
                } => {
                    let key = (name, raw_arguments);
                    let observation = if state.last_call.as_ref() == Some(&key) {
                        tracing::info!(tool = %key.0, "identical tool call suppressed");
                        REPEAT_NOTICE.to_string()
                    } else {
                        let obs = self.registry.dispatch(&key.0, &arguments).await;
                        state.last_call = Some(key);
                        if arguments_malformed {
                            format!("{MALFORMED_ARGS_NOTICE}\n{obs}")
                        } else {
                            obs
                        }
                    };
                    state.executed_tools += 1;
                    conv.push_user(wrap_observation(&observation));
                    if state.executed_tools >= 2 {
                        conv.push_user(TOOL_NUDGE);
                    }
                }
                Directive::Plain { .. } => {
                    state.dummy_rounds += 1;
                    conv.push_user(DUMMY_NUDGE);
                    if state.dummy_rounds >= 2 {
                        conv.push_user(STRONG_NUDGE);
                    }
                }
            }

            let tokens = self.estimator.estimate(&conv);
            if tokens > limits.max_context_tokens {
                tracing::warn!(
                    rollout = task.rollout_id,
                    tokens,
                    max = limits.max_context_tokens,
                    "context ceiling exceeded; requesting final answer"
                );
                conv.replace_last_content(CONTEXT_LIMIT_NOTICE);
                let prediction = if budget.take_call() {
                    match self.completer.complete(endpoint, &mut conv).await {
                        Ok(c) => {
                            let prediction = extract_answer(&c).unwrap_or_else(|| c.clone());
                            conv.push_assistant(c);
                            if prediction.trim().is_empty() {
                                salvage(&conv)
                            } else {
                                prediction
                            }
                        }
                        Err(e) => {
                            tracing::error!(rollout = task.rollout_id, error = %e, "final completion failed");
                            error = Some(e.to_string());
                            salvage(&conv)
                        }
                    }
                } else {
                    salvage(&conv)
                };
                outcome = Some((prediction, Termination::TokenLimit));
                break;
            }
        }

        let (prediction, termination) = match outcome {
            Some(o) => o,
            None => post_loop_fallback(&conv, &budget, limits),
        };
        let llm_calls = limits.max_llm_calls - budget.calls_remaining;
        tracing::info!(
            rollout = task.rollout_id,
            termination = %termination,
            rounds = budget.rounds,
            llm_calls,
            "research run finished"
        );

        RunResult {
            question: task.question.clone(),
            answer: task.answer.clone().unwrap_or_default(),
            messages: conv.into_messages(),
            prediction,
            termination,
            rollout_id: task.rollout_id,
            rounds: budget.rounds,
            llm_calls,
            elapsed_ms: budget.started.elapsed().as_millis(),
            error,
        }
    }
}

/// Best available prediction from the transcript: an answer, else reasoning, else boilerplate.
fn salvage(conv: &Conversation) -> String {
    let Some(last) = conv.last_assistant() else {
        return FALLBACK_PREDICTION.to_string();
    };
    extract_answer(&last.content)
        .filter(|s| !s.is_empty())
        .or_else(|| extract_think(&last.content).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| FALLBACK_PREDICTION.to_string())
}

fn post_loop_fallback(
    conv: &Conversation,
    budget: &RunBudget,
    limits: &AgentLimits,
) -> (String, Termination) {
    if let Some(last) = conv.last_assistant() {
        if has_answer(&last.content) && extract_answer(&last.content).is_some() {
            return (salvage(conv), Termination::Answer);
        }
    }
    let reason = if budget.rounds >= limits.max_rounds {
        Termination::MaxRounds
    } else {
        Termination::CallsExhausted
    };
    (salvage(conv), reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::ByteEstimator;
    use crate::{Capability, Error, Message, Result, Role};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Completer that replays replies (repeating the last) and snapshots each conversation.
    struct ScriptedCompleter {
        replies: Mutex<VecDeque<Result<String>>>,
        last: Mutex<Option<String>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedCompleter {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                last: Mutex::new(None),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn replies(replies: &[&str]) -> Arc<Self> {
            Self::new(replies.iter().map(|s| Ok(s.to_string())).collect())
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Completer for ScriptedCompleter {
        async fn complete(
            &self,
            _endpoint: &ModelEndpoint,
            conversation: &mut Conversation,
        ) -> Result<String> {
            self.seen.lock().unwrap().push(conversation.messages().to_vec());
            let mut last = self.last.lock().unwrap();
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(s)) => {
                    *last = Some(s.clone());
                    Ok(s)
                }
                Some(Err(e)) => Err(e),
                None => last
                    .clone()
                    .ok_or_else(|| Error::Llm("no scripted reply".to_string())),
            }
        }
    }

    /// Counts invocations and echoes the arguments it received.
    #[derive(Default)]
    struct CountingSearch {
        calls: AtomicUsize,
        args: Mutex<Vec<Value>>,
    }

    #[async_trait::async_trait]
    impl Capability for CountingSearch {
        fn name(&self) -> &'static str {
            "search"
        }
        fn description(&self) -> &'static str {
            "test search"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn call(&self, arguments: &Value) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.args.lock().unwrap().push(arguments.clone());
            Ok(format!("results for {arguments}"))
        }
    }

    struct HugeEstimator;

    impl TokenEstimator for HugeEstimator {
        fn estimate(&self, _conversation: &Conversation) -> usize {
            usize::MAX
        }
    }

    fn limits() -> AgentLimits {
        AgentLimits {
            max_rounds: 15,
            max_llm_calls: 100,
            max_runtime: Duration::from_secs(600),
            max_context_tokens: 110_592,
        }
    }

    fn agent_with(
        completer: Arc<ScriptedCompleter>,
        tool: Arc<CountingSearch>,
        estimator: Arc<dyn TokenEstimator>,
        limits: AgentLimits,
    ) -> Agent {
        let registry = CapabilityRegistry::builder().with(tool).build().unwrap();
        Agent::new(completer, Arc::new(registry), estimator, limits)
    }

    fn agent(completer: Arc<ScriptedCompleter>, tool: Arc<CountingSearch>) -> Agent {
        agent_with(completer, tool, Arc::new(ByteEstimator), limits())
    }

    fn task(q: &str) -> ResearchTask {
        ResearchTask {
            question: q.to_string(),
            answer: Some("ref".to_string()),
            rollout_id: 3,
        }
    }

    fn endpoint() -> ModelEndpoint {
        ModelEndpoint::new("http://unused", "planner")
    }

    fn search_call(q: &str) -> String {
        format!("<think>need data</think>\n<tool_call>\n{{\"name\": \"search\", \"arguments\": {{\"query\": [\"{q}\"]}}}}\n</tool_call>")
    }

    fn count_content(messages: &[Message], needle: &str) -> usize {
        messages.iter().filter(|m| m.content == needle).count()
    }

    #[tokio::test]
    async fn first_round_answer_ends_the_run() {
        let completer = ScriptedCompleter::replies(&["<answer>xAI is an AI company.</answer>"]);
        let tool = Arc::new(CountingSearch::default());
        let r = agent(completer.clone(), tool.clone())
            .run(&task("What is xAI?"), &endpoint())
            .await;

        assert_eq!(r.prediction, "xAI is an AI company.");
        assert_eq!(r.termination, Termination::Answer);
        assert_eq!((r.rounds, r.llm_calls), (1, 1));
        assert_eq!(completer.calls(), 1);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(r.answer, "ref");
        assert_eq!(r.rollout_id, 3);
        assert_eq!(r.messages.len(), 3);
        assert_eq!(r.messages[2].role, Role::Assistant);
        assert!(r.error.is_none());
    }

    #[tokio::test]
    async fn blank_answer_falls_back_to_reasoning_or_boilerplate() {
        let completer = ScriptedCompleter::replies(&["<answer>   </answer>"]);
        let r = agent(completer, Arc::new(CountingSearch::default()))
            .run(&task("What is xAI?"), &endpoint())
            .await;
        assert_eq!(r.termination, Termination::Answer);
        assert_eq!(r.prediction, FALLBACK_PREDICTION);

        let completer =
            ScriptedCompleter::replies(&["<think>probably a company</think><answer></answer>"]);
        let r = agent(completer, Arc::new(CountingSearch::default()))
            .run(&task("What is xAI?"), &endpoint())
            .await;
        assert_eq!(r.termination, Termination::Answer);
        assert_eq!(r.prediction, "probably a company");
    }

    #[tokio::test]
    async fn search_then_answer_without_synthesis_nudge() {
        let completer = ScriptedCompleter::replies(&[
            &search_call("xai founders"),
            "<think>enough</think><answer>Founded in 2023.</answer>",
        ]);
        let tool = Arc::new(CountingSearch::default());
        let r = agent(completer.clone(), tool.clone())
            .run(&task("Who founded xAI?"), &endpoint())
            .await;

        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.prediction, "Founded in 2023.");
        assert_eq!(r.termination, Termination::Answer);
        assert_eq!(count_content(&r.messages, TOOL_NUDGE), 0);
        assert!(r.messages[3].content.starts_with("<tool_response>results for"));
        assert!(r.messages[3].content.ends_with("\n</tool_response>"));
    }

    #[tokio::test]
    async fn identical_consecutive_calls_are_not_dispatched_twice() {
        let call = search_call("same");
        let completer = ScriptedCompleter::replies(&[&call, &call, "<answer>done</answer>"]);
        let tool = Arc::new(CountingSearch::default());
        let r = agent(completer, tool.clone()).run(&task("q"), &endpoint()).await;

        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            count_content(&r.messages, &wrap_observation(REPEAT_NOTICE)),
            1
        );
        assert_eq!(r.prediction, "done");
    }

    #[tokio::test]
    async fn synthesis_nudge_appears_once_executed_count_reaches_two() {
        let completer = ScriptedCompleter::replies(&[
            &search_call("a"),
            &search_call("b"),
            "<answer>ok</answer>",
        ]);
        let tool = Arc::new(CountingSearch::default());
        let r = agent(completer.clone(), tool).run(&task("q"), &endpoint()).await;

        let seen = completer.seen.lock().unwrap();
        assert_eq!(count_content(&seen[1], TOOL_NUDGE), 0);
        assert_eq!(count_content(&seen[2], TOOL_NUDGE), 1);
        assert_eq!(seen[2].last().map(|m| m.content.as_str()), Some(TOOL_NUDGE));
        assert_eq!(count_content(&r.messages, TOOL_NUDGE), 1);
    }

    #[tokio::test]
    async fn directive_less_model_hits_max_rounds_with_fallback_prediction() {
        let completer = ScriptedCompleter::replies(&["<think>pondering the sky</think>still thinking"]);
        let tool = Arc::new(CountingSearch::default());
        let r = agent_with(
            completer.clone(),
            tool,
            Arc::new(ByteEstimator),
            AgentLimits {
                max_rounds: 4,
                ..limits()
            },
        )
        .run(&task("q"), &endpoint())
        .await;

        assert_eq!(r.termination, Termination::MaxRounds);
        assert_eq!(r.rounds, 4);
        assert_eq!(completer.calls(), 4);
        assert_eq!(r.prediction, "pondering the sky");
        assert_eq!(count_content(&r.messages, DUMMY_NUDGE), 4);
        assert_eq!(count_content(&r.messages, STRONG_NUDGE), 3);
    }

    #[tokio::test]
    async fn plain_text_without_think_uses_generic_fallback() {
        let completer = ScriptedCompleter::replies(&["hmm"]);
        let r = agent_with(
            completer,
            Arc::new(CountingSearch::default()),
            Arc::new(ByteEstimator),
            AgentLimits {
                max_rounds: 2,
                ..limits()
            },
        )
        .run(&task("q"), &endpoint())
        .await;
        assert_eq!(r.prediction, FALLBACK_PREDICTION);
        assert_eq!(r.termination, Termination::MaxRounds);
    }

    #[tokio::test]
    async fn call_budget_bounds_the_run() {
        let completer = ScriptedCompleter::replies(&["plain"]);
        let r = agent_with(
            completer.clone(),
            Arc::new(CountingSearch::default()),
            Arc::new(ByteEstimator),
            AgentLimits {
                max_rounds: 10,
                max_llm_calls: 3,
                ..limits()
            },
        )
        .run(&task("q"), &endpoint())
        .await;
        assert_eq!(completer.calls(), 3);
        assert_eq!(r.llm_calls, 3);
        assert!(r.rounds <= 10);
        assert_eq!(r.termination, Termination::CallsExhausted);
        assert!(!r.prediction.is_empty());
    }

    #[tokio::test]
    async fn context_breach_makes_exactly_one_more_call() {
        let completer = ScriptedCompleter::replies(&[
            &search_call("big"),
            "<answer>final under pressure</answer>",
        ]);
        let tool = Arc::new(CountingSearch::default());
        let r = agent_with(completer.clone(), tool, Arc::new(HugeEstimator), limits())
            .run(&task("q"), &endpoint())
            .await;

        assert_eq!(completer.calls(), 2);
        assert_eq!(r.termination, Termination::TokenLimit);
        assert_eq!(r.prediction, "final under pressure");
        assert_eq!(r.rounds, 1);
        assert_eq!(r.llm_calls, 2);
        let seen = completer.seen.lock().unwrap();
        assert_eq!(
            seen[1].last().map(|m| m.content.as_str()),
            Some(CONTEXT_LIMIT_NOTICE)
        );
    }

    #[tokio::test]
    async fn context_breach_without_calls_left_skips_the_extra_call() {
        let completer = ScriptedCompleter::replies(&["<think>partial</think>"]);
        let r = agent_with(
            completer.clone(),
            Arc::new(CountingSearch::default()),
            Arc::new(HugeEstimator),
            AgentLimits {
                max_llm_calls: 1,
                ..limits()
            },
        )
        .run(&task("q"), &endpoint())
        .await;
        assert_eq!(completer.calls(), 1);
        assert_eq!(r.termination, Termination::TokenLimit);
        assert_eq!(r.prediction, "partial");
    }

    #[tokio::test]
    async fn completion_failure_ends_run_with_error_recorded() {
        let completer = ScriptedCompleter::new(vec![
            Ok(search_call("x")),
            Err(Error::Completion {
                attempts: 10,
                last: "connection refused".to_string(),
            }),
        ]);
        let r = agent(completer, Arc::new(CountingSearch::default()))
            .run(&task("q"), &endpoint())
            .await;
        assert_eq!(r.termination, Termination::CallsExhausted);
        assert_eq!(r.prediction, "need data");
        assert!(r.error.as_deref().unwrap_or("").contains("connection refused"));
    }

    #[tokio::test]
    async fn zero_runtime_times_out_before_any_call() {
        let completer = ScriptedCompleter::replies(&["<answer>never</answer>"]);
        let r = agent_with(
            completer.clone(),
            Arc::new(CountingSearch::default()),
            Arc::new(ByteEstimator),
            AgentLimits {
                max_runtime: Duration::ZERO,
                ..limits()
            },
        )
        .run(&task("q"), &endpoint())
        .await;
        assert_eq!(completer.calls(), 0);
        assert_eq!(r.termination, Termination::Timeout);
        assert_eq!(r.prediction, TIMEOUT_PREDICTION);
    }

    #[tokio::test]
    async fn malformed_arguments_run_with_empty_object_and_notice() {
        let completer = ScriptedCompleter::replies(&[
            "<tool_call>{\"name\": \"search\", \"arguments\": {query: broken}}</tool_call>",
            "<answer>a</answer>",
        ]);
        let tool = Arc::new(CountingSearch::default());
        let r = agent(completer, tool.clone()).run(&task("q"), &endpoint()).await;
        assert_eq!(tool.args.lock().unwrap().as_slice(), &[json!({})]);
        assert!(r.messages[3]
            .content
            .starts_with(&format!("<tool_response>{MALFORMED_ARGS_NOTICE}\n")));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_observation() {
        let completer = ScriptedCompleter::replies(&[
            "<tool_call>{\"name\": \"teleport\", \"arguments\": {}}</tool_call>",
            "<answer>a</answer>",
        ]);
        let r = agent(completer, Arc::new(CountingSearch::default()))
            .run(&task("q"), &endpoint())
            .await;
        assert_eq!(
            r.messages[3].content,
            wrap_observation("Error: Tool teleport not found")
        );
    }

    #[tokio::test]
    async fn system_prompt_lists_registered_tools() {
        let completer = ScriptedCompleter::replies(&["<answer>a</answer>"]);
        let r = agent(completer, Arc::new(CountingSearch::default()))
            .run(&task("q"), &endpoint())
            .await;
        assert_eq!(r.messages[0].role, Role::System);
        assert!(r.messages[0].content.contains("\"name\":\"search\""));
        assert_eq!(r.messages[1].content, "q");
    }

    #[tokio::test]
    async fn loop_state_does_not_leak_between_runs() {
        let call = search_call("shared");
        let completer = ScriptedCompleter::replies(&[&call, "<answer>x</answer>", &call, "<answer>y</answer>"]);
        let tool = Arc::new(CountingSearch::default());
        let agent = agent(completer, tool.clone());
        let a = agent.run(&task("one"), &endpoint()).await;
        let b = agent.run(&task("two"), &endpoint()).await;
        // The second run's first call is not a repeat of the first run's last call.
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
        assert_eq!((a.prediction.as_str(), b.prediction.as_str()), ("x", "y"));
    }
}
