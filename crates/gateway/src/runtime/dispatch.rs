//! Tool dispatch policy: usage caps, redundancy guard, mutation
//! bookkeeping, the critic gate, parallel execution, and result
//! classification. The loop delegates every `tool_calls` array here.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use futures_util::future::join_all;
use ghost_context::{shrink_tool_output, Summarize};
use ghost_domain::chat::{ChatPayload, Message, ToolCall};
use ghost_router::{PoolKind, Upstream};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::critic::{run_critic, CriticVerdict};

static EXIT_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"EXIT CODE:\s*(\d+)").unwrap());

/// Per-request, per-tool invocation caps.
fn max_uses(tool: &str) -> u32 {
    match tool {
        "deep_research" | "web_search" => 10,
        "execute" => 20,
        _ => 10,
    }
}

/// Sequential failures before the loop is forced to a final answer.
const FAILURE_LIMIT: u32 = 3;
/// Blocked duplicates before the loop is forced to stop.
const REDUNDANCY_LIMIT: u32 = 3;
/// Lines of code above which the critic reviews an `execute` call.
const CRITIC_LINE_THRESHOLD: usize = 10;

/// Stable fingerprint of one invocation: tool name + canonical argument
/// JSON (serde_json object keys are already sorted).
pub fn a_hash(tool: &str, args: &Value) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    let digest = Sha256::digest(format!("{tool}:{canonical}").as_bytes());
    hex::encode(digest)
}

/// Classify an `execute` result: the literal exit code when present,
/// otherwise inferred from error markers.
pub fn classify_exit_code(output: &str) -> i32 {
    if let Some(caps) = EXIT_CODE.captures(output) {
        if let Ok(code) = caps[1].parse() {
            return code;
        }
    }
    if output.contains("Error") || output.contains("Exception") || output.contains("Traceback") {
        1
    } else {
        0
    }
}

fn redundancy_hint(tool: &str) -> &'static str {
    match tool {
        "recall" => {
            "Semantic 'recall' cannot do exact string matching. To find an exact line, use \
             file_system 'search'."
        }
        "web_search" => "Try a different search query or use deep_research.",
        _ => "Change your strategy.",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-request state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable request-scoped bookkeeping shared between the loop and the
/// dispatcher. Lives and dies with one request; no locking needed.
#[derive(Default)]
pub struct TurnState {
    pub seen: HashSet<String>,
    pub usage: HashMap<String, u32>,
    pub redundancy_strikes: u32,
    pub execution_failures: u32,
    pub force_stop: bool,
    pub force_final_response: bool,
    pub last_was_failure: bool,
    pub forget_was_called: bool,
    pub raw_tools_called: HashSet<String>,
    /// Every tool-role message produced this request, in order.
    pub tools_run: Vec<Message>,
    /// Cached sandbox listing; invalidated by sandbox mutations.
    pub sandbox_listing: Option<String>,
    pub was_complex_task: bool,
}

impl TurnState {
    fn push_tool_msg(&mut self, messages: &mut Vec<Message>, msg: Message) {
        self.tools_run.push(msg.clone());
        messages.push(msg);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker summarizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `Summarize` over the worker pool, used by the context manager's
/// tool-output shrinking.
pub struct WorkerSummarizer<'a> {
    pub upstream: &'a dyn Upstream,
    pub model: String,
}

#[async_trait::async_trait]
impl Summarize for WorkerSummarizer<'_> {
    async fn summarize(&self, question: &str, output: &str) -> ghost_domain::Result<String> {
        let prompt = format!(
            "The user asked: '{question}'. Summarize this tool output. If it contains facts \
             relevant to the user, extract them. If it is a script error, state the root cause. \
             Output: {output}"
        );
        let mut payload = ChatPayload::new(self.model.clone(), vec![Message::user(prompt)]);
        payload.temperature = Some(0.0);
        payload.max_tokens = Some(300);
        let body = self.upstream.chat(payload, PoolKind::Worker, None).await?;
        Ok(Message::from_completion(&body).text().trim().to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn's tool calls: policy checks first, then parallel fan-out,
/// then shrinking and failure classification. Results are appended to
/// `messages` in call order.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_tool_calls(
    registry: &ghost_tools::ToolRegistry,
    upstream: &dyn Upstream,
    model: &str,
    turn: &mut TurnState,
    tool_calls: &[ToolCall],
    last_user: &str,
    thought: &str,
    messages: &mut Vec<Message>,
) {
    struct Scheduled {
        tool: std::sync::Arc<dyn ghost_tools::Tool>,
        call_id: String,
        name: String,
        args: Value,
    }
    let mut scheduled: Vec<Scheduled> = Vec::new();

    for call in tool_calls {
        let name = call.function.name.clone();
        turn.raw_tools_called.insert(name.clone());
        let count = turn.usage.entry(name.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        // ── Usage cap ─────────────────────────────────────────────
        if count > max_uses(&name) {
            tracing::warn!(tool = %name, "loop breaker: tool overuse halted");
            messages.push(Message::user(format!(
                "SYSTEM ALERT: Tool '{name}' used too many times in a row. It is now blocked. \
                 YOU MUST USE A DIFFERENT APPROACH OR STOP."
            )));
            turn.force_stop = true;
            break;
        }

        // ── Argument parsing ──────────────────────────────────────
        let raw_args = call.function.arguments.trim();
        let parsed: std::result::Result<Value, String> = if raw_args.is_empty() {
            Ok(Value::Object(Default::default()))
        } else {
            match serde_json::from_str::<Value>(raw_args) {
                Ok(v @ Value::Object(_)) => Ok(v),
                Ok(_) => Err("expected a JSON object".into()),
                Err(e) => Err(e.to_string()),
            }
        };
        let args = match parsed {
            Ok(v) => v,
            Err(detail) => {
                let msg = Message::tool_result(
                    &call.id,
                    &name,
                    format!("Error: Invalid JSON arguments - {detail}"),
                );
                turn.push_tool_msg(messages, msg);
                turn.last_was_failure = true;
                continue;
            }
        };

        // ── Forget bookkeeping ────────────────────────────────────
        if name == "knowledge_base"
            && args.get("action").and_then(|v| v.as_str()) == Some("forget")
        {
            turn.forget_was_called = true;
        }

        let Some(tool) = registry.get(&name) else {
            let msg =
                Message::tool_result(&call.id, &name, format!("Error: Unknown tool '{name}'"));
            turn.push_tool_msg(messages, msg);
            continue;
        };

        // ── Mutation bookkeeping ──────────────────────────────────
        let is_mutating = tool.mutates(&args);
        if is_mutating {
            // Previously-blocked reads become fresh again.
            turn.seen.clear();
            turn.sandbox_listing = None;
        }

        // ── Redundancy guard ──────────────────────────────────────
        let hash = a_hash(&name, &args);
        if turn.seen.contains(&hash) && !is_mutating && name != "system_utility" {
            turn.redundancy_strikes += 1;
            tracing::warn!(tool = %name, strikes = turn.redundancy_strikes, "blocked duplicate tool call");
            let msg = Message::tool_result(
                &call.id,
                &name,
                format!(
                    "SYSTEM MONITOR: ERROR - You already executed this exact tool call and it \
                     failed to progress the task. DO NOT REPEAT IT. {}",
                    redundancy_hint(&name)
                ),
            );
            turn.push_tool_msg(messages, msg);
            if turn.redundancy_strikes >= REDUNDANCY_LIMIT {
                messages.push(Message::user(
                    "SYSTEM ALERT: Loop Breaker engaged. You keep repeating the same call. \
                     Provide a final answer with what you have.",
                ));
                turn.force_stop = true;
            }
            continue;
        }
        turn.seen.insert(hash);

        // ── Critic gate for complex code ──────────────────────────
        let mut args = args;
        if name == "execute" && turn.execution_failures == 0 {
            let code = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
            if code.lines().count() > CRITIC_LINE_THRESHOLD {
                tracing::info!("reviewing complex code before execution");
                match run_critic(upstream, model, code, last_user).await {
                    CriticVerdict::Approved => {}
                    CriticVerdict::Revised { code, critique } => {
                        tracing::info!("code patched before execution");
                        args["content"] = Value::String(code);
                        messages.push(Message::user(format!(
                            "RED TEAM INTERVENTION: Your code was auto-corrected before \
                             execution.\nCritique: {critique}\nExecuting patched version."
                        )));
                    }
                    CriticVerdict::Blocked { critique } => {
                        let msg = Message::tool_result(
                            &call.id,
                            &name,
                            format!("RED TEAM BLOCK: {critique}. Rewrite the code."),
                        );
                        turn.push_tool_msg(messages, msg);
                        turn.last_was_failure = true;
                        continue;
                    }
                }
            }
        }

        scheduled.push(Scheduled {
            tool: tool.clone(),
            call_id: call.id.clone(),
            name,
            args,
        });
    }

    if scheduled.is_empty() {
        return;
    }

    // ── Parallel fan-out, results gathered in call order ──────────
    let results = join_all(
        scheduled
            .iter()
            .map(|item| item.tool.run(item.args.clone())),
    )
    .await;

    let summarizer = WorkerSummarizer {
        upstream,
        model: model.to_string(),
    };

    for (item, raw_result) in scheduled.iter().zip(results) {
        let result = raw_result.replace('\r', "");
        let condensed = item.tool.condensed();
        let result = shrink_tool_output(result, condensed, last_user, Some(&summarizer)).await;

        let msg = Message::tool_result(&item.call_id, &item.name, result.clone());
        turn.push_tool_msg(messages, msg);

        // ── Failure classification ────────────────────────────────
        if item.name == "execute" {
            let exit_code = classify_exit_code(&result);
            if exit_code != 0 {
                turn.execution_failures += 1;
                turn.last_was_failure = true;
                turn.sandbox_listing = None;
                tracing::warn!(
                    strike = turn.execution_failures,
                    "script execution failed"
                );
                messages.push(Message::user(format!(
                    "AUTO-DIAGNOSTIC: The script failed with an unexpected error. Try a \
                     different approach or fix the bug. Execution details: {result}"
                )));
                if turn.execution_failures >= FAILURE_LIMIT {
                    tracing::warn!("loop breaker: forcing final response");
                    messages.push(Message::user(
                        "SYSTEM ALERT: You have failed 3 times in a row. The task cannot be \
                         completed. Provide a final response explaining the situation.",
                    ));
                    turn.force_final_response = true;
                }
            } else {
                turn.execution_failures = 0;
                // A clean run usually is the answer; stop unless the user
                // also asked for learning/profile follow-ups.
                let request_context = format!("{last_user}{thought}").to_lowercase();
                let has_meta_intent = ["learn", "skill", "profile", "lesson", "playbook", "record", "save"]
                    .iter()
                    .any(|kw| request_context.contains(kw));
                if !has_meta_intent {
                    turn.force_stop = true;
                }
            }
        } else if result.starts_with("Error:") || result.starts_with("Critical Tool Error") {
            turn.execution_failures += 1;
            turn.last_was_failure = true;
            if !turn.force_stop {
                tracing::warn!(tool = %item.name, "tool reported an error");
                if turn.execution_failures >= FAILURE_LIMIT {
                    messages.push(Message::user(
                        "SYSTEM ALERT: You have failed 3 times in a row. Stop trying this \
                         approach and try something completely different.",
                    ));
                    turn.force_stop = true;
                }
            }
        } else {
            turn.execution_failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ghost_domain::chat::ToolDefinition;
    use ghost_router::ByteStream;
    use ghost_tools::{Tool, ToolRegistry};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct NullUpstream;

    #[async_trait]
    impl Upstream for NullUpstream {
        async fn chat(
            &self,
            _payload: ChatPayload,
            _class: PoolKind,
            _hint: Option<&str>,
        ) -> ghost_domain::Result<Value> {
            Err(ghost_domain::Error::UpstreamUnavailable)
        }
        async fn chat_stream(
            &self,
            _payload: ChatPayload,
            _class: PoolKind,
            _hint: Option<&str>,
        ) -> ghost_domain::Result<ByteStream> {
            Err(ghost_domain::Error::UpstreamUnavailable)
        }
        async fn embeddings(&self, _texts: Vec<String>) -> ghost_domain::Result<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
        fn has_pool(&self, _class: PoolKind) -> bool {
            false
        }
    }

    struct CountingTool {
        name: &'static str,
        runs: Arc<AtomicU32>,
        mutating: bool,
        output: String,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &'static str {
            self.name
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.into(),
                description: "test".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }
        }
        fn mutates(&self, _args: &Value) -> bool {
            self.mutating
        }
        fn condensed(&self) -> bool {
            true
        }
        async fn run(&self, _args: Value) -> String {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.output.clone()
        }
    }

    fn registry_with(tools: Vec<CountingTool>) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        for tool in tools {
            reg.register(Arc::new(tool));
        }
        reg
    }

    fn call(name: &str, args: &str, id: &str) -> ToolCall {
        ghost_domain::chat::ToolCall::new(name, args).with_id(id)
    }

    #[tokio::test]
    async fn duplicate_non_mutating_call_runs_once() {
        // A distinct fingerprint runs once between mutating boundaries.
        let runs = Arc::new(AtomicU32::new(0));
        let reg = registry_with(vec![CountingTool {
            name: "recall",
            runs: runs.clone(),
            mutating: false,
            output: "memories".into(),
        }]);
        let mut turn = TurnState::default();
        let mut messages = Vec::new();

        for i in 0..3 {
            dispatch_tool_calls(
                &reg,
                &NullUpstream,
                "m",
                &mut turn,
                &[call("recall", r#"{"query": "cats"}"#, &format!("c{i}"))],
                "user q",
                "",
                &mut messages,
            )
            .await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(turn.redundancy_strikes, 2);
        let blocked: Vec<_> = messages
            .iter()
            .filter(|m| m.text().contains("DO NOT REPEAT IT"))
            .collect();
        assert_eq!(blocked.len(), 2);
    }

    #[tokio::test]
    async fn three_redundancy_strikes_force_stop() {
        let runs = Arc::new(AtomicU32::new(0));
        let reg = registry_with(vec![CountingTool {
            name: "recall",
            runs: runs.clone(),
            mutating: false,
            output: "memories".into(),
        }]);
        let mut turn = TurnState::default();
        let mut messages = Vec::new();

        for i in 0..4 {
            dispatch_tool_calls(
                &reg,
                &NullUpstream,
                "m",
                &mut turn,
                &[call("recall", r#"{"query": "cats"}"#, &format!("c{i}"))],
                "q",
                "",
                &mut messages,
            )
            .await;
        }

        assert!(turn.force_stop);
        assert!(messages.iter().any(|m| m.text().contains("Loop Breaker")));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mutation_clears_the_seen_set() {
        let read_runs = Arc::new(AtomicU32::new(0));
        let write_runs = Arc::new(AtomicU32::new(0));
        let reg = registry_with(vec![
            CountingTool {
                name: "recall",
                runs: read_runs.clone(),
                mutating: false,
                output: "data".into(),
            },
            CountingTool {
                name: "update_profile",
                runs: write_runs.clone(),
                mutating: true,
                output: "SUCCESS".into(),
            },
        ]);
        let mut turn = TurnState::default();
        let mut messages = Vec::new();

        let read = call("recall", r#"{"query": "x"}"#, "c1");
        dispatch_tool_calls(&reg, &NullUpstream, "m", &mut turn, &[read.clone()], "q", "", &mut messages).await;
        dispatch_tool_calls(
            &reg,
            &NullUpstream,
            "m",
            &mut turn,
            &[call("update_profile", r#"{"category": "root", "key": "k", "value": "v"}"#, "c2")],
            "q",
            "",
            &mut messages,
        )
        .await;
        dispatch_tool_calls(&reg, &NullUpstream, "m", &mut turn, &[read], "q", "", &mut messages).await;

        // The read re-ran after the mutating boundary.
        assert_eq!(read_runs.load(Ordering::SeqCst), 2);
        assert_eq!(turn.redundancy_strikes, 0);
    }

    #[tokio::test]
    async fn usage_cap_stops_the_loop() {
        // Per-tool invocation caps hold for the whole request.
        let runs = Arc::new(AtomicU32::new(0));
        let reg = registry_with(vec![CountingTool {
            name: "web_search",
            runs: runs.clone(),
            mutating: false,
            output: "hits".into(),
        }]);
        let mut turn = TurnState::default();
        let mut messages = Vec::new();

        for i in 0..12 {
            dispatch_tool_calls(
                &reg,
                &NullUpstream,
                "m",
                &mut turn,
                &[call("web_search", &format!(r#"{{"query": "q{i}"}}"#), &format!("c{i}"))],
                "q",
                "",
                &mut messages,
            )
            .await;
            if turn.force_stop {
                break;
            }
        }

        assert!(turn.force_stop);
        assert!(runs.load(Ordering::SeqCst) <= 10);
        assert!(messages.iter().any(|m| m.text().contains("used too many times")));
    }

    #[tokio::test]
    async fn invalid_json_arguments_produce_tool_error() {
        let runs = Arc::new(AtomicU32::new(0));
        let reg = registry_with(vec![CountingTool {
            name: "recall",
            runs: runs.clone(),
            mutating: false,
            output: "x".into(),
        }]);
        let mut turn = TurnState::default();
        let mut messages = Vec::new();

        dispatch_tool_calls(
            &reg,
            &NullUpstream,
            "m",
            &mut turn,
            &[call("recall", "{broken json", "c1")],
            "q",
            "",
            &mut messages,
        )
        .await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(turn.last_was_failure);
        let msg = &messages[0];
        assert_eq!(msg.tool_call_id.as_deref(), Some("c1"));
        assert!(msg.text().starts_with("Error: Invalid JSON arguments"));
    }

    #[tokio::test]
    async fn execute_failure_streak_forces_final_response() {
        let runs = Arc::new(AtomicU32::new(0));
        let reg = registry_with(vec![CountingTool {
            name: "execute",
            runs: runs.clone(),
            mutating: true,
            output: "--- EXECUTION RESULT ---\nEXIT CODE: 1\nSTDOUT/STDERR:\nboom".into(),
        }]);
        let mut turn = TurnState::default();
        let mut messages = Vec::new();

        for i in 0..3 {
            dispatch_tool_calls(
                &reg,
                &NullUpstream,
                "m",
                &mut turn,
                &[call(
                    "execute",
                    &format!(r#"{{"filename": "f{i}.py", "content": "print({i})"}}"#),
                    &format!("c{i}"),
                )],
                "q",
                "",
                &mut messages,
            )
            .await;
        }

        assert_eq!(turn.execution_failures, 3);
        assert!(turn.force_final_response);
        assert!(messages.iter().any(|m| m.text().contains("cannot be completed")));
        assert!(messages.iter().any(|m| m.text().starts_with("AUTO-DIAGNOSTIC")));
    }

    #[tokio::test]
    async fn clean_execute_without_meta_intent_stops() {
        let runs = Arc::new(AtomicU32::new(0));
        let reg = registry_with(vec![CountingTool {
            name: "execute",
            runs: runs.clone(),
            mutating: true,
            output: "--- EXECUTION RESULT ---\nEXIT CODE: 0\nSTDOUT/STDERR:\n42".into(),
        }]);
        let mut turn = TurnState::default();
        let mut messages = Vec::new();

        dispatch_tool_calls(
            &reg,
            &NullUpstream,
            "m",
            &mut turn,
            &[call("execute", r#"{"filename": "f.py", "content": "print(42)"}"#, "c1")],
            "calculate the answer",
            "",
            &mut messages,
        )
        .await;

        assert!(turn.force_stop);
        assert_eq!(turn.execution_failures, 0);
    }

    #[test]
    fn exit_code_classification() {
        assert_eq!(classify_exit_code("--- EXECUTION RESULT ---\nEXIT CODE: 0\nok"), 0);
        assert_eq!(classify_exit_code("EXIT CODE: 7"), 7);
        assert_eq!(classify_exit_code("Traceback (most recent call last)"), 1);
        assert_eq!(classify_exit_code("all good"), 0);
    }

    #[test]
    fn a_hash_is_order_insensitive() {
        let a = serde_json::json!({"b": 2, "a": 1});
        let b = serde_json::json!({"a": 1, "b": 2});
        assert_eq!(a_hash("t", &a), a_hash("t", &b));
        assert_ne!(a_hash("t", &a), a_hash("u", &a));
    }
}
