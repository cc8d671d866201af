//! The reasoning loop: intake, intent classification, planner → responder
//! → tool turns, termination, and final-response synthesis.

use chrono::{Local, Utc};
use ghost_context::{
    emergency_prune, extract_json, heal_tool_call_syntax, prune, rolling_window, scrub,
};
use ghost_domain::chat::{ChatPayload, Message, ResponseFormat, Role};
use ghost_planning::TaskTree;
use ghost_router::PoolKind;
use serde_json::Value;
use tokio::sync::mpsc;

use super::background::{run_post_mortem, run_smart_memory};
use super::dispatch::{dispatch_tool_calls, TurnState};
use super::intent::Intent;
use crate::prompts::{CODE_SYSTEM_PROMPT, DBA_SYSTEM_PROMPT, PLANNING_SYSTEM_PROMPT, SYSTEM_PROMPT};
use crate::state::AppState;

/// Hard turn ceiling per request.
const MAX_TURNS: usize = 20;
/// Incoming histories are capped at this many non-system messages.
const HISTORY_CAP: usize = 500;
/// Messages included in the planner's transcript summary.
const TRANSCRIPT_WINDOW: usize = 40;
/// Characters of each message shown in the transcript summary.
const TRANSCRIPT_MSG_CAP: usize = 500;
/// Characters of scratchpad/sandbox state shown to the planner.
const PLANNER_STATE_CAP: usize = 1500;
/// Per-tool-output cap in the planner's context.
const PLANNER_TOOL_CAP: usize = 4000;

const META_KEYWORDS: &[&str] = &["learn", "skill", "profile", "lesson", "playbook", "record", "save"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of one request through the loop.
pub enum ChatOutcome {
    Complete {
        content: String,
        created: i64,
        req_id: String,
    },
    /// Raw SSE bytes forwarded from the upstream; ownership of the stream
    /// is transferred to the response writer.
    Stream {
        rx: mpsc::Receiver<Vec<u8>>,
        created: i64,
        req_id: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn cap_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n...[TRUNCATED]", &text[..cut])
}

fn has_meta_intent(text: &str) -> bool {
    let lc = text.to_lowercase();
    META_KEYWORDS.iter().any(|kw| lc.contains(kw))
}

/// Compact role-tagged transcript of the recent conversation, fed to the
/// planner and the smart-memory extractor.
fn recent_transcript(messages: &[Message], window: usize) -> String {
    let mut out = String::new();
    let tail: Vec<&Message> = messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant | Role::Tool))
        .collect();
    let start = tail.len().saturating_sub(window);
    for msg in &tail[start..] {
        let role = match msg.role {
            Role::User => "USER".to_string(),
            Role::Assistant => "AI".to_string(),
            Role::Tool => format!("TOOL ({})", msg.name.as_deref().unwrap_or("unknown")),
            Role::System => continue,
        };
        let content: String = msg.text().chars().take(TRANSCRIPT_MSG_CAP).collect();
        out.push_str(&format!("{role}: {content}\n"));
    }
    out
}

/// Render the last tool outputs for the planner's situation block.
fn planning_tool_context(tools_run: &[Message]) -> String {
    if tools_run.is_empty() {
        return "None (Start of Task)".into();
    }
    let start = tools_run.len().saturating_sub(2);
    tools_run[start..]
        .iter()
        .map(|msg| {
            let name = msg.name.as_deref().unwrap_or("unknown");
            let content = msg.text();
            let body = if content.len() > PLANNER_TOOL_CAP {
                let mut cut = PLANNER_TOOL_CAP;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!(
                    "{}\n\n... [TRUNCATED: Tool output too long. Showing top results only.]",
                    &content[..cut]
                )
            } else {
                content.to_string()
            };
            format!("Tool [{name}]: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn tool_hint(name: &str) -> &'static str {
    match name {
        "system_utility" => "weather, time, health",
        "execute" => "python, bash",
        "postgres_admin" => "sql",
        _ => "native tool",
    }
}

/// One planner step's parsed output.
#[derive(Default)]
struct PlanStep {
    thought: String,
    next_action_id: String,
    required_tool: String,
}

/// Pull a clean STDOUT preview out of the last tool result for the
/// no-draft fallback response.
fn synthesize_fallback(last_tool_output: &str) -> String {
    let mut out = last_tool_output.to_string();
    if let Some(pos) = out.find("STDOUT/STDERR:") {
        out = out[pos + "STDOUT/STDERR:".len()..].trim().to_string();
        if let Some(pos) = out.find("DIAGNOSTIC HINT") {
            out = out[..pos].trim().trim_matches('-').trim().to_string();
        }
    }
    let preview = if out.len() > 2000 {
        let mut cut = 2000;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}\n...[Truncated]", &out[..cut])
    } else {
        out
    };
    format!("Process finished successfully.\n\n### Final Output:\n```text\n{preview}\n```")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drive one chat request through the loop. `background_enabled` is false
/// for scheduler-synthesized requests so jobs cannot chain background
/// work.
pub async fn handle_chat(
    state: AppState,
    body: Value,
    request_id: Option<String>,
    background_enabled: bool,
) -> ChatOutcome {
    let req_id =
        request_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());
    let created = Utc::now().timestamp();

    let _permit = state
        .agent_semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("agent semaphore closed");

    tracing::info!(request_id = %req_id, "request initialized");

    // ── Intake ────────────────────────────────────────────────────────
    let mut messages: Vec<Message> = body
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| serde_json::from_value(m.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(&state.config.model)
        .to_string();
    let stream_requested = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    if messages.len() > HISTORY_CAP {
        let system_msgs: Vec<Message> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let tail: Vec<Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .rev()
            .take(HISTORY_CAP)
            .cloned()
            .collect();
        messages = system_msgs;
        messages.extend(tail.into_iter().rev());
    }
    for msg in &mut messages {
        let text = msg.text();
        if text.contains('\r') {
            let cleaned = text.replace('\r', "");
            msg.set_text(cleaned);
        }
    }

    let last_user_content = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.text().to_string())
        .unwrap_or_default();
    let lc = last_user_content.to_lowercase();

    // ── Intent classification ─────────────────────────────────────────
    let intent = Intent::classify(&last_user_content);

    // ── Prompt assembly ───────────────────────────────────────────────
    let profile_for_ctx = state.profile.clone();
    let profile_context = tokio::task::spawn_blocking(move || profile_for_ctx.context_string())
        .await
        .unwrap_or_default()
        .replace('\r', "");

    let base_prompt = SYSTEM_PROMPT.replace("{{PROFILE}}", &profile_context);
    match messages.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => system.set_text(base_prompt),
        None => messages.insert(0, Message::system(base_prompt)),
    }

    let mut current_temp = state.config.temperature;
    let active_persona = if intent.has_dba_intent && !intent.is_meta_task {
        current_temp = 0.15;
        tracing::info!("DBA specialist activated");
        format!(
            "### SPECIALIST SUBSYSTEM ACTIVATED\n{}\n\n",
            DBA_SYSTEM_PROMPT.replace("{{PROFILE}}", &profile_context)
        )
    } else if intent.has_coding_intent {
        current_temp = 0.2;
        tracing::info!("coding specialist activated");
        format!(
            "### SPECIALIST SUBSYSTEM ACTIVATED\n{}\n\n",
            CODE_SYSTEM_PROMPT.replace("{{PROFILE}}", &profile_context)
        )
    } else {
        String::new()
    };

    // Task listing requests get the real data injected up front; the
    // model must echo it rather than hallucinate a list.
    if lc.contains("task")
        && (lc.contains("list") || lc.contains("show") || lc.contains("what") || lc.contains("status"))
    {
        use ghost_tools::TaskScheduler;
        let handle = super::scheduler::SchedulerHandle(state.scheduler.clone());
        if let Ok(listing) = handle.list().await {
            messages.push(Message::system(format!(
                "SYSTEM DATA DUMP:\n{listing}\n\nINSTRUCTION: The user cannot see the data \
                 above. You MUST copy the task list into your **FINAL ANSWER** now."
            )));
        }
    }

    // ── Memory context ────────────────────────────────────────────────
    let mut fetched_mem_context = String::new();
    if !last_user_content.is_empty() && intent.should_fetch_memory(&last_user_content) {
        match state.memory.search(&last_user_content).await {
            Ok(context) if !context.trim().is_empty() => {
                tracing::info!("memory context retrieved");
                fetched_mem_context =
                    format!("### MEMORY CONTEXT:\n{}\n\n", context.replace('\r', ""));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "memory fetch failed"),
        }
    }

    messages = rolling_window(&messages, state.config.max_context, state.estimator.as_ref());

    // ── Turn loop ─────────────────────────────────────────────────────
    let mut turn_state = TurnState::default();
    let mut task_tree = TaskTree::new();
    let mut current_plan_json = Value::Null;
    let mut plan = PlanStep::default();
    let mut final_content = String::new();
    let mut planner_hint_injected = false;

    let responder_class = if intent.has_coding_intent {
        PoolKind::Coding
    } else {
        PoolKind::Main
    };

    for turn in 0..MAX_TURNS {
        if turn > 2 {
            turn_state.was_complex_task = true;
        }
        if turn_state.force_stop {
            break;
        }

        let scratch_data = state.scratchpad.list_all();
        let sandbox_state = if intent.has_coding_intent {
            match &turn_state.sandbox_listing {
                Some(cached) => cached.clone(),
                None => {
                    let listing = match state.registry.get("file_system") {
                        Some(tool) => {
                            tool.run(serde_json::json!({"operation": "list_files", "path": "."}))
                                .await
                        }
                        None => "N/A".into(),
                    };
                    turn_state.sandbox_listing = Some(listing.clone());
                    listing
                }
            }
        } else {
            "N/A".into()
        };

        // ── Planner call ──────────────────────────────────────────────
        let use_plan = state.config.use_planning;
        if use_plan {
            tracing::info!(turn = turn + 1, "strategic analysis");

            let available_tools: Vec<String> = state
                .registry
                .definitions()
                .iter()
                .map(|d| format!("{} ({})", d.name, tool_hint(&d.name)))
                .collect();

            let planner_transient = format!(
                "### CURRENT SITUATION\nSCRAPBOOK:\n{}\nSANDBOX STATE:\n{}\n\nUser Request: {}\n\
                 Last Tool Output: {}\n\n### AVAILABLE NATIVE TOOLS\n[{}]\nCRITICAL INSTRUCTION: \
                 If an action requires a tool, explicitly name the native JSON tool you intend \
                 to use. DO NOT plan to write scripts for tasks that have a dedicated native \
                 tool. If the user is just asking a question or requesting a code/SQL \
                 explanation, set \"next_action_id\" to \"none\" and do NOT plan to use a \
                 tool.\n\n### TEMPORAL ANCHOR (READ CAREFULLY)\nYou are currently at TURN {}. \
                 Trust your CURRENT PLAN JSON to know what is already DONE. NEVER revert a \
                 'DONE' task back to 'PENDING'.\n\n### CURRENT PLAN (JSON)\n{}",
                cap_chars(&scratch_data, PLANNER_STATE_CAP),
                if intent.has_coding_intent {
                    cap_chars(&sandbox_state, PLANNER_STATE_CAP)
                } else {
                    "N/A".into()
                },
                last_user_content,
                planning_tool_context(&turn_state.tools_run),
                available_tools.join(", "),
                turn + 1,
                if current_plan_json.is_null() {
                    "No plan yet.".to_string()
                } else {
                    serde_json::to_string_pretty(&current_plan_json).unwrap_or_default()
                },
            );

            let mut planner_payload = ChatPayload::new(
                model.clone(),
                vec![
                    Message::system(PLANNING_SYSTEM_PROMPT),
                    Message::user(format!(
                        "### RECENT CONVERSATION:\n{}",
                        recent_transcript(&messages, TRANSCRIPT_WINDOW)
                    )),
                    Message::system(planner_transient.trim().to_string()),
                ],
            );
            planner_payload.temperature = Some(0.0);
            planner_payload.top_p = Some(0.1);
            planner_payload.max_tokens = Some(1024);
            planner_payload.response_format = Some(ResponseFormat::json_object());

            let planner_result = state
                .upstream
                .chat(planner_payload, PoolKind::Planner, None)
                .await
                .map(|body| extract_json(Message::from_completion(&body).text()));

            match planner_result {
                Ok(Some(plan_json)) => {
                    plan = PlanStep {
                        thought: plan_json
                            .get("thought")
                            .and_then(|v| v.as_str())
                            .unwrap_or("No thought provided.")
                            .to_string(),
                        next_action_id: plan_json
                            .get("next_action_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        required_tool: plan_json
                            .get("required_tool")
                            .and_then(|v| v.as_str())
                            .unwrap_or("all")
                            .to_string(),
                    };

                    if let Some(tree_update) = plan_json.get("tree_update") {
                        if tree_update.is_object() {
                            task_tree.merge(tree_update);
                            current_plan_json = task_tree.to_json();
                        }
                    }

                    // Thought text is logged, never appended to history.
                    tracing::info!(thought = %plan.thought, focus = %plan.next_action_id, "plan updated");

                    if task_tree.root_done() && turn > 0 {
                        tracing::info!("planner signaled completion");
                        turn_state.force_stop = true;
                    }
                }
                other => {
                    // Planner failures are swallowed: malformed JSON and
                    // transport errors both degrade to a tool-use hint.
                    match other {
                        Err(e) => tracing::error!(error = %e, "planning step failed"),
                        _ => tracing::error!("planner returned malformed JSON"),
                    }
                    if !planner_hint_injected {
                        planner_hint_injected = true;
                        messages.push(Message::user(
                            "### ACTIVE STRATEGY: Proceed directly to using a tool. Do NOT \
                             provide any conversational response this turn, only output a \
                             tool_calls array!",
                        ));
                    }
                }
            }
        }

        // ── Temperature escalation ────────────────────────────────────
        let mut active_temp = if turn_state.last_was_failure {
            let escalated = match turn_state.execution_failures {
                1 => current_temp.max(0.40),
                n if n >= 2 => current_temp.max(0.60),
                _ => (current_temp + 0.1).min(0.80),
            };
            tracing::info!(temp = escalated, "adjusting variance to recover from failure");
            escalated
        } else {
            current_temp
        };
        if intent.is_conversational && active_temp < 0.7 {
            active_temp = 0.7;
        }

        // Defensive prune before every upstream call.
        messages = prune(&messages, state.config.max_context, state.estimator.as_ref());

        // ── Skill recall ──────────────────────────────────────────────
        let skill_query = if use_plan
            && !plan.required_tool.is_empty()
            && plan.required_tool != "none"
            && plan.required_tool != "all"
        {
            format!("Tool: {} - Context: {}", plan.required_tool, plan.thought)
        } else {
            last_user_content.clone()
        };
        let mut fetched_playbook = String::new();
        match state.memory.search_scored(&skill_query, 5, Some("skill")).await {
            Ok(hits) => {
                let lessons: Vec<String> = hits
                    .into_iter()
                    .filter(|h| h.score < 0.65)
                    .map(|h| h.text)
                    .collect();
                if !lessons.is_empty() {
                    let mut block =
                        String::from("## RELEVANT LESSONS LEARNED (Follow these to avoid repeats):\n");
                    for (i, lesson) in lessons.iter().enumerate() {
                        block.push_str(&format!("{}. {lesson}\n", i + 1));
                    }
                    fetched_playbook = format!("### SKILL PLAYBOOK:\n{block}\n\n");
                }
            }
            Err(_) => {
                let recent = state.playbook.recent_context();
                if !recent.is_empty() {
                    fetched_playbook = format!("### SKILL PLAYBOOK:\n{recent}\n\n");
                }
            }
        }

        // ── Transient injection ───────────────────────────────────────
        let mut dynamic_state = format!(
            "### DYNAMIC SYSTEM STATE\nCURRENT TIME: {}\n\nSCRAPBOOK:\n{scratch_data}\n\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        if intent.has_coding_intent {
            dynamic_state.push_str(&format!("CURRENT SANDBOX STATE:\n{sandbox_state}\n\n"));
        }
        if use_plan && !plan.thought.is_empty() {
            dynamic_state.push_str(&format!(
                "ACTIVE STRATEGY & PLAN:\nTHOUGHT: {}\nPLAN:\n{}\nFOCUS TASK: {}\n",
                plan.thought,
                task_tree.render(),
                plan.next_action_id
            ));
            if plan.next_action_id.trim().eq_ignore_ascii_case("none") {
                dynamic_state.push_str(
                    "CRITICAL INSTRUCTION: DO NOT USE TOOLS this turn. Answer the user directly \
                     using insights from your THOUGHT.\n",
                );
                turn_state.force_final_response = true;
            } else {
                dynamic_state.push_str(
                    "CRITICAL INSTRUCTION: Execute ONLY the tool required for the FOCUS TASK. \
                     DO NOT HALLUCINATE TOOL OUTPUTS.\n",
                );
            }
        }

        // The historical prefix stays byte-stable for the upstream KV
        // cache; everything volatile rides in one trailing system message.
        let transient_injection = format!(
            "{active_persona}{fetched_playbook}{fetched_mem_context}{}",
            dynamic_state.trim_end()
        );
        let mut req_messages = messages.clone();
        req_messages.push(Message::system(transient_injection));

        let mut payload = ChatPayload::new(model.clone(), req_messages);
        payload.temperature = Some(active_temp);
        payload.max_tokens = Some(8192);

        let target_tool = plan.required_tool.to_lowercase();
        let is_final_generation = turn_state.force_final_response
            || target_tool == "none"
            || plan.next_action_id.trim().eq_ignore_ascii_case("none");
        let active_defs = if !target_tool.is_empty() && target_tool != "all" {
            state.registry.narrowed_definitions(&plan.required_tool)
        } else {
            state.registry.definitions()
        };
        if is_final_generation || active_defs.is_empty() {
            payload = payload.without_tools();
        } else {
            payload = payload.with_tools(&active_defs);
        }

        tracing::info!(turn = turn + 1, temp = active_temp, "responder request");

        // ── Streaming final generation ────────────────────────────────
        if is_final_generation && stream_requested {
            match state
                .upstream
                .chat_stream(payload.clone(), responder_class, None)
                .await
            {
                Ok(mut upstream_stream) => {
                    use futures_util::StreamExt;
                    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
                    let state_bg = state.clone();
                    let model_bg = model.clone();
                    let last_user_bg = last_user_content.clone();
                    let transcript_seed = recent_transcript(&messages, 10);
                    let tools_run = turn_state.tools_run.clone();
                    let smart_memory_ok = background_enabled
                        && state.config.smart_memory > 0.0
                        && !last_user_content.is_empty()
                        && !turn_state.forget_was_called
                        && !turn_state.last_was_failure;
                    let post_mortem_ok = background_enabled
                        && (turn_state.was_complex_task || turn_state.execution_failures > 0);

                    tokio::spawn(async move {
                        let mut full_content = String::new();
                        let mut sse_buf = String::new();
                        while let Some(chunk) = upstream_stream.next().await {
                            let bytes = match chunk {
                                Ok(b) => b,
                                Err(e) => {
                                    tracing::warn!(error = %e, "upstream stream error");
                                    break;
                                }
                            };
                            sse_buf.push_str(&String::from_utf8_lossy(&bytes));
                            while let Some(pos) = sse_buf.find("\n\n") {
                                let event: String = sse_buf.drain(..pos + 2).collect();
                                for line in event.lines() {
                                    let Some(data) = line.strip_prefix("data: ") else {
                                        continue;
                                    };
                                    if data.trim() == "[DONE]" {
                                        continue;
                                    }
                                    if let Ok(v) = serde_json::from_str::<Value>(data) {
                                        if let Some(delta) = v["choices"][0]["delta"]["content"].as_str()
                                        {
                                            full_content.push_str(delta);
                                        }
                                    }
                                }
                            }
                            if tx.send(bytes).await.is_err() {
                                // Client disconnected; drop the upstream stream.
                                return;
                            }
                        }

                        if smart_memory_ok {
                            let transcript = format!("{transcript_seed}AI: {full_content}");
                            state_bg.background.enqueue(run_smart_memory(
                                state_bg.clone(),
                                transcript,
                                model_bg.clone(),
                            ));
                        }
                        if post_mortem_ok {
                            state_bg.background.enqueue(run_post_mortem(
                                state_bg.clone(),
                                last_user_bg,
                                tools_run,
                                scrub(&full_content),
                                model_bg,
                            ));
                        }
                    });

                    tracing::info!(request_id = %req_id, "request finished (streaming)");
                    return ChatOutcome::Stream { rx, created, req_id };
                }
                Err(e) => {
                    tracing::error!(error = %e, "streaming call failed, degrading to unary");
                }
            }
        }

        // ── Unary responder call ──────────────────────────────────────
        let completion = match state.upstream.chat(payload.clone(), responder_class, None).await {
            Ok(body) => body,
            Err(ghost_domain::Error::ContextOverflow(_)) => {
                tracing::warn!("context overflow, emergency pruning");
                messages = emergency_prune(&messages, turn_state.tools_run.last());
                let mut retry = payload.clone();
                retry.messages = messages.clone();
                match state.upstream.chat(retry, responder_class, None).await {
                    Ok(body) => body,
                    Err(e) => {
                        final_content = format!("CRITICAL: Context overflow recovery failed: {e}");
                        break;
                    }
                }
            }
            Err(e) if e.is_transient() || matches!(e, ghost_domain::Error::UpstreamUnavailable) => {
                tracing::error!(error = %e, "upstream unreachable");
                final_content = "CRITICAL: The upstream LLM server is unreachable. It may have \
                                 crashed due to memory pressure or is currently restarting. \
                                 Please wait a moment and try again."
                    .into();
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "upstream error");
                final_content = format!("CRITICAL: {e}");
                break;
            }
        };

        let assistant = Message::from_completion(&completion);
        let (healed_content, tool_calls) =
            heal_tool_call_syntax(assistant.text(), assistant.tool_calls.clone());
        let content = scrub(&healed_content).replace('\r', "");

        if !content.is_empty() {
            if !final_content.is_empty() && !final_content.ends_with("\n\n") {
                final_content.push_str("\n\n");
            }
            final_content.push_str(&content);
        }

        // ── Termination on a plain answer ─────────────────────────────
        if tool_calls.is_empty() {
            let meta_tools_called = turn_state.raw_tools_called.contains("learn_skill")
                || turn_state.raw_tools_called.contains("update_profile");
            if has_meta_intent(&last_user_content) && !meta_tools_called && turn < 4 {
                tracing::info!("checklist nudge: enforcing meta-task compliance");
                // Remove the draft so the retry does not duplicate it.
                final_content = final_content
                    .strip_suffix(content.as_str())
                    .unwrap_or(&final_content)
                    .trim()
                    .to_string();
                messages.push(Message::user(
                    "CRITICAL: You have not fulfilled the learning/profile instructions in the \
                     user's request. You MUST call 'learn_skill' or 'update_profile' now before \
                     finishing.",
                ));
                continue;
            }

            if background_enabled
                && state.config.smart_memory > 0.0
                && !last_user_content.is_empty()
                && !turn_state.forget_was_called
                && !turn_state.last_was_failure
            {
                let transcript = format!(
                    "{}AI: {final_content}",
                    recent_transcript(&messages, 10)
                );
                state
                    .background
                    .enqueue(run_smart_memory(state.clone(), transcript, model.clone()));
            }
            break;
        }

        // ── Tool handling ─────────────────────────────────────────────
        let mut assistant_msg = assistant;
        assistant_msg.set_text(content);
        assistant_msg.tool_calls = tool_calls.clone();
        messages.push(assistant_msg);

        turn_state.last_was_failure = false;
        dispatch_tool_calls(
            &state.registry,
            state.upstream.as_ref(),
            &model,
            &mut turn_state,
            &tool_calls,
            &last_user_content,
            &plan.thought,
            &mut messages,
        )
        .await;
    }

    // ── Post-processing ───────────────────────────────────────────────
    final_content = scrub(&final_content);

    let heavy_tools_used = turn_state
        .tools_run
        .iter()
        .any(|m| matches!(m.name.as_deref(), Some("execute") | Some("deep_research")));

    if state.config.perfect_it
        && !turn_state.tools_run.is_empty()
        && heavy_tools_used
        && turn_state.execution_failures == 0
        && !turn_state.last_was_failure
        && final_content.len() < 50
    {
        tracing::info!("generating proactive optimization");
        let last_output = turn_state
            .tools_run
            .last()
            .map(|m| m.text().to_string())
            .unwrap_or_default();
        let mut optimize_messages = messages.clone();
        optimize_messages.push(Message::user(format!(
            "Task completed successfully. Final tool output:\n\n{last_output}\n\n\
             <system_directive>First, succinctly present the tool output/result to the user. \
             Then analyze the result and proactively suggest one concrete way to optimize, \
             scale, secure, or automate this work further. RESPOND IN PLAIN TEXT ONLY. DO NOT \
             USE TOOLS.</system_directive>"
        )));
        let mut payload = ChatPayload::new(model.clone(), optimize_messages).without_tools();
        payload.temperature = Some(0.3);
        match state.upstream.chat(payload, PoolKind::Worker, None).await {
            Ok(body) => {
                let suggestion = scrub(Message::from_completion(&body).text());
                if final_content.is_empty() {
                    final_content = suggestion;
                } else {
                    final_content = format!("{final_content}\n\n{suggestion}");
                }
            }
            Err(_) if final_content.is_empty() => {
                final_content =
                    "Task finished successfully, but optimization generation failed.".into();
            }
            Err(_) => {}
        }
    } else if !turn_state.tools_run.is_empty() && final_content.is_empty() {
        let last_output = turn_state
            .tools_run
            .last()
            .map(|m| m.text().to_string())
            .unwrap_or_default();
        final_content = synthesize_fallback(&last_output);
    }

    if final_content.is_empty() {
        final_content = "Task executed successfully.".into();
    }

    // ── Post-mortem dispatch ──────────────────────────────────────────
    if background_enabled && (turn_state.was_complex_task || turn_state.execution_failures > 0) {
        let is_complete_failure = turn_state.execution_failures >= 3;
        let is_valid_success =
            !turn_state.force_stop || plan.thought.to_uppercase().contains("READY TO FINALIZE");
        if is_valid_success || is_complete_failure {
            state.background.enqueue(run_post_mortem(
                state.clone(),
                last_user_content.clone(),
                turn_state.tools_run.clone(),
                final_content.clone(),
                model.clone(),
            ));
        }
    }

    tracing::info!(request_id = %req_id, "request finished");
    ChatOutcome::Complete {
        content: final_content,
        created,
        req_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_tags_roles_and_caps_length() {
        let messages = vec![
            Message::system("ignored"),
            Message::user("question"),
            Message::assistant("answer"),
            Message::tool_result("c1", "web_search", "x".repeat(900)),
        ];
        let out = recent_transcript(&messages, 40);
        assert!(out.contains("USER: question"));
        assert!(out.contains("AI: answer"));
        assert!(out.contains("TOOL (web_search):"));
        assert!(!out.contains("ignored"));
        // Tool content capped at 500 chars.
        let tool_line = out.lines().find(|l| l.starts_with("TOOL")).unwrap();
        assert!(tool_line.len() < 600);
    }

    #[test]
    fn planning_context_renders_last_two_tools() {
        let tools = vec![
            Message::tool_result("c1", "recall", "first"),
            Message::tool_result("c2", "web_search", "second"),
            Message::tool_result("c3", "execute", "third"),
        ];
        let out = planning_tool_context(&tools);
        assert!(!out.contains("first"));
        assert!(out.contains("Tool [web_search]: second"));
        assert!(out.contains("Tool [execute]: third"));

        assert_eq!(planning_tool_context(&[]), "None (Start of Task)");
    }

    #[test]
    fn planning_context_truncates_large_outputs() {
        let tools = vec![Message::tool_result("c1", "recall", "y".repeat(6000))];
        let out = planning_tool_context(&tools);
        assert!(out.contains("[TRUNCATED: Tool output too long"));
        assert!(out.len() < 4200);
    }

    #[test]
    fn fallback_synthesis_extracts_stdout() {
        let raw = "--- EXECUTION RESULT ---\nEXIT CODE: 0\nSTDOUT/STDERR:\n42 files counted\n\n\
                   --- DIAGNOSTIC HINT ---\nnothing\n------------------------";
        let out = synthesize_fallback(raw);
        assert!(out.contains("42 files counted"));
        assert!(!out.contains("DIAGNOSTIC HINT"));
        assert!(out.starts_with("Process finished successfully."));
    }

    #[test]
    fn meta_intent_keywords() {
        assert!(has_meta_intent("please save this lesson"));
        assert!(has_meta_intent("update my profile"));
        assert!(!has_meta_intent("what is the weather"));
    }

    #[test]
    fn cap_chars_marks_truncation() {
        assert_eq!(cap_chars("short", 100), "short");
        let capped = cap_chars(&"a".repeat(2000), 1500);
        assert!(capped.ends_with("...[TRUNCATED]"));
    }
}
