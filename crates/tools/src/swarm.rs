//! Swarm delegation: fire-and-forget background tasks on the planner
//! cluster, results handed back through the scratchpad. Also the
//! `self_play` drill, which exercises the worker pool the same way.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ghost_domain::chat::{ChatPayload, Message, ToolDefinition};
use ghost_memory::Scratchpad;
use ghost_router::{PoolKind, Upstream};
use serde_json::Value;

use crate::{opt_str, Tool};

/// Per-worker wall clock budget.
const WORKER_TIMEOUT: Duration = Duration::from_secs(300);
/// Input data cap per delegated task.
const INPUT_CAP: usize = 20_000;

async fn swarm_worker(
    upstream: Arc<dyn Upstream>,
    scratchpad: Arc<Scratchpad>,
    instruction: String,
    input_data: String,
    output_key: String,
    target_model: Option<String>,
) {
    let input_end = input_data
        .char_indices()
        .take_while(|(i, _)| *i < INPUT_CAP)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);

    let mut payload = ChatPayload::new(
        target_model.clone().unwrap_or_else(|| "default".into()),
        vec![
            Message::system(
                "You are a specialized Swarm Worker node. Execute the user's instruction on the \
                 provided data and return ONLY the results. Be concise.",
            ),
            Message::user(format!(
                "INSTRUCTION:\n{instruction}\n\nINPUT DATA:\n{}",
                &input_data[..input_end]
            )),
        ],
    );
    payload.temperature = Some(0.0);
    payload.max_tokens = Some(2048);

    let call = upstream.chat(payload, PoolKind::Planner, target_model.as_deref());
    match tokio::time::timeout(WORKER_TIMEOUT, call).await {
        Ok(Ok(body)) => {
            let text = Message::from_completion(&body).text().trim().to_string();
            tracing::info!(key = %output_key, "swarm task completed");
            scratchpad.set(output_key, text);
        }
        Ok(Err(e)) => {
            tracing::warn!(key = %output_key, error = %e, "swarm task failed");
            scratchpad.set(
                output_key,
                format!(
                    "SYSTEM ALERT: Swarm execution failed ({e}). The edge node is offline. You \
                     must process this data yourself synchronously."
                ),
            );
        }
        Err(_) => {
            scratchpad.set(
                output_key,
                "SYSTEM ALERT: Swarm execution timed out after 300s.",
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// delegate_to_swarm
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DelegateToSwarmTool {
    pub upstream: Arc<dyn Upstream>,
    pub scratchpad: Arc<Scratchpad>,
}

#[async_trait]
impl Tool for DelegateToSwarmTool {
    fn name(&self) -> &'static str {
        "delegate_to_swarm"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delegate_to_swarm".into(),
            description: "Send MULTIPLE time-consuming tasks to a background cluster of \
                          specialized AI workers. Provide an array of tasks. They run \
                          simultaneously and save answers to your SCRAPBOOK."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "tasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "instruction": {"type": "string", "description": "Exactly what the worker should do with the data."},
                                "input_data": {"type": "string", "description": "The raw text or data to be processed."},
                                "output_key": {"type": "string", "description": "The scratchpad key where the result will be saved."},
                                "target_model": {"type": "string", "description": "Optional model name to target a specific node."}
                            },
                            "required": ["instruction", "input_data", "output_key"]
                        },
                        "description": "List of tasks to execute in parallel."
                    }
                },
                "required": ["tasks"]
            }),
        }
    }

    async fn run(&self, args: Value) -> String {
        if !self.upstream.has_pool(PoolKind::Planner) {
            return "SYSTEM WARNING: The Swarm Cluster is not configured (no --swarm-nodes \
                    provided). You must process this data yourself synchronously in your main \
                    loop."
                .into();
        }

        let Some(tasks) = args.get("tasks").and_then(|v| v.as_array()) else {
            return "Error: No tasks provided to delegate_to_swarm.".into();
        };

        let mut dispatched = 0usize;
        for task in tasks {
            let instruction = task.get("instruction").and_then(|v| v.as_str());
            let input_data = task.get("input_data").and_then(|v| v.as_str());
            let output_key = task.get("output_key").and_then(|v| v.as_str());
            let (Some(instruction), Some(input_data), Some(output_key)) =
                (instruction, input_data, output_key)
            else {
                tracing::warn!("skipping invalid swarm task definition");
                continue;
            };
            let target_model = task
                .get("target_model")
                .and_then(|v| v.as_str())
                .map(String::from);

            tokio::spawn(swarm_worker(
                self.upstream.clone(),
                self.scratchpad.clone(),
                instruction.to_string(),
                input_data.to_string(),
                output_key.to_string(),
                target_model,
            ));
            dispatched += 1;
        }

        if dispatched == 0 {
            return "Error: No tasks provided to delegate_to_swarm.".into();
        }
        tracing::info!(count = dispatched, "swarm tasks dispatched");
        format!(
            "SUCCESS: {dispatched} task(s) dispatched to the Swarm. The results will be silently \
             written to your SCRAPBOOK when finished. Do not wait - continue executing your next \
             planned steps immediately."
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// self_play
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SelfPlayTool {
    pub upstream: Arc<dyn Upstream>,
    pub scratchpad: Arc<Scratchpad>,
    pub model: String,
    counter: AtomicU64,
}

impl SelfPlayTool {
    pub fn new(upstream: Arc<dyn Upstream>, scratchpad: Arc<Scratchpad>, model: String) -> Self {
        Self {
            upstream,
            scratchpad,
            model,
            counter: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Tool for SelfPlayTool {
    fn name(&self) -> &'static str {
        "self_play"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "self_play".into(),
            description: "Run a self-exercise drill: pose a hard question about the given topic, \
                          answer it, and store the transcript in the SCRAPBOOK."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string", "description": "The subject to drill on."}
                },
                "required": ["topic"]
            }),
        }
    }

    async fn run(&self, args: Value) -> String {
        let topic = opt_str(&args, "topic").unwrap_or("recent work").to_string();

        let mut payload = ChatPayload::new(
            self.model.clone(),
            vec![Message::user(format!(
                "Pose one challenging question about '{topic}', then answer it rigorously. \
                 Format as:\nQ: <question>\nA: <answer>"
            ))],
        );
        payload.temperature = Some(0.3);
        payload.max_tokens = Some(1024);

        match self.upstream.chat(payload, PoolKind::Worker, None).await {
            Ok(body) => {
                let transcript = Message::from_completion(&body).text().trim().to_string();
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                let key = format!("self_play_{n}");
                self.scratchpad.set(&key, transcript);
                format!("SUCCESS: Drill complete. Transcript saved to scratchpad key '{key}'.")
            }
            Err(e) => format!("Error: self-play drill failed: {e}"),
        }
    }
}
