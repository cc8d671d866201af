//! Small tools: `replan`, `dream_mode`, and `vision_analysis`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ghost_context::extract_json;
use ghost_domain::chat::{ChatPayload, Message, ResponseFormat, ToolDefinition};
use ghost_memory::MemoryStore;
use ghost_router::{PoolKind, Upstream};
use serde_json::Value;

use crate::{opt_str, require_str, Tool};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// replan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Forces a fresh planning step by surfacing the model's own reset reason
/// as a tool result the planner will see next turn.
pub struct ReplanTool;

#[async_trait]
impl Tool for ReplanTool {
    fn name(&self) -> &'static str {
        "replan"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "replan".into(),
            description: "Call this tool if your current strategy is failing or if you need to \
                          pause and rethink. It forces a fresh planning step."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why are you replanning?"}
                },
                "required": ["reason"]
            }),
        }
    }

    async fn run(&self, args: Value) -> String {
        let reason = opt_str(&args, "reason").unwrap_or("unspecified");
        format!(
            "Strategy Reset Triggered. Reason: {reason}\nSYSTEM: The planner sees this and \
             should update the task tree accordingly."
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// dream_mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One active memory-consolidation pass: cluster recent auto-captured
/// fragments on a worker node, delete the absorbed originals, store the
/// consolidated summary. Callable only; there is no scheduled variant.
pub struct DreamModeTool {
    pub upstream: Arc<dyn Upstream>,
    pub memory: Arc<dyn MemoryStore>,
    pub model: String,
}

#[async_trait]
impl Tool for DreamModeTool {
    fn name(&self) -> &'static str {
        "dream_mode"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "dream_mode".into(),
            description: "Triggers Active Memory Consolidation. Use this when the user asks to \
                          'sleep', 'rest', or 'consolidate memories'."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    fn mutates(&self, _args: &Value) -> bool {
        true
    }

    async fn run(&self, _args: Value) -> String {
        let fragments = match self
            .memory
            .search_scored("recent events and facts", 20, Some("auto"))
            .await
        {
            Ok(f) => f,
            Err(e) => return format!("Error: could not sample memories: {e}"),
        };
        if fragments.len() < 3 {
            return "Nothing to consolidate: fewer than 3 auto-captured memories.".into();
        }

        let listing: Vec<String> = fragments
            .iter()
            .map(|f| format!("ID: {} | {}", f.id, f.text))
            .collect();
        let prompt = format!(
            "### MEMORY CONSOLIDATION\nBelow are raw memory fragments. Merge related fragments \
             into a small number of dense summary facts. Return ONLY a JSON object: \
             {{\"summary\": \"<the consolidated facts>\", \"absorbed_ids\": [\"<ids now \
             redundant>\"]}}\n\nFRAGMENTS:\n{}",
            listing.join("\n")
        );

        let mut payload = ChatPayload::new(self.model.clone(), vec![Message::user(prompt)]);
        payload.temperature = Some(0.1);
        payload.response_format = Some(ResponseFormat::json_object());

        let body = match self.upstream.chat(payload, PoolKind::Worker, None).await {
            Ok(b) => b,
            Err(e) => return format!("Error: consolidation call failed: {e}"),
        };
        let Some(result) = extract_json(Message::from_completion(&body).text()) else {
            return "Error: consolidation returned malformed JSON.".into();
        };

        let summary = result
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if summary.is_empty() {
            return "Dream pass complete: nothing worth consolidating.".into();
        }

        let absorbed: Vec<String> = result
            .get("absorbed_ids")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let deleted = if absorbed.is_empty() {
            0
        } else {
            self.memory.delete(&absorbed).await.unwrap_or(0)
        };

        let meta = serde_json::json!({"type": "dream", "timestamp": Utc::now().to_rfc3339()});
        if let Err(e) = self.memory.add(&summary, meta).await {
            return format!("Error: could not store consolidated memory: {e}");
        }

        tracing::info!(absorbed = deleted, "dream consolidation complete");
        format!(
            "SUCCESS: Consolidated {} fragments into 1 summary (absorbed {deleted}).",
            fragments.len()
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// vision_analysis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registered only when vision nodes are configured.
pub struct VisionAnalysisTool {
    pub upstream: Arc<dyn Upstream>,
}

#[async_trait]
impl Tool for VisionAnalysisTool {
    fn name(&self) -> &'static str {
        "vision_analysis"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "vision_analysis".into(),
            description: "Analyze an image with the dedicated vision model. Provide the image \
                          URL and what to look for."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "image_url": {"type": "string", "description": "URL or data URI of the image."},
                    "question": {"type": "string", "description": "What to analyze or describe."}
                },
                "required": ["image_url"]
            }),
        }
    }

    async fn run(&self, args: Value) -> String {
        let image_url = match require_str(&args, "image_url") {
            Ok(u) => u,
            Err(e) => return e,
        };
        let question = opt_str(&args, "question").unwrap_or("Describe this image in detail.");

        let mut payload = ChatPayload::new(
            "default",
            vec![Message::user_with_image(question, image_url)],
        );
        payload.temperature = Some(0.2);

        match self.upstream.chat(payload, PoolKind::Vision, None).await {
            Ok(resp) => {
                let text = Message::from_completion(&resp).text().trim().to_string();
                if text.is_empty() {
                    "Error: the vision model returned no description.".into()
                } else {
                    format!("VISION ANALYSIS:\n{text}")
                }
            }
            Err(e) => format!(
                "Error: Vision analysis failed: {e}. The dedicated vision node is offline or \
                 returned an error."
            ),
        }
    }
}
