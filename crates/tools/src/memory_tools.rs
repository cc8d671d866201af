//! Memory-facing tools: `knowledge_base`, `recall`, `update_profile`,
//! `learn_skill`, and `scratchpad`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ghost_domain::chat::ToolDefinition;
use ghost_memory::{MemoryStore, ProfileStore, Scratchpad, SkillPlaybook};
use serde_json::Value;

use crate::paths::safe_path;
use crate::search::SearchProvider;
use crate::{opt_str, require_str, Tool};

/// Target chunk size for document ingestion.
const CHUNK_SIZE: usize = 500;

/// Split text into roughly `chunk_size`-char pieces, preferring paragraph
/// and sentence boundaries.
pub fn split_text(text: &str, chunk_size: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut buffer = String::new();
    for paragraph in text.split_inclusive("\n\n") {
        if buffer.len() + paragraph.len() <= chunk_size {
            buffer.push_str(paragraph);
            continue;
        }
        if !buffer.trim().is_empty() {
            chunks.push(std::mem::take(&mut buffer).trim().to_string());
        }
        if paragraph.len() <= chunk_size {
            buffer.push_str(paragraph);
        } else {
            // Oversized paragraph: split on sentences, then hard-cut.
            for sentence in paragraph.split_inclusive(". ") {
                if buffer.len() + sentence.len() > chunk_size && !buffer.trim().is_empty() {
                    chunks.push(std::mem::take(&mut buffer).trim().to_string());
                }
                if sentence.len() > chunk_size {
                    let mut rest = sentence;
                    while rest.len() > chunk_size {
                        let mut cut = chunk_size;
                        while !rest.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        chunks.push(rest[..cut].to_string());
                        rest = &rest[cut..];
                    }
                    buffer.push_str(rest);
                } else {
                    buffer.push_str(sentence);
                }
            }
        }
    }
    if !buffer.trim().is_empty() {
        chunks.push(buffer.trim().to_string());
    }
    chunks
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// recall
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RecallTool {
    pub memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &'static str {
        "recall"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "recall".into(),
            description: "Search long-term vector memory for general semantic concepts or past \
                          conversations. WARNING: this cannot find exact quotes or specific \
                          lines. Use file_system operation='search' for exact text matching."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        }
    }

    fn condensed(&self) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let query = match require_str(&args, "query") {
            Ok(q) => q,
            Err(e) => return e,
        };
        match self.memory.search(query).await {
            Ok(context) if context.trim().is_empty() => {
                "No relevant memories found.".into()
            }
            Ok(context) => format!("MEMORY CONTEXT:\n{context}"),
            Err(e) => format!("Error: memory search failed: {e}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// knowledge_base
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct KnowledgeBaseTool {
    pub memory: Arc<dyn MemoryStore>,
    pub provider: Arc<dyn SearchProvider>,
    pub sandbox_dir: PathBuf,
}

impl KnowledgeBaseTool {
    async fn ingest_document(&self, source: &str) -> String {
        let text = if source.starts_with("http") {
            match self.provider.fetch_page(source).await {
                Ok(t) => t,
                Err(e) => return format!("Error: could not fetch '{source}': {e}"),
            }
        } else {
            let path = match safe_path(&self.sandbox_dir, source) {
                Ok(p) => p,
                Err(e) => return e,
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(t) => t,
                Err(e) => return format!("Error: could not read '{source}': {e}"),
            }
        };

        let chunks = split_text(&text, CHUNK_SIZE);
        if chunks.is_empty() {
            return format!("Error: '{source}' produced no ingestible text.");
        }

        let total = chunks.len();
        for chunk in chunks {
            let meta = serde_json::json!({
                "type": "document",
                "source": source,
                "timestamp": Utc::now().to_rfc3339(),
            });
            if let Err(e) = self.memory.add(&chunk, meta).await {
                return format!("Error: ingestion failed mid-document: {e}");
            }
        }
        tracing::info!(source, chunks = total, "document ingested");
        format!("SUCCESS: Ingested '{source}' as {total} memory fragments.")
    }
}

#[async_trait]
impl Tool for KnowledgeBaseTool {
    fn name(&self) -> &'static str {
        "knowledge_base"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "knowledge_base".into(),
            description: "Unified memory manager. ALWAYS use this to ingest_document (files or \
                          URLs), insert_fact, forget, list_docs, or reset_all. Do NOT write \
                          scripts to read or ingest documents."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["insert_fact", "ingest_document", "forget", "list_docs", "reset_all"]
                    },
                    "content": {
                        "type": "string",
                        "description": "For ingest_document: a FILENAME or URL. For insert_fact: \
                                        the raw text to memorize. For forget: the topic."
                    }
                },
                "required": ["action"]
            }),
        }
    }

    fn mutates(&self, args: &Value) -> bool {
        opt_str(args, "action")
            .map(|a| ["ingest_document", "forget", "reset_all", "insert_fact"].contains(&a))
            .unwrap_or(false)
    }

    fn condensed(&self) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let action = match require_str(&args, "action") {
            Ok(a) => a,
            Err(e) => return e,
        };
        match action {
            "insert_fact" => match require_str(&args, "content") {
                Ok(fact) => {
                    let meta = serde_json::json!({
                        "type": "manual",
                        "timestamp": Utc::now().to_rfc3339(),
                    });
                    match self.memory.add(fact, meta).await {
                        Ok(_) => format!("SUCCESS: Memorized fact ({} chars).", fact.len()),
                        Err(e) => format!("Error: {e}"),
                    }
                }
                Err(e) => e,
            },
            "ingest_document" => match require_str(&args, "content") {
                Ok(source) => self.ingest_document(source).await,
                Err(e) => e,
            },
            "forget" => match require_str(&args, "content") {
                Ok(topic) => match self.memory.forget_topic(topic).await {
                    Ok(n) => format!("SUCCESS: Forgot {n} memory fragments about '{topic}'."),
                    Err(e) => format!("Error: {e}"),
                },
                Err(e) => e,
            },
            "list_docs" => match self.memory.list_documents().await {
                Ok(docs) if docs.is_empty() => "No documents in the knowledge base.".into(),
                Ok(docs) => format!("Indexed documents:\n- {}", docs.join("\n- ")),
                Err(e) => format!("Error: {e}"),
            },
            "reset_all" => match self.memory.reset().await {
                Ok(_) => "SUCCESS: Knowledge base wiped.".into(),
                Err(e) => format!("Error: {e}"),
            },
            other => format!("Error: Unknown action '{other}'"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// update_profile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UpdateProfileTool {
    pub profile: Arc<ProfileStore>,
}

#[async_trait]
impl Tool for UpdateProfileTool {
    fn name(&self) -> &'static str {
        "update_profile"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "update_profile".into(),
            description: "Save a permanent fact about the user (name, preferences, location)."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "category": {
                        "type": "string",
                        "description": "The category for this fact (e.g., 'root', 'preferences', \
                                        'projects', 'assets', 'relationships', 'interests')."
                    },
                    "key": {"type": "string"},
                    "value": {"type": "string"}
                },
                "required": ["category", "key", "value"]
            }),
        }
    }

    fn mutates(&self, _args: &Value) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let (category, key, value) = match (
            require_str(&args, "category"),
            require_str(&args, "key"),
            require_str(&args, "value"),
        ) {
            (Ok(c), Ok(k), Ok(v)) => (c.to_string(), k.to_string(), v.to_string()),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return e,
        };

        let profile = self.profile.clone();
        let result =
            tokio::task::spawn_blocking(move || profile.update(&category, &key, &value)).await;
        match result {
            Ok(Ok(msg)) => format!("SUCCESS: {msg}"),
            Ok(Err(e)) => format!("Error: {e}"),
            Err(e) => format!("Error: profile task failed: {e}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// learn_skill
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LearnSkillTool {
    pub playbook: Arc<SkillPlaybook>,
    pub memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for LearnSkillTool {
    fn name(&self) -> &'static str {
        "learn_skill"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "learn_skill".into(),
            description: "MANDATORY when you solve a complex bug or task after initial failure. \
                          Save the lesson so you don't repeat the mistake."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string"},
                    "mistake": {"type": "string"},
                    "solution": {"type": "string"}
                },
                "required": ["task", "mistake", "solution"]
            }),
        }
    }

    fn mutates(&self, _args: &Value) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let (task, mistake, solution) = match (
            require_str(&args, "task"),
            require_str(&args, "mistake"),
            require_str(&args, "solution"),
        ) {
            (Ok(t), Ok(m), Ok(s)) => (t.to_string(), m.to_string(), s.to_string()),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return e,
        };

        let playbook = self.playbook.clone();
        let lesson = {
            let (task, mistake, solution) = (task.clone(), mistake.clone(), solution.clone());
            tokio::task::spawn_blocking(move || playbook.learn_lesson(&task, &mistake, &solution))
                .await
        };
        let lesson = match lesson {
            Ok(Ok(lesson)) => lesson,
            Ok(Err(e)) => return format!("Error: {e}"),
            Err(e) => return format!("Error: playbook task failed: {e}"),
        };

        // Mirror into vector memory for semantic recall during planning.
        let meta = serde_json::json!({"type": "skill", "timestamp": lesson.timestamp});
        if let Err(e) = self.memory.add(&lesson.as_memory_text(), meta).await {
            tracing::warn!(error = %e, "lesson saved to playbook but not indexed");
        }
        format!("SUCCESS: Lesson recorded: {task}")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// scratchpad
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScratchpadTool {
    pub scratchpad: Arc<Scratchpad>,
}

#[async_trait]
impl Tool for ScratchpadTool {
    fn name(&self) -> &'static str {
        "scratchpad"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "scratchpad".into(),
            description: "Read, write, or clear short-term persistent notes in your SCRAPBOOK. \
                          Use this to pass data between turns or tasks."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["set", "get", "list", "clear"]},
                    "key": {"type": "string", "description": "The note name (required for set/get)."},
                    "value": {"type": "string", "description": "The content to save (required for set)."}
                },
                "required": ["action"]
            }),
        }
    }

    async fn run(&self, args: Value) -> String {
        let action = match require_str(&args, "action") {
            Ok(a) => a,
            Err(e) => return e,
        };
        match action {
            "set" => match (require_str(&args, "key"), require_str(&args, "value")) {
                (Ok(key), Ok(value)) => {
                    self.scratchpad.set(key, value);
                    format!("SUCCESS: Saved note '{key}'.")
                }
                (Err(e), _) | (_, Err(e)) => e,
            },
            "get" => match require_str(&args, "key") {
                Ok(key) => self
                    .scratchpad
                    .get(key)
                    .unwrap_or_else(|| format!("Error: no note named '{key}'.")),
                Err(e) => e,
            },
            "list" => self.scratchpad.list_all(),
            "clear" => {
                self.scratchpad.clear();
                "SUCCESS: Scratchpad cleared.".into()
            }
            other => format!("Error: Unknown action '{other}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_text_respects_paragraphs() {
        let text = format!("{}\n\n{}", "a".repeat(300), "b".repeat(300));
        let chunks = split_text(&text, 500);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn split_text_hard_cuts_monoliths() {
        let text = "x".repeat(1700);
        let chunks = split_text(&text, 500);
        assert!(chunks.len() >= 4);
        assert!(chunks.iter().all(|c| c.len() <= 500));
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 1700);
    }

    #[test]
    fn split_text_small_input_is_single_chunk() {
        assert_eq!(split_text("short", 500), vec!["short".to_string()]);
        assert!(split_text("", 500).is_empty());
    }

    #[tokio::test]
    async fn scratchpad_tool_round_trip() {
        let tool = ScratchpadTool {
            scratchpad: Arc::new(Scratchpad::new()),
        };
        let out = tool
            .run(serde_json::json!({"action": "set", "key": "k", "value": "v"}))
            .await;
        assert!(out.starts_with("SUCCESS"));
        let out = tool.run(serde_json::json!({"action": "get", "key": "k"})).await;
        assert_eq!(out, "v");
        let out = tool.run(serde_json::json!({"action": "list"})).await;
        assert!(out.contains("k: v"));
    }

    #[tokio::test]
    async fn recall_reports_empty_memory() {
        let tool = RecallTool {
            memory: Arc::new(ghost_memory::NullMemory),
        };
        let out = tool.run(serde_json::json!({"query": "anything"})).await;
        assert_eq!(out, "No relevant memories found.");
    }
}
