//! Syntax healer for leaked `<tool_call>` tags.
//!
//! Some backends stop parsing the chat template and emit tool calls as raw
//! tagged JSON inside the content. When the structured `tool_calls` list is
//! empty, each tagged blob is promoted into a real [`ToolCall`] with a
//! synthesized id; the raw tags are erased from the content either way.

use std::sync::LazyLock;

use ghost_domain::chat::ToolCall;
use regex::Regex;

use crate::json::extract_json;

static TAGGED_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tool_call>\s*(\{.*?\})\s*</tool_call>").unwrap());
static TAGGED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tool_call>.*?</tool_call>").unwrap());

/// Repair leaked tool-call syntax. Returns the cleaned content and the
/// (possibly augmented) tool-call list.
pub fn heal_tool_call_syntax(content: &str, tool_calls: Vec<ToolCall>) -> (String, Vec<ToolCall>) {
    if !content.contains("<tool_call>") {
        return (content.to_string(), tool_calls);
    }

    tracing::warn!("intercepted leaked <tool_call> tags, repairing");

    let mut calls = tool_calls;
    // Only parse manually when the backend missed the calls entirely.
    if calls.is_empty() {
        for caps in TAGGED_CALL.captures_iter(content) {
            let Some(blob) = extract_json(&caps[1]) else {
                continue;
            };
            let Some(name) = blob.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let arguments = blob
                .get("arguments")
                .map(|a| a.to_string())
                .unwrap_or_else(|| "{}".into());
            let id = format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
            calls.push(ToolCall::new(name, arguments).with_id(id));
        }
    }

    let cleaned = TAGGED_BLOCK.replace_all(content, "").trim().to_string();
    (cleaned, calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_tagged_calls_when_list_empty() {
        let content = r#"Let me check.<tool_call>{"name": "recall", "arguments": {"query": "cats"}}</tool_call>"#;
        let (cleaned, calls) = heal_tool_call_syntax(content, Vec::new());
        assert_eq!(cleaned, "Let me check.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "recall");
        assert!(calls[0].id.starts_with("call_"));
        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["query"], "cats");
    }

    #[test]
    fn keeps_structured_calls_when_present() {
        let content = r#"<tool_call>{"name": "recall", "arguments": {}}</tool_call>"#;
        let existing = vec![ToolCall::new("web_search", "{}").with_id("call_1")];
        let (cleaned, calls) = heal_tool_call_syntax(content, existing);
        assert!(cleaned.is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "web_search");
    }

    #[test]
    fn untagged_content_passes_through() {
        let (cleaned, calls) = heal_tool_call_syntax("plain answer", Vec::new());
        assert_eq!(cleaned, "plain answer");
        assert!(calls.is_empty());
    }

    #[test]
    fn malformed_blob_is_dropped_but_tags_erased() {
        let content = "x<tool_call>{not json}</tool_call>y";
        let (cleaned, calls) = heal_tool_call_syntax(content, Vec::new());
        assert_eq!(cleaned, "xy");
        assert!(calls.is_empty());
    }
}
