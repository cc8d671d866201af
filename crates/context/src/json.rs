//! Lenient JSON extraction from model output.
//!
//! JSON-mode upstreams still wrap objects in markdown fences or prepend
//! conversational filler often enough that every planner/critic/extractor
//! consumer parses through this.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Extract the first JSON object from `text`, ignoring markdown fences and
/// surrounding filler. Returns `None` when nothing parses.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(caps) = FENCED_JSON.captures(text) {
        if let Ok(v) = serde_json::from_str::<Value>(&caps[1]) {
            return Some(v);
        }
    }

    let start = text.find('{');
    let end = text.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Some(v);
            }
        }
    }

    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_block() {
        let v = extract_json("Sure!\n```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn parses_brace_window_with_filler() {
        let v = extract_json("The plan is {\"thought\": \"go\"} as requested.").unwrap();
        assert_eq!(v["thought"], "go");
    }

    #[test]
    fn parses_bare_json() {
        let v = extract_json("{\"x\": [1, 2]}").unwrap();
        assert_eq!(v["x"][1], 2);
    }

    #[test]
    fn garbage_is_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{broken").is_none());
    }
}
