//! Scrubbing of model-emitted control tokens and planning artifacts.
//!
//! Applied to every assistant content fragment and to the final assembled
//! response. Local models leak their chat template with some regularity;
//! none of it may reach the client.

use std::sync::LazyLock;

use regex::Regex;

/// A leading fragment of any of these means the system prompt is bleeding
/// into the answer; everything from the marker onward is dropped.
const BLEED_MARKERS: &[&str] = &[
    "# Tools",
    "<tools>",
    "CRITICAL INSTRUCTION:",
    "You may call one or more functions",
    "{\"type\": \"function\"",
];

static TOOL_CALL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tool_call>.*?</tool_call>").unwrap());
static TOOL_RESPONSE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tool_response>.*?(?:</tool_response>|$)").unwrap());
static EXECUTION_BANNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)--- EXECUTION RESULT ---.*?(?:------------------------|$)").unwrap()
});
static TREE_EMOJI_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:🔄|🟢|⏳|✅|❌|🛑|➖)\s*\[.*?\].*?\n?").unwrap()
});
static TREE_STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^.*?\((?:IN_PROGRESS|READY|PENDING|DONE|FAILED|BLOCKED)\)\s*\n?").unwrap()
});
static TREE_ID_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:\[)?task_\d+(?:\])?\s*\n?").unwrap());
static PLAN_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:FOCUS TASK|ACTIVE STRATEGY & PLAN|PLAN|THOUGHT):\s*").unwrap()
});

/// Remove leaked prompt text, tool-call tags, execution banners, rendered
/// task-tree lines, and planning headers. Idempotent: scrubbing an already
/// scrubbed string is a no-op.
pub fn scrub(text: &str) -> String {
    let mut out = text.to_string();

    for marker in BLEED_MARKERS {
        if let Some(pos) = out.find(marker) {
            out.truncate(pos);
        }
    }

    out = TOOL_CALL_BLOCK.replace_all(&out, "").into_owned();
    out = TOOL_RESPONSE_BLOCK.replace_all(&out, "").into_owned();
    out = EXECUTION_BANNER.replace_all(&out, "").into_owned();
    out = TREE_EMOJI_LINE.replace_all(&out, "").into_owned();
    out = TREE_STATUS_LINE.replace_all(&out, "").into_owned();
    out = TREE_ID_LINE.replace_all(&out, "").into_owned();
    out = PLAN_HEADER.replace_all(&out, "").into_owned();

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tool_call_blocks() {
        let input = "Here you go.<tool_call>{\"name\":\"recall\"}</tool_call> Done.";
        assert_eq!(scrub(input), "Here you go. Done.");
    }

    #[test]
    fn strips_unterminated_tool_response() {
        let input = "Answer.\n<tool_response>partial output that never closes";
        assert_eq!(scrub(input), "Answer.");
    }

    #[test]
    fn truncates_at_bleed_marker() {
        let input = "The capital is Paris.\n# Tools\nYou may call one or more functions";
        assert_eq!(scrub(input), "The capital is Paris.");
    }

    #[test]
    fn strips_rendered_task_tree() {
        let input = "Summary done.\n[task_1]\nCollect data (DONE)\n✅ [task_2] fetch\nrest";
        let out = scrub(input);
        assert!(!out.contains("task_1"));
        assert!(!out.contains("DONE"));
        assert!(out.contains("Summary done."));
        assert!(out.contains("rest"));
    }

    #[test]
    fn strips_planning_headers() {
        let input = "THOUGHT: I should answer now.\nParis.";
        let out = scrub(input);
        assert!(out.starts_with("I should answer now."));
    }

    #[test]
    fn strips_execution_banner() {
        let input =
            "ok\n--- EXECUTION RESULT ---\nEXIT CODE: 0\nSTDOUT/STDERR:\nhi\n------------------------\nafter";
        let out = scrub(input);
        assert!(!out.contains("EXIT CODE"));
        assert!(out.contains("ok"));
        assert!(out.contains("after"));
    }

    #[test]
    fn idempotent_on_arbitrary_inputs() {
        // scrub(scrub(x)) == scrub(x).
        let samples = [
            "plain text",
            "",
            "<tool_call>{}</tool_call>",
            "a # Tools b <tool_call>x</tool_call>",
            "THOUGHT: x\nPLAN:\n[task_3]\nstep (PENDING)\n",
            "nested <tool_response>inner <tool_call>deep</tool_call>",
            "--- EXECUTION RESULT ---\ntruncated tail",
            "✅ [t] ok\n🛑 [u] blocked\nkeep me",
        ];
        for s in samples {
            let once = scrub(s);
            assert_eq!(scrub(&once), once, "not idempotent for {s:?}");
        }
    }
}
