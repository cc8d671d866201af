//! Code sanitization applied before anything reaches the sandbox.
//!
//! Models wrap scripts in markdown fences, leak control characters, and
//! hallucinate imports of the native JSON tools; all of that is stripped
//! or rejected here.

use std::sync::LazyLock;

use regex::Regex;

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```[ \t]*(?:[a-zA-Z]+)?(?:[ \t]*\n|[ \t]+)?(.*?)```").unwrap()
});
/// Truncated fence: opening ticks with no closing ones.
static OPEN_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```[ \t]*(?:[a-zA-Z]+)?(?:[ \t]*\n|[ \t]+)?(.*)").unwrap()
});

/// Native tools the model keeps trying to `import` as Python modules.
const FORBIDDEN_MODULES: &[&str] = &[
    "knowledge_base",
    "system_utility",
    "file_system",
    "manage_tasks",
    "postgres_admin",
    "web_search",
    "fact_check",
    "deep_research",
];

/// Extract code from markdown fences when present, tolerating a missing
/// closing fence; stray backticks are stripped either way.
pub fn extract_code_from_markdown(text: &str) -> String {
    if let Some(caps) = FENCED_CODE.captures(text) {
        return caps[1].trim().trim_matches('`').to_string();
    }
    if let Some(caps) = OPEN_FENCE.captures(text) {
        return caps[1].trim().trim_matches('`').to_string();
    }
    text.trim().trim_matches('`').to_string()
}

/// Drop control characters other than `\n`, `\r`, `\t` (backspace
/// injection and friends).
pub fn scrub_control_chars(text: &str) -> String {
    text.chars()
        .filter(|&c| c >= ' ' || c == '\n' || c == '\r' || c == '\t')
        .collect()
}

/// Detect a hallucinated import of a native tool in Python code. Returns
/// the offending module name.
pub fn find_forbidden_import(code: &str) -> Option<&'static str> {
    for module in FORBIDDEN_MODULES {
        let import_re = Regex::new(&format!(r"\bimport\s+{module}\b")).unwrap();
        let from_re = Regex::new(&format!(r"\bfrom\s+{module}\s+import\b")).unwrap();
        let pip_re = Regex::new(&format!(r"pip\s+install\s+{module}\b")).unwrap();
        if import_re.is_match(code) || from_re.is_match(code) || pip_re.is_match(code) {
            return Some(module);
        }
    }
    None
}

/// Full pre-execution sanitization: fence extraction plus control-char
/// scrubbing plus a final trim.
pub fn sanitize_code(content: &str) -> String {
    let extracted = extract_code_from_markdown(content);
    scrub_control_chars(&extracted).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_python() {
        let code = extract_code_from_markdown("Here:\n```python\nprint('hi')\n```\nDone.");
        assert_eq!(code, "print('hi')");
    }

    #[test]
    fn extracts_truncated_fence() {
        let code = extract_code_from_markdown("```python\nprint('cut off");
        assert_eq!(code, "print('cut off");
    }

    #[test]
    fn mashed_fence_without_newline() {
        let code = extract_code_from_markdown("```python print('x')```");
        assert_eq!(code, "print('x')");
    }

    #[test]
    fn plain_code_passes_through() {
        assert_eq!(extract_code_from_markdown("print(1)"), "print(1)");
    }

    #[test]
    fn control_chars_are_scrubbed() {
        let dirty = "echo hi\x08\x08\x1b[31m\nok\tend";
        assert_eq!(scrub_control_chars(dirty), "echo hi[31m\nok\tend");
    }

    #[test]
    fn forbidden_imports_detected() {
        assert_eq!(
            find_forbidden_import("import web_search\nprint(1)"),
            Some("web_search")
        );
        assert_eq!(
            find_forbidden_import("from file_system import read"),
            Some("file_system")
        );
        assert_eq!(
            find_forbidden_import("os.system('pip install knowledge_base')"),
            Some("knowledge_base")
        );
        assert!(find_forbidden_import("import requests").is_none());
        // Substrings of real module names must not match.
        assert!(find_forbidden_import("import web_searcher").is_none());
    }
}
