//! The `execute` tool: sanitized script execution inside the sandbox.
//!
//! The sandbox itself (container lifecycle, image bootstrap) is an
//! external collaborator behind the [`Sandbox`] trait; this tool owns
//! validation, sanitization, script placement, and result formatting.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use ghost_domain::chat::ToolDefinition;
use ghost_domain::Result;
use regex::Regex;
use serde_json::Value;

use crate::paths::safe_path;
use crate::sanitize::{find_forbidden_import, sanitize_code};
use crate::{opt_str, require_str, Tool};

/// Default command timeout inside the sandbox.
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

static TRACEBACK_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Command execution inside the isolated workspace. Returns the combined
/// output and the exit code.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<(String, i32)>;
}

/// Minimal quoting for arguments handed to the sandbox shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result formatting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn format_result(exit_code: i32, output: &str, hint: Option<&str>) -> String {
    let mut out = format!("--- EXECUTION RESULT ---\nEXIT CODE: {exit_code}\nSTDOUT/STDERR:\n{output}");
    if let Some(hint) = hint {
        out.push_str(&format!(
            "\n\n--- DIAGNOSTIC HINT ---\n{hint}\n------------------------"
        ));
    }
    out
}

fn format_error(msg: &str) -> String {
    format_result(1, msg, None)
}

/// Pull the failing line from a traceback and quote the surrounding code.
fn diagnostic_hint(output: &str, rel_path: &str, code: &str) -> Option<String> {
    let locations: Vec<(String, usize)> = TRACEBACK_LOCATION
        .captures_iter(output)
        .filter_map(|caps| {
            let file = caps[1].to_string();
            let line: usize = caps[2].parse().ok()?;
            Some((file, line))
        })
        .collect();
    if locations.is_empty() {
        return None;
    }

    // Prefer frames inside the script itself over library internals.
    let line_num = locations
        .iter()
        .rev()
        .find(|(file, _)| {
            file.contains(rel_path) || file.contains("/workspace/") || file.starts_with("./")
        })
        .or_else(|| locations.last())
        .map(|(_, line)| *line)?;

    let lines: Vec<&str> = code.lines().collect();
    let start = line_num.saturating_sub(3);
    let end = (line_num + 2).min(lines.len());
    let snippet: Vec<String> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| *i >= start && *i < end)
        .map(|(i, l)| format!("{}: {}", i + 1, l))
        .collect();

    Some(format!(
        "Error detected at Line {line_num}:\n{}\n\nSUGGESTION: Review the snippet above line {line_num}.",
        snippet.join("\n")
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ExecuteTool {
    pub sandbox_dir: PathBuf,
    pub sandbox: Arc<dyn Sandbox>,
}

impl ExecuteTool {
    pub fn new(sandbox_dir: PathBuf, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox_dir,
            sandbox,
        }
    }
}

#[async_trait]
impl Tool for ExecuteTool {
    fn name(&self) -> &'static str {
        "execute"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "execute".into(),
            description: "Run Python or Shell code. USE THIS ONLY AS A LAST RESORT for custom \
                          math, logic, or formatting. DO NOT use this to download files (use \
                          file_system), scrape the web, or manage memory. Native tools CANNOT \
                          be imported in Python. ALWAYS print results."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "filename": {
                        "type": "string",
                        "description": "The script filename. MUST end in .py, .sh, or .js"
                    },
                    "content": {"type": "string"},
                    "args": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Optional command line arguments passed to the script."
                    }
                },
                "required": ["filename", "content"]
            }),
        }
    }

    fn mutates(&self, _args: &Value) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let filename = match require_str(&args, "filename") {
            Ok(f) => f,
            Err(e) => return format_error(&e),
        };
        let raw_content = opt_str(&args, "content").unwrap_or("");

        let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();
        if !["py", "sh", "js"].contains(&ext.as_str()) {
            tracing::warn!(filename, "execution blocked: invalid extension");
            return format_error(
                "SYSTEM ERROR: The 'execute' tool is ONLY for running scripts (.py, .sh, .js).\n\
                 SYSTEM TIP: To save data files, use file_system(operation='write') instead.",
            );
        }

        let content = sanitize_code(raw_content);
        if content.is_empty() {
            return format_error("Error: the script content is empty.");
        }

        if ext == "py" {
            if let Some(module) = find_forbidden_import(&content) {
                tracing::warn!(module, "blocked hallucinated native-tool import");
                return format_error(&format!(
                    "SYSTEM ERROR: FORBIDDEN IMPORT DETECTED -> '{module}'\n\
                     CRITICAL: '{module}' is a Native JSON Tool, NOT a Python module.\n\
                     To use '{module}', stop writing code and call the JSON tool directly!"
                ));
            }
        }

        let rel_path = filename.trim_start_matches('/').to_string();
        let host_path = match safe_path(&self.sandbox_dir, filename) {
            Ok(p) => p,
            Err(e) => return format_error(&e),
        };

        // Stubbornness guard: resubmitting the byte-identical failing
        // script is rejected without burning a sandbox run.
        if host_path.exists() {
            if let Ok(meta) = host_path.metadata() {
                if meta.len() < 1_000_000 {
                    if let Ok(existing) = std::fs::read_to_string(&host_path) {
                        let squash = |s: &str| s.split_whitespace().collect::<String>();
                        if squash(&existing) == squash(&content) {
                            return format_error(
                                "SYSTEM ERROR: EXACT SAME CODE SUBMITTED. Change your logic.",
                            );
                        }
                    }
                }
            }
        }

        if let Some(parent) = host_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return format_error(&format!("Error writing script: {e}"));
            }
        }
        if let Err(e) = tokio::fs::write(&host_path, &content).await {
            return format_error(&format!("Error writing script: {e}"));
        }

        let runner = match ext.as_str() {
            "py" => "python3 -u",
            "js" => "node",
            _ => "bash",
        };
        let mut cmd = format!("{runner} {rel_path}");
        if let Some(extra) = args.get("args").and_then(|v| v.as_array()) {
            for arg in extra {
                let text = match arg {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                cmd.push(' ');
                cmd.push_str(&shell_quote(&text));
            }
        }

        tracing::info!(filename, "executing script in sandbox");
        match self.sandbox.execute(&cmd, EXEC_TIMEOUT).await {
            Ok((output, exit_code)) => {
                let hint = if exit_code != 0 {
                    diagnostic_hint(&output, &rel_path, &content)
                } else {
                    None
                };
                format_result(exit_code, &output, hint.as_deref())
            }
            Err(e) => format_error(&format!("Error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSandbox {
        output: String,
        exit_code: i32,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn execute(&self, _command: &str, _timeout: Duration) -> Result<(String, i32)> {
            Ok((self.output.clone(), self.exit_code))
        }
    }

    fn tool(output: &str, exit_code: i32) -> (tempfile::TempDir, ExecuteTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecuteTool::new(
            dir.path().to_path_buf(),
            Arc::new(FakeSandbox {
                output: output.into(),
                exit_code,
            }),
        );
        (dir, tool)
    }

    #[tokio::test]
    async fn success_reports_exit_code_zero() {
        let (_dir, tool) = tool("42\n", 0);
        let out = tool
            .run(serde_json::json!({"filename": "calc.py", "content": "print(42)"}))
            .await;
        assert!(out.contains("EXIT CODE: 0"));
        assert!(out.contains("42"));
    }

    #[tokio::test]
    async fn invalid_extension_is_blocked() {
        let (_dir, tool) = tool("", 0);
        let out = tool
            .run(serde_json::json!({"filename": "data.csv", "content": "a,b"}))
            .await;
        assert!(out.contains("EXIT CODE: 1"));
        assert!(out.contains("ONLY for running scripts"));
    }

    #[tokio::test]
    async fn forbidden_import_is_blocked_before_execution() {
        let (_dir, tool) = tool("should not run", 0);
        let out = tool
            .run(serde_json::json!({"filename": "x.py", "content": "import web_search"}))
            .await;
        assert!(out.contains("FORBIDDEN IMPORT"));
        assert!(!out.contains("should not run"));
    }

    #[tokio::test]
    async fn identical_resubmission_is_rejected() {
        let (_dir, tool) = tool("ok", 0);
        let payload = serde_json::json!({"filename": "s.py", "content": "print( 1 )"});
        tool.run(payload.clone()).await;
        let out = tool
            .run(serde_json::json!({"filename": "s.py", "content": "print(1)"}))
            .await;
        assert!(out.contains("EXACT SAME CODE SUBMITTED"));
    }

    #[tokio::test]
    async fn markdown_fences_are_stripped_before_writing() {
        let (dir, tool) = tool("ok", 0);
        tool.run(serde_json::json!({
            "filename": "f.py",
            "content": "```python\nprint('fenced')\n```"
        }))
        .await;
        let written = std::fs::read_to_string(dir.path().join("f.py")).unwrap();
        assert_eq!(written, "print('fenced')");
    }

    #[tokio::test]
    async fn failure_includes_diagnostic_snippet() {
        let traceback = "Traceback (most recent call last):\n  File \"f.py\", line 2, in <module>\nZeroDivisionError";
        let (_dir, tool) = tool(traceback, 1);
        let out = tool
            .run(serde_json::json!({"filename": "f.py", "content": "x = 1\ny = x / 0\nprint(y)"}))
            .await;
        assert!(out.contains("EXIT CODE: 1"));
        assert!(out.contains("DIAGNOSTIC HINT"));
        assert!(out.contains("Line 2"));
        assert!(out.contains("2: y = x / 0"));
    }

    #[test]
    fn quoting_wraps_unsafe_args() {
        assert_eq!(shell_quote("plain-arg.txt"), "plain-arg.txt");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
