//! The unified `file_system` tool: list, read (raw, chunked, inspect),
//! exact search, write, download, copy, rename, move, delete, all inside
//! the sandbox.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use ghost_domain::chat::ToolDefinition;
use serde_json::Value;

use crate::paths::safe_path;
use crate::tor::{proxied_client, rotate_and_wait};
use crate::{opt_str, require_str, Tool};

/// Raw reads refuse files larger than this; chunked reading is required.
const RAW_READ_LIMIT: u64 = 150_000;
/// Default chunk size for `read_chunked`.
const DEFAULT_CHUNK: usize = 8000;
/// Download size ceiling.
const DOWNLOAD_LIMIT: u64 = 50_000_000;
/// Listing line cap.
const LISTING_CAP: usize = 200;

const MUTATING_OPS: &[&str] = &["write", "download", "delete", "move", "rename", "unzip", "git_clone"];

pub struct FileSystemTool {
    pub sandbox_dir: PathBuf,
    pub tor_proxy: Option<String>,
}

impl FileSystemTool {
    pub fn new(sandbox_dir: PathBuf, tor_proxy: Option<String>) -> Self {
        Self {
            sandbox_dir,
            tor_proxy,
        }
    }

    async fn op_read(&self, path: &str) -> String {
        if path.starts_with("http") {
            return "Error: you are trying to read a URL as a file. Use \
                    knowledge_base(action='ingest_document') instead."
                .into();
        }
        let target = match safe_path(&self.sandbox_dir, path) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if !target.exists() {
            return format!("Error: '{path}' not found.");
        }
        let size = target.metadata().map(|m| m.len()).unwrap_or(0);
        if size > RAW_READ_LIMIT {
            return format!(
                "Error: file '{path}' is too large to read entirely ({:.1} KB). Use \
                 operation='read_chunked' to read it page-by-page, operation='search' to find \
                 specific lines, or operation='inspect' for the first lines.",
                size as f64 / 1024.0
            );
        }
        match tokio::fs::read_to_string(&target).await {
            Ok(content) => content,
            Err(e) => format!("Error: {e}"),
        }
    }

    async fn op_read_chunked(&self, path: &str, page: usize, chunk_size: usize) -> String {
        let target = match safe_path(&self.sandbox_dir, path) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let content = match tokio::fs::read_to_string(&target).await {
            Ok(c) => c,
            Err(e) => return format!("Error: {e}"),
        };

        let chars: Vec<char> = content.chars().collect();
        let pages = chars.len().div_ceil(chunk_size).max(1);
        if page == 0 || page > pages {
            return format!("Error: page {page} is out of range (document has {pages} pages).");
        }
        let start = (page - 1) * chunk_size;
        let end = (start + chunk_size).min(chars.len());
        let body: String = chars[start..end].iter().collect();
        format!("[Page {page}/{pages} of '{path}']\n{body}")
    }

    async fn op_inspect(&self, path: &str) -> String {
        let target = match safe_path(&self.sandbox_dir, path) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let content = match tokio::fs::read_to_string(&target).await {
            Ok(c) => c,
            Err(e) => return format!("Error: {e}"),
        };
        let size = target.metadata().map(|m| m.len()).unwrap_or(0);
        let head: Vec<&str> = content.lines().take(50).collect();
        format!(
            "'{path}' ({size} bytes, {} lines). First lines:\n{}",
            content.lines().count(),
            head.join("\n")
        )
    }

    async fn op_search(&self, path: Option<&str>, pattern: &str) -> String {
        let pattern = pattern.trim_matches(|c| c == '\'' || c == '"');
        if pattern.is_empty() {
            return "Error: 'content' (search pattern) is required.".into();
        }

        let roots: Vec<PathBuf> = match path {
            Some(p) => match safe_path(&self.sandbox_dir, p) {
                Ok(resolved) => vec![resolved],
                Err(e) => return e,
            },
            None => vec![self.sandbox_dir.clone()],
        };

        let pattern = pattern.to_string();
        let pattern_for_task = pattern.clone();
        let result = tokio::task::spawn_blocking(move || {
            let pattern = pattern_for_task;
            let mut matches = Vec::new();
            let mut stack = roots;
            while let Some(entry) = stack.pop() {
                if matches.len() >= 100 {
                    break;
                }
                if entry.is_dir() {
                    if let Ok(read) = std::fs::read_dir(&entry) {
                        for child in read.flatten() {
                            let name = child.file_name().to_string_lossy().into_owned();
                            if !name.starts_with('.') {
                                stack.push(child.path());
                            }
                        }
                    }
                } else if let Ok(content) = std::fs::read_to_string(&entry) {
                    for (lineno, line) in content.lines().enumerate() {
                        if line.contains(&pattern) {
                            matches.push(format!("{}:{}: {}", entry.display(), lineno + 1, line));
                            if matches.len() >= 100 {
                                break;
                            }
                        }
                    }
                }
            }
            matches
        })
        .await;

        match result {
            Ok(matches) if matches.is_empty() => format!("No matches for '{pattern}'."),
            Ok(matches) => matches.join("\n"),
            Err(e) => format!("Error: search task failed: {e}"),
        }
    }

    async fn op_list_files(&self) -> String {
        let root = self.sandbox_dir.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut lines = Vec::new();
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                let Ok(read) = std::fs::read_dir(&dir) else {
                    continue;
                };
                let mut entries: Vec<_> = read.flatten().collect();
                entries.sort_by_key(|e| e.file_name());
                for entry in entries {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.')
                        || ["__pycache__", "node_modules", "venv", "env"].contains(&name.as_str())
                    {
                        continue;
                    }
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else {
                        let rel = path.strip_prefix(&root).unwrap_or(&path);
                        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
                        lines.push(format!("  {} ({size} bytes)", rel.display()));
                    }
                }
            }
            lines.sort();
            lines
        })
        .await
        .unwrap_or_default();

        let mut tree = if result.is_empty() {
            "[Empty]".to_string()
        } else {
            result[..result.len().min(LISTING_CAP)].join("\n")
        };
        if result.len() > LISTING_CAP {
            tree.push_str("\n  ... [Truncated for length]");
        }
        format!(
            "CURRENT SANDBOX DIRECTORY STRUCTURE:\n{tree}\n\n(Use these filenames for all file tools)"
        )
    }

    async fn op_write(&self, path: &str, content: Option<&Value>) -> String {
        let text = match content {
            None | Some(Value::Null) => {
                return format!(
                    "Error: the 'content' you provided for '{path}' is empty. You MUST provide \
                     the actual text to write."
                );
            }
            Some(Value::String(s)) if s.trim().is_empty() || s.trim().eq_ignore_ascii_case("none") => {
                return format!(
                    "Error: the 'content' you provided for '{path}' is empty. You MUST provide \
                     the actual text to write."
                );
            }
            Some(Value::String(s)) => s.clone(),
            // The model sometimes sends a JSON object instead of a string.
            Some(other) => serde_json::to_string_pretty(other).unwrap_or_default(),
        };

        let target = match safe_path(&self.sandbox_dir, path) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return format!("Error: {e}");
            }
        }
        match tokio::fs::write(&target, &text).await {
            Ok(_) => format!("SUCCESS: Wrote {} chars to '{path}'.", text.len()),
            Err(e) => format!("Error: {e}"),
        }
    }

    async fn op_download(&self, url: &str, path: &str) -> String {
        let target = match safe_path(&self.sandbox_dir, path) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let client = proxied_client(self.tor_proxy.as_deref(), Duration::from_secs(60));
        let via_tor = self.tor_proxy.is_some();
        let mut last_error = String::new();

        for attempt in 0..3 {
            tracing::info!(url, attempt, "downloading file");
            let resp = match client.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    if via_tor {
                        rotate_and_wait().await;
                    }
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if status != 200 {
                if matches!(status, 401 | 403 | 503) && via_tor {
                    rotate_and_wait().await;
                    continue;
                }
                return format!("Error {status} - Failed to download from {url}");
            }

            if let Some(len) = resp.content_length() {
                if len > DOWNLOAD_LIMIT {
                    return format!(
                        "Error: File is too large ({:.1}MB). Download limit is 50MB.",
                        len as f64 / 1_000_000.0
                    );
                }
            }

            if let Some(parent) = target.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let mut file = match tokio::fs::File::create(&target).await {
                Ok(f) => f,
                Err(e) => return format!("Error: {e}"),
            };
            let mut stream = resp.bytes_stream();
            let mut written: u64 = 0;
            let mut failed = false;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        written += bytes.len() as u64;
                        if written > DOWNLOAD_LIMIT {
                            return "Error: download exceeded the 50MB limit mid-stream.".into();
                        }
                        if let Err(e) =
                            tokio::io::AsyncWriteExt::write_all(&mut file, &bytes).await
                        {
                            return format!("Error: {e}");
                        }
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                if via_tor {
                    rotate_and_wait().await;
                }
                continue;
            }
            return format!("SUCCESS: Downloaded '{url}' to '{path}'.");
        }

        format!("Error: Failed after 3 attempts. Last error: {last_error}")
    }

    async fn op_copy_move(&self, op: &str, from: &str, to: &str) -> String {
        let src = match safe_path(&self.sandbox_dir, from) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let dst = match safe_path(&self.sandbox_dir, to) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if !src.exists() {
            return format!("Error: '{from}' not found.");
        }
        if let Some(parent) = dst.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = if op == "copy" {
            tokio::fs::copy(&src, &dst).await.map(|_| ())
        } else {
            tokio::fs::rename(&src, &dst).await
        };
        match result {
            Ok(_) => format!("SUCCESS: {op} '{from}' -> '{to}'."),
            Err(e) => format!("Error: {e}"),
        }
    }

    async fn op_delete(&self, path: &str) -> String {
        let target = match safe_path(&self.sandbox_dir, path) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if !target.exists() {
            return format!("Error: '{path}' not found.");
        }
        let result = if target.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(_) => format!("SUCCESS: Deleted '{path}'."),
            Err(e) => format!("Error: {e}"),
        }
    }
}

#[async_trait]
impl Tool for FileSystemTool {
    fn name(&self) -> &'static str {
        "file_system"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "file_system".into(),
            description: "Unified file manager. ALWAYS use this to list, read, write, DOWNLOAD, \
                          rename, move, or delete files. Do NOT write scripts for these tasks. \
                          Use operation='search' to find EXACT strings/lines inside a file."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "operation": {
                        "type": "string",
                        "enum": ["read", "read_chunked", "inspect", "search", "list_files",
                                 "write", "download", "copy", "rename", "move", "delete"],
                        "description": "The exact operation to perform."
                    },
                    "path": {
                        "type": "string",
                        "description": "Target file or directory, relative to the sandbox root."
                    },
                    "page": {
                        "type": "integer",
                        "description": "For read_chunked: 1-indexed page number."
                    },
                    "chunk_size": {
                        "type": "integer",
                        "description": "For read_chunked: characters per page (default 8000)."
                    },
                    "content": {
                        "type": "string",
                        "description": "For write: text to write. For search: exact pattern. \
                                        For rename/move/copy: the new path."
                    },
                    "url": {
                        "type": "string",
                        "description": "The URL to download (mandatory for operation='download')."
                    }
                },
                "required": ["operation", "path"]
            }),
        }
    }

    fn mutates(&self, args: &Value) -> bool {
        opt_str(args, "operation")
            .map(|op| MUTATING_OPS.contains(&op))
            .unwrap_or(false)
    }

    fn condensed(&self) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let operation = match require_str(&args, "operation") {
            Ok(op) => op,
            Err(e) => return e,
        };
        let path = opt_str(&args, "path").unwrap_or("");
        tracing::info!(operation, path, "file_system");

        match operation {
            "read" => self.op_read(path).await,
            "read_chunked" => {
                let page = args.get("page").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
                let chunk = args
                    .get("chunk_size")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize)
                    .unwrap_or(DEFAULT_CHUNK);
                self.op_read_chunked(path, page, chunk.max(1)).await
            }
            "inspect" => self.op_inspect(path).await,
            "search" => {
                let pattern = opt_str(&args, "content").unwrap_or("");
                let scope = if path.is_empty() { None } else { Some(path) };
                self.op_search(scope, pattern).await
            }
            "list_files" => self.op_list_files().await,
            "write" => self.op_write(path, args.get("content")).await,
            "download" => match require_str(&args, "url") {
                Ok(url) => self.op_download(url, path).await,
                Err(e) => e,
            },
            "copy" | "rename" | "move" => match require_str(&args, "content") {
                Ok(to) => {
                    let op = if operation == "copy" { "copy" } else { "move" };
                    self.op_copy_move(op, path, to).await
                }
                Err(_) => "Error: 'content' must hold the new filename or path.".into(),
            },
            "delete" => self.op_delete(path).await,
            other => format!("Error: Unknown operation '{other}'"),
        }
    }
}
