//! The tool surface: one trait, one registry, and every tool the model can
//! call. Tool failures are strings, never errors: whatever happens inside
//! a tool must come back as assistant-visible text.

pub mod db;
pub mod exec;
pub mod fs;
pub mod memory_tools;
pub mod misc;
pub mod paths;
pub mod registry;
pub mod sanitize;
pub mod search;
pub mod swarm;
pub mod system;
pub mod tasks;
pub mod tor;

use async_trait::async_trait;
use ghost_domain::chat::ToolDefinition;
use serde_json::Value;

pub use registry::ToolRegistry;
pub use search::{SearchHit, SearchProvider};
pub use tasks::TaskScheduler;

/// One callable tool.
///
/// `run` receives the parsed argument object and always returns a result
/// string; error strings carry an `Error:` prefix so the dispatcher can
/// count failures.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    /// The JSON-Schema definition advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Whether this invocation mutates shared state. Mutations clear the
    /// redundancy set and invalidate the cached sandbox listing.
    fn mutates(&self, _args: &Value) -> bool {
        false
    }

    /// Whether results are already condensed (skip worker summarization).
    fn condensed(&self) -> bool {
        false
    }

    async fn run(&self, args: Value) -> String;
}

/// Read a required string argument or produce the standard error string.
pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("Error: required argument '{key}' is missing."))
}

pub(crate) fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}
