//! The `manage_tasks` tool: the model-facing surface of the persistent
//! scheduler. The scheduler itself lives in the gateway; this tool talks
//! to it through the [`TaskScheduler`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use ghost_domain::chat::ToolDefinition;
use ghost_domain::Result;
use serde_json::Value;

use crate::{opt_str, require_str, Tool};

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Register a recurring job; returns its id.
    async fn create(&self, name: &str, trigger: &str, prompt: &str) -> Result<String>;

    /// Human-readable listing of every registered job.
    async fn list(&self) -> Result<String>;

    async fn stop(&self, id: &str) -> Result<bool>;

    /// Returns how many jobs were removed.
    async fn stop_all(&self) -> Result<usize>;
}

pub struct ManageTasksTool {
    pub scheduler: Arc<dyn TaskScheduler>,
}

#[async_trait]
impl Tool for ManageTasksTool {
    fn name(&self) -> &'static str {
        "manage_tasks"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "manage_tasks".into(),
            description: "Consolidated task manager (create, list, stop, stop_all).".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["create", "list", "stop", "stop_all"]},
                    "task_name": {
                        "type": "string",
                        "description": "A short name for the task (required for 'create')."
                    },
                    "cron_expression": {
                        "type": "string",
                        "description": "Standard cron format OR 'interval:seconds' (e.g., \
                                        'interval:60' for every minute). Required for 'create'."
                    },
                    "prompt": {
                        "type": "string",
                        "description": "The instruction the background agent should execute \
                                        (required for 'create')."
                    },
                    "task_identifier": {
                        "type": "string",
                        "description": "The ID of the task to kill (required for 'stop')."
                    }
                },
                "required": ["action"]
            }),
        }
    }

    fn mutates(&self, _args: &Value) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let action = match require_str(&args, "action") {
            Ok(a) => a,
            Err(e) => return e,
        };
        match action {
            "create" => {
                let name = match require_str(&args, "task_name") {
                    Ok(n) => n,
                    Err(e) => return e,
                };
                let trigger = match require_str(&args, "cron_expression") {
                    Ok(t) => t,
                    Err(e) => return e,
                };
                let prompt = match require_str(&args, "prompt") {
                    Ok(p) => p,
                    Err(e) => return e,
                };
                match self.scheduler.create(name, trigger, prompt).await {
                    Ok(id) => format!("SUCCESS: Scheduled task '{name}' with id {id}."),
                    Err(e) => format!("Error: could not schedule task: {e}"),
                }
            }
            "list" => match self.scheduler.list().await {
                Ok(listing) => listing,
                Err(e) => format!("Error: {e}"),
            },
            "stop" => {
                let id = match opt_str(&args, "task_identifier") {
                    Some(id) => id,
                    None => return "Error: required argument 'task_identifier' is missing.".into(),
                };
                match self.scheduler.stop(id).await {
                    Ok(true) => format!("SUCCESS: Stopped task {id}."),
                    Ok(false) => format!("Error: no task with id {id}."),
                    Err(e) => format!("Error: {e}"),
                }
            }
            "stop_all" => match self.scheduler.stop_all().await {
                Ok(n) => format!("SUCCESS: Stopped {n} task(s)."),
                Err(e) => format!("Error: {e}"),
            },
            other => format!("Error: Unknown action '{other}'"),
        }
    }
}
