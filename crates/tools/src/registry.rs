//! Registry of named tools. Model-facing schemas are emitted from here,
//! never handwritten at the call site.

use std::collections::HashMap;
use std::sync::Arc;

use ghost_domain::chat::ToolDefinition;

use crate::Tool;

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    order: Vec<&'static str>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        if self.tools.insert(name, tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.order.iter().copied()
    }

    /// All advertised definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.definition())
            .collect()
    }

    /// The definition array narrowed to a single tool, used when the
    /// planner pins `required_tool`. Falls back to the full set when the
    /// name is unknown.
    pub fn narrowed_definitions(&self, name: &str) -> Vec<ToolDefinition> {
        match self.tools.get(name) {
            Some(tool) => vec![tool.definition()],
            None => self.definitions(),
        }
    }
}
