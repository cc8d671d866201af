//! Task tree: the typed plan DAG the planner maintains across turns.
//!
//! Planner updates are partial JSON trees merged structurally; node
//! identity is stable across merges, `DONE` is terminal, and a `FAILED`
//! node blocks every ancestor that is not already done.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Done,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Parse a planner-emitted status string; anything unrecognized
    /// normalizes to `PENDING`.
    pub fn parse(raw: &str) -> TaskStatus {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => TaskStatus::Pending,
            "READY" => TaskStatus::Ready,
            "IN_PROGRESS" => TaskStatus::InProgress,
            "DONE" => TaskStatus::Done,
            "FAILED" => TaskStatus::Failed,
            "BLOCKED" => TaskStatus::Blocked,
            _ => TaskStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Blocked => "BLOCKED",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Nodes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tree
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct TaskTree {
    pub root_id: Option<String>,
    pub nodes: HashMap<String, TaskNode>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    /// True once the root exists and is `DONE`.
    pub fn root_done(&self) -> bool {
        self.root_id
            .as_deref()
            .and_then(|id| self.status(id))
            .map(|s| s == TaskStatus::Done)
            .unwrap_or(false)
    }

    /// Set a node's status and run failure propagation. Transitions out of
    /// `DONE` are ignored.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) {
        if let Some(node) = self.nodes.get_mut(id) {
            if node.status != TaskStatus::Done {
                node.status = status;
            }
        }
        self.propagate_failures();
    }

    /// Merge a planner-emitted tree update.
    ///
    /// Accepts either the nested `{id, description?, status?, children: [..]}`
    /// shape or the flat `{root_id, nodes: {id: node}}` shape. Referenced
    /// nodes are patched in place (fields absent from the update are
    /// preserved); unknown ids are created. Children ordering from the
    /// update wins.
    pub fn merge(&mut self, update: &Value) {
        if let Some(nodes) = update.get("nodes").and_then(|v| v.as_object()) {
            // Flat shape.
            if let Some(root) = update.get("root_id").and_then(|v| v.as_str()) {
                self.root_id.get_or_insert_with(|| root.to_string());
            }
            for (id, node_val) in nodes {
                self.patch_node(id, node_val);
                let child_ids = Self::child_ids(node_val);
                if !child_ids.is_empty() {
                    if let Some(node) = self.nodes.get_mut(id) {
                        node.children = child_ids;
                    }
                }
            }
            self.propagate_failures();
            return;
        }

        // Nested shape.
        if update.get("id").and_then(|v| v.as_str()).is_some() {
            let root_id = self.merge_nested(update);
            if self.root_id.is_none() {
                self.root_id = root_id;
            }
        }
        self.propagate_failures();
    }

    fn merge_nested(&mut self, node_val: &Value) -> Option<String> {
        let id = node_val.get("id")?.as_str()?.to_string();
        self.patch_node(&id, node_val);

        if let Some(children) = node_val.get("children").and_then(|v| v.as_array()) {
            let mut ordered: Vec<String> = Vec::new();
            for child in children {
                let child_id = match child {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => self.merge_nested(child),
                    _ => None,
                };
                if let Some(child_id) = child_id {
                    if !ordered.contains(&child_id) {
                        ordered.push(child_id);
                    }
                }
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                node.children = ordered;
            }
        }
        Some(id)
    }

    /// Patch one node from its JSON value, creating it if absent.
    /// `DONE` is sticky: a status field in the update cannot demote it.
    fn patch_node(&mut self, id: &str, node_val: &Value) {
        let description = node_val
            .get("description")
            .and_then(|v| v.as_str())
            .map(String::from);
        let status = node_val
            .get("status")
            .and_then(|v| v.as_str())
            .map(TaskStatus::parse);

        match self.nodes.get_mut(id) {
            Some(node) => {
                if let Some(description) = description {
                    node.description = description;
                }
                if let Some(status) = status {
                    if node.status != TaskStatus::Done {
                        node.status = status;
                    }
                }
            }
            None => {
                self.nodes.insert(
                    id.to_string(),
                    TaskNode {
                        id: id.to_string(),
                        description: description.unwrap_or_default(),
                        status: status.unwrap_or(TaskStatus::Pending),
                        children: Vec::new(),
                        result_summary: None,
                    },
                );
            }
        }
    }

    fn child_ids(node_val: &Value) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(children) = node_val.get("children").and_then(|v| v.as_array()) {
            for child in children {
                let id = match child {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(o) => o.get("id").and_then(|v| v.as_str()).map(String::from),
                    _ => None,
                };
                if let Some(id) = id {
                    if !out.contains(&id) {
                        out.push(id);
                    }
                }
            }
        }
        out
    }

    /// Mark every ancestor of a `FAILED` node `BLOCKED`, unless the
    /// ancestor is already `DONE`.
    fn propagate_failures(&mut self) {
        let mut parent_of: HashMap<String, String> = HashMap::new();
        for node in self.nodes.values() {
            for child in &node.children {
                parent_of.insert(child.clone(), node.id.clone());
            }
        }

        let failed: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.status == TaskStatus::Failed)
            .map(|n| n.id.clone())
            .collect();

        for id in failed {
            let mut cursor = parent_of.get(&id).cloned();
            let mut hops = 0;
            while let Some(ancestor_id) = cursor {
                // Cycle guard; planner output is not trusted to be acyclic.
                hops += 1;
                if hops > self.nodes.len() {
                    break;
                }
                if let Some(ancestor) = self.nodes.get_mut(&ancestor_id) {
                    if ancestor.status != TaskStatus::Done {
                        ancestor.status = TaskStatus::Blocked;
                    }
                }
                cursor = parent_of.get(&ancestor_id).cloned();
            }
        }
    }

    /// Depth-indented plan rendering for the transient injection.
    pub fn render(&self) -> String {
        let Some(root_id) = self.root_id.as_deref() else {
            return "No plan yet.".into();
        };
        let mut lines = Vec::new();
        self.render_node(root_id, 0, &mut lines, &mut Vec::new());
        lines.join("\n")
    }

    fn render_node(&self, id: &str, depth: usize, lines: &mut Vec<String>, seen: &mut Vec<String>) {
        if seen.iter().any(|s| s == id) {
            return;
        }
        seen.push(id.to_string());
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        lines.push(format!(
            "{}[{}] {} ({})",
            "  ".repeat(depth),
            node.id,
            node.description,
            node.status.as_str()
        ));
        for child in &node.children {
            self.render_node(child, depth + 1, lines, seen);
        }
    }

    /// Flat JSON form, the shape fed back to the planner each turn.
    pub fn to_json(&self) -> Value {
        let nodes: serde_json::Map<String, Value> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), serde_json::to_value(node).unwrap_or(Value::Null)))
            .collect();
        serde_json::json!({
            "root_id": self.root_id,
            "nodes": nodes,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded_tree() -> TaskTree {
        let mut tree = TaskTree::new();
        tree.merge(&json!({
            "id": "root-1",
            "description": "Root Task",
            "status": "PENDING",
            "children": [
                {"id": "child-1", "description": "Child Task", "status": "PENDING"}
            ]
        }));
        tree
    }

    #[test]
    fn merge_patches_in_place_and_preserves_extra_fields() {
        let mut tree = seeded_tree();
        tree.nodes.get_mut("child-1").unwrap().result_summary = Some("Original Result".into());

        tree.merge(&json!({
            "id": "root-1",
            "description": "Root Task Updated",
            "status": "IN_PROGRESS",
            "children": [
                {"id": "child-1", "description": "Child Task", "status": "DONE"},
                {"id": "new-child", "description": "New Child Task", "status": "PENDING"}
            ]
        }));

        let child = &tree.nodes["child-1"];
        assert_eq!(child.result_summary.as_deref(), Some("Original Result"));
        assert_eq!(child.status, TaskStatus::Done);
        assert_eq!(tree.nodes["root-1"].description, "Root Task Updated");
        assert_eq!(tree.nodes["root-1"].status, TaskStatus::InProgress);
        assert!(tree.nodes.contains_key("new-child"));

        let children = &tree.nodes["root-1"].children;
        assert_eq!(children, &["child-1".to_string(), "new-child".to_string()]);
    }

    #[test]
    fn merge_accepts_flat_shape() {
        let mut tree = TaskTree::new();
        tree.merge(&json!({
            "root_id": "root-123",
            "nodes": {
                "root-123": {"id": "root-123", "description": "Main Task", "status": "DONE", "children": []}
            }
        }));
        assert_eq!(tree.root_id.as_deref(), Some("root-123"));
        assert!(tree.root_done());
    }

    #[test]
    fn done_is_sticky_across_merges() {
        // No merge can transition a DONE node to a non-DONE status.
        let mut tree = seeded_tree();
        tree.merge(&json!({"id": "child-1", "status": "DONE"}));
        tree.merge(&json!({"id": "child-1", "status": "PENDING"}));
        assert_eq!(tree.status("child-1"), Some(TaskStatus::Done));

        tree.set_status("child-1", TaskStatus::Failed);
        assert_eq!(tree.status("child-1"), Some(TaskStatus::Done));
    }

    #[test]
    fn failure_blocks_ancestors_but_not_done_ones() {
        // After a FAILED leaf, every non-DONE ancestor is BLOCKED.
        let mut tree = TaskTree::new();
        tree.merge(&json!({
            "id": "r",
            "description": "root",
            "status": "IN_PROGRESS",
            "children": [
                {"id": "a", "description": "phase a", "status": "DONE", "children": [
                    {"id": "a1", "description": "done leaf", "status": "DONE"}
                ]},
                {"id": "b", "description": "phase b", "status": "IN_PROGRESS", "children": [
                    {"id": "b1", "description": "leaf", "status": "PENDING"}
                ]}
            ]
        }));

        tree.set_status("b1", TaskStatus::Failed);

        assert_eq!(tree.status("b1"), Some(TaskStatus::Failed));
        assert_eq!(tree.status("b"), Some(TaskStatus::Blocked));
        assert_eq!(tree.status("r"), Some(TaskStatus::Blocked));
        // DONE siblings and ancestors are never overwritten.
        assert_eq!(tree.status("a"), Some(TaskStatus::Done));
        assert_eq!(tree.status("a1"), Some(TaskStatus::Done));
    }

    #[test]
    fn unknown_status_normalizes_to_pending() {
        assert_eq!(TaskStatus::parse("WORKING_HARD"), TaskStatus::Pending);
        assert_eq!(TaskStatus::parse("done"), TaskStatus::Done);
        assert_eq!(TaskStatus::parse(" in_progress "), TaskStatus::InProgress);
    }

    #[test]
    fn render_is_depth_indented() {
        let tree = seeded_tree();
        let rendered = tree.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines[0].starts_with("[root-1] Root Task (PENDING)"));
        assert!(lines[1].starts_with("  [child-1]"));
    }

    #[test]
    fn render_survives_cycles() {
        let mut tree = seeded_tree();
        // Deliberately corrupt: child points back at root.
        tree.nodes.get_mut("child-1").unwrap().children = vec!["root-1".into()];
        let rendered = tree.render();
        assert_eq!(rendered.lines().count(), 2);
    }

    #[test]
    fn to_json_round_trips_through_merge() {
        let mut tree = seeded_tree();
        tree.set_status("child-1", TaskStatus::InProgress);
        let snapshot = tree.to_json();

        let mut restored = TaskTree::new();
        restored.merge(&snapshot);
        assert_eq!(restored.root_id.as_deref(), Some("root-1"));
        assert_eq!(restored.status("child-1"), Some(TaskStatus::InProgress));
        assert_eq!(restored.nodes["root-1"].children, vec!["child-1".to_string()]);
    }
}
