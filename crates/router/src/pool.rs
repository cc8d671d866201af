//! Node pools: per-class endpoint groups with round-robin selection state.

use std::sync::atomic::{AtomicUsize, Ordering};

use ghost_domain::config::NodeSpec;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool classes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Main,
    /// The swarm cluster: planner calls and delegated swarm workers.
    Planner,
    Worker,
    Vision,
    Coding,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Main => "main",
            PoolKind::Planner => "planner",
            PoolKind::Worker => "worker",
            PoolKind::Vision => "vision",
            PoolKind::Coding => "coding",
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Nodes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One upstream endpoint with its dedicated keep-alive HTTP client.
pub struct UpstreamNode {
    pub base_url: String,
    pub model_label: String,
    pub client: reqwest::Client,
}

impl UpstreamNode {
    pub fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A class of nodes sharing one round-robin cursor.
pub struct NodePool {
    pub kind: PoolKind,
    nodes: Vec<UpstreamNode>,
    cursor: AtomicUsize,
}

impl NodePool {
    pub fn new(kind: PoolKind, specs: &[NodeSpec], client_for: impl Fn(&NodeSpec) -> reqwest::Client) -> Self {
        let nodes = specs
            .iter()
            .map(|spec| UpstreamNode {
                base_url: spec.url.clone(),
                model_label: spec.model.clone(),
                client: client_for(spec),
            })
            .collect();
        Self {
            kind,
            nodes,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: usize) -> &UpstreamNode {
        &self.nodes[idx]
    }

    /// Pick one node: the first whose label contains the hint
    /// (case-insensitive), otherwise advance the round-robin cursor.
    pub fn select(&self, model_hint: Option<&str>) -> Option<&UpstreamNode> {
        self.attempt_order(model_hint).first().map(|&i| &self.nodes[i])
    }

    /// The full dispatch order for one call: affinity match first when a
    /// hint is given, then every remaining node in round-robin order. Each
    /// node appears exactly once. Calling this advances the cursor.
    pub fn attempt_order(&self, model_hint: Option<&str>) -> Vec<usize> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let affinity = model_hint.and_then(|hint| {
            let hint = hint.to_lowercase();
            self.nodes
                .iter()
                .position(|n| n.model_label.to_lowercase().contains(&hint))
        });

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        let mut order: Vec<usize> = Vec::with_capacity(self.nodes.len());
        if let Some(idx) = affinity {
            order.push(idx);
        }
        for offset in 0..self.nodes.len() {
            let idx = (start + offset) % self.nodes.len();
            if !order.contains(&idx) {
                order.push(idx);
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(labels: &[&str]) -> NodePool {
        let specs: Vec<NodeSpec> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| NodeSpec {
                url: format!("http://10.0.0.{i}:8080"),
                model: label.to_string(),
            })
            .collect();
        NodePool::new(PoolKind::Worker, &specs, |_| reqwest::Client::new())
    }

    #[test]
    fn round_robin_advances_per_call() {
        let p = pool(&["a", "b", "c"]);
        assert_eq!(p.attempt_order(None), vec![0, 1, 2]);
        assert_eq!(p.attempt_order(None), vec![1, 2, 0]);
        assert_eq!(p.attempt_order(None), vec![2, 0, 1]);
        assert_eq!(p.attempt_order(None), vec![0, 1, 2]);
    }

    #[test]
    fn model_hint_wins_case_insensitively() {
        let p = pool(&["Qwen3-4B", "Phi-4-mini", "Gemma-3"]);
        let order = p.attempt_order(Some("phi"));
        assert_eq!(order[0], 1);
        // Every node still appears exactly once.
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn unmatched_hint_falls_back_to_round_robin() {
        let p = pool(&["a", "b"]);
        assert_eq!(p.attempt_order(Some("zzz")), vec![0, 1]);
    }

    #[test]
    fn empty_pool_yields_no_attempts() {
        let p = pool(&[]);
        assert!(p.attempt_order(None).is_empty());
        assert!(p.select(None).is_none());
    }
}
