//! Runtime configuration: everything the CLI and environment provide,
//! resolved into absolute paths and parsed node lists.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One auxiliary upstream endpoint, as given on the command line:
/// `url|model_label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub url: String,
    pub model: String,
}

/// Repair the recurring `http:://` paste typo and trim.
pub fn fix_url_scheme(url: &str) -> String {
    url.trim()
        .replace("http:://", "http://")
        .replace("https:://", "https://")
}

/// Parse a comma-separated `url|model_label` list. Entries with an empty
/// url are skipped; a missing label defaults to `default`.
pub fn parse_node_list(raw: &str) -> Vec<NodeSpec> {
    raw.split(',')
        .filter_map(|entry| {
            let mut parts = entry.splitn(2, '|');
            let url = fix_url_scheme(parts.next().unwrap_or(""));
            if url.is_empty() {
                return None;
            }
            let model = parts
                .next()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "default".into());
            Some(NodeSpec { url, model })
        })
        .collect()
}

/// Fully resolved runtime configuration shared by every component.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,

    pub upstream_url: String,
    /// Planner-class nodes (the `--swarm-nodes` cluster).
    pub swarm_nodes: Vec<NodeSpec>,
    pub worker_nodes: Vec<NodeSpec>,
    pub visual_nodes: Vec<NodeSpec>,
    pub coding_nodes: Vec<NodeSpec>,

    pub model: String,
    pub temperature: f32,
    pub max_context: usize,

    pub api_key: String,
    pub default_db: String,
    /// Smart-memory selectivity threshold; 0.0 disables the extractor.
    pub smart_memory: f32,
    pub anonymous: bool,
    pub perfect_it: bool,
    pub no_memory: bool,
    pub use_planning: bool,

    pub daemon: bool,
    pub debug: bool,
    pub verbose: bool,

    /// SOCKS5 proxy for non-loopback traffic, from `TOR_PROXY`.
    pub tor_proxy: Option<String>,

    pub base_dir: PathBuf,
    pub sandbox_dir: PathBuf,
    pub memory_dir: PathBuf,
}

impl RuntimeConfig {
    /// Scheduler database path inside the memory directory.
    pub fn scheduler_db_path(&self) -> PathBuf {
        self.memory_dir.join("ghost.db")
    }

    pub fn has_vision_nodes(&self) -> bool {
        !self.visual_nodes.is_empty()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let base_dir = PathBuf::from(".");
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            upstream_url: "http://127.0.0.1:8080".into(),
            swarm_nodes: Vec::new(),
            worker_nodes: Vec::new(),
            visual_nodes: Vec::new(),
            coding_nodes: Vec::new(),
            model: "Qwen3-8B-Instruct-2507".into(),
            temperature: 0.7,
            max_context: 65_536,
            api_key: "ghost-secret-123".into(),
            default_db: "postgresql://ghost@127.0.0.1:5432/agent".into(),
            smart_memory: 0.0,
            anonymous: true,
            perfect_it: false,
            no_memory: false,
            use_planning: true,
            daemon: false,
            debug: false,
            verbose: false,
            tor_proxy: None,
            sandbox_dir: base_dir.join("sandbox"),
            memory_dir: base_dir.join("system").join("memory"),
            base_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_url_model_pairs() {
        let nodes = parse_node_list("http://10.0.0.1:8080|qwen3-4b, http://10.0.0.2:8080|phi-4");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].url, "http://10.0.0.1:8080");
        assert_eq!(nodes[0].model, "qwen3-4b");
        assert_eq!(nodes[1].model, "phi-4");
    }

    #[test]
    fn missing_label_defaults() {
        let nodes = parse_node_list("http://10.0.0.1:8080");
        assert_eq!(nodes[0].model, "default");
    }

    #[test]
    fn empty_entries_are_skipped() {
        let nodes = parse_node_list(",,http://10.0.0.1:8080|m,");
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn repairs_double_colon_scheme() {
        assert_eq!(fix_url_scheme("http:://host:1"), "http://host:1");
        assert_eq!(fix_url_scheme("https:://host:1"), "https://host:1");
        let nodes = parse_node_list("http:://10.0.0.1:8080|m");
        assert_eq!(nodes[0].url, "http://10.0.0.1:8080");
    }
}
