//! Command-line interface. Flags mirror the deployed service exactly;
//! environment fallbacks: `GHOST_HOME`, `TOR_PROXY`, `GHOST_API_KEY`,
//! `GHOST_MODEL`, `GHOST_DEFAULT_DB`.

use std::path::PathBuf;

use clap::Parser;
use ghost_domain::config::{fix_url_scheme, parse_node_list, RuntimeConfig};

#[derive(Debug, Parser)]
#[command(name = "ghostd", about = "Ghost Agent: Autonomous AI Service")]
pub struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub upstream_url: String,

    /// Comma-separated list of url|model nodes (planner / swarm cluster).
    #[arg(long)]
    pub swarm_nodes: Option<String>,

    /// Comma-separated list of url|model nodes for background/edge tasks.
    #[arg(long)]
    pub worker_nodes: Option<String>,

    /// Comma-separated list of url|model nodes for vision models.
    #[arg(long)]
    pub visual_nodes: Option<String>,

    /// Comma-separated list of url|model nodes for code generation.
    #[arg(long)]
    pub coding_nodes: Option<String>,

    #[arg(long, env = "GHOST_MODEL", default_value = "Qwen3-8B-Instruct-2507")]
    pub model: String,

    #[arg(long, short = 't', default_value_t = 0.7)]
    pub temperature: f32,

    #[arg(long, default_value_t = 65_536)]
    pub max_context: usize,

    #[arg(long, env = "GHOST_API_KEY", default_value = "ghost-secret-123")]
    pub api_key: String,

    /// Default PostgreSQL URI for the DBA agent.
    #[arg(
        long,
        env = "GHOST_DEFAULT_DB",
        default_value = "postgresql://ghost@127.0.0.1:5432/agent"
    )]
    pub default_db: String,

    /// Smart-memory selectivity threshold; 0.0 disables the extractor.
    #[arg(long, default_value_t = 0.0)]
    pub smart_memory: f32,

    /// Always use anonymous search (Tor + DuckDuckGo).
    #[arg(long, default_value_t = true)]
    pub anonymous: bool,

    /// Enable proactive optimization suggestions after successful heavy tasks.
    #[arg(long)]
    pub perfect_it: bool,

    #[arg(long)]
    pub no_memory: bool,

    #[arg(long, short = 'd')]
    pub daemon: bool,

    #[arg(long)]
    pub debug: bool,

    /// Disable log truncation for debugging.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl Cli {
    /// Resolve flags + environment into the runtime configuration.
    pub fn into_config(self) -> RuntimeConfig {
        let base_dir = std::env::var("GHOST_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("ghost_llamacpp")
            });
        let tor_proxy = match std::env::var("TOR_PROXY") {
            Ok(v) if !v.is_empty() => Some(v),
            _ => Some("socks5://127.0.0.1:9050".into()),
        };

        RuntimeConfig {
            host: self.host,
            port: self.port,
            upstream_url: fix_url_scheme(&self.upstream_url),
            swarm_nodes: self.swarm_nodes.as_deref().map(parse_node_list).unwrap_or_default(),
            worker_nodes: self.worker_nodes.as_deref().map(parse_node_list).unwrap_or_default(),
            visual_nodes: self.visual_nodes.as_deref().map(parse_node_list).unwrap_or_default(),
            coding_nodes: self.coding_nodes.as_deref().map(parse_node_list).unwrap_or_default(),
            model: self.model,
            temperature: self.temperature,
            max_context: self.max_context,
            api_key: self.api_key,
            default_db: self.default_db,
            smart_memory: self.smart_memory,
            anonymous: self.anonymous,
            perfect_it: self.perfect_it,
            no_memory: self.no_memory,
            use_planning: true,
            daemon: self.daemon,
            debug: self.debug,
            verbose: self.verbose,
            tor_proxy,
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
    fn defaults_resolve() {
        let cli = Cli::parse_from(["ghostd"]);
        assert_eq!(cli.port, 8000);
        assert_eq!(cli.temperature, 0.7);
        assert!(!cli.perfect_it);
    }

    #[test]
    fn node_lists_parse_into_config() {
        let cli = Cli::parse_from([
            "ghostd",
            "--swarm-nodes",
            "http://10.0.0.1:8080|qwen3-4b,http://10.0.0.2:8080|phi-4",
            "--worker-nodes",
            "http:://10.0.0.3:8080|gemma",
        ]);
        let cfg = cli.into_config();
        assert_eq!(cfg.swarm_nodes.len(), 2);
        assert_eq!(cfg.worker_nodes[0].url, "http://10.0.0.3:8080");
    }

    #[test]
    fn flags_toggle() {
        let cli = Cli::parse_from(["ghostd", "--perfect-it", "--no-memory", "--smart-memory", "0.7"]);
        let cfg = cli.into_config();
        assert!(cfg.perfect_it);
        assert!(cfg.no_memory);
        assert!((cfg.smart_memory - 0.7).abs() < f32::EPSILON);
    }
}
