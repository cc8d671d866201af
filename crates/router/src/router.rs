//! The upstream router proper: dispatch, retry, and fallback policy.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use ghost_domain::chat::ChatPayload;
use ghost_domain::config::{NodeSpec, RuntimeConfig};
use ghost_domain::{Error, Result};
use serde_json::Value;

use crate::pool::{NodePool, PoolKind, UpstreamNode};

/// Transient retry attempts against the main upstream.
const MAIN_RETRY_ATTEMPTS: u32 = 10;
/// Backoff cap for chat calls, seconds.
const CHAT_BACKOFF_CAP: u64 = 30;
/// Backoff cap for embeddings calls, seconds.
const EMBED_BACKOFF_CAP: u64 = 20;

/// A boxed stream of raw response body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the reasoning loop and background workers see of the upstream
/// fabric. Tests script this trait directly.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Unary chat completion. The payload's `model` is rewritten to the
    /// selected node's label before sending.
    async fn chat(
        &self,
        payload: ChatPayload,
        class: PoolKind,
        model_hint: Option<&str>,
    ) -> Result<Value>;

    /// Streaming chat completion: the raw SSE byte stream from the chosen
    /// node, ownership transferred to the caller.
    async fn chat_stream(
        &self,
        payload: ChatPayload,
        class: PoolKind,
        model_hint: Option<&str>,
    ) -> Result<ByteStream>;

    /// Text embeddings from the main upstream.
    async fn embeddings(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Whether any node of the class is configured.
    fn has_pool(&self, class: PoolKind) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Backoff before retry `attempt` (0-based): `min(2^(attempt+1), cap)` seconds.
pub fn backoff_delay(attempt: u32, cap_secs: u64) -> Duration {
    let exp = (attempt + 1).min(16);
    Duration::from_secs((1u64 << exp).min(cap_secs))
}

/// Map a non-2xx response to the error taxonomy. A 400 whose body
/// mentions the context window becomes `ContextOverflow` so the caller
/// can run emergency recovery.
pub fn classify_status(pool: PoolKind, status: u16, body: &str) -> Error {
    if status == 400 && body.to_lowercase().contains("context") {
        return Error::ContextOverflow(format!("HTTP 400 - {body}"));
    }
    Error::Upstream {
        pool: pool.as_str().into(),
        message: format!("HTTP {status} - {body}"),
    }
}

fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

fn is_loopback_url(url: &str) -> bool {
    url.contains("127.0.0.1") || url.contains("localhost")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UpstreamRouter {
    pools: HashMap<PoolKind, NodePool>,
}

impl UpstreamRouter {
    /// Build every pool from the runtime configuration. When the main
    /// upstream is not on loopback and a SOCKS proxy is configured, all
    /// clients route through it.
    pub fn from_config(cfg: &RuntimeConfig) -> Result<Self> {
        let proxy_url = match (&cfg.tor_proxy, is_loopback_url(&cfg.upstream_url)) {
            (Some(proxy), false) => {
                let proxy = proxy.replace("socks5://", "socks5h://");
                tracing::info!(proxy = %proxy, "routing upstream traffic through SOCKS proxy");
                Some(proxy)
            }
            _ => None,
        };

        let build_client = |_spec: &NodeSpec| -> reqwest::Client {
            let mut builder = reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .pool_max_idle_per_host(5);
            if let Some(proxy) = &proxy_url {
                if let Ok(proxy) = reqwest::Proxy::all(proxy) {
                    builder = builder.proxy(proxy);
                }
            }
            builder.build().unwrap_or_default()
        };

        let main_spec = NodeSpec {
            url: cfg.upstream_url.clone(),
            model: cfg.model.clone(),
        };

        let mut pools = HashMap::new();
        pools.insert(
            PoolKind::Main,
            NodePool::new(PoolKind::Main, std::slice::from_ref(&main_spec), build_client),
        );
        pools.insert(
            PoolKind::Planner,
            NodePool::new(PoolKind::Planner, &cfg.swarm_nodes, build_client),
        );
        pools.insert(
            PoolKind::Worker,
            NodePool::new(PoolKind::Worker, &cfg.worker_nodes, build_client),
        );
        pools.insert(
            PoolKind::Vision,
            NodePool::new(PoolKind::Vision, &cfg.visual_nodes, build_client),
        );
        pools.insert(
            PoolKind::Coding,
            NodePool::new(PoolKind::Coding, &cfg.coding_nodes, build_client),
        );

        Ok(Self { pools })
    }

    pub fn pool(&self, class: PoolKind) -> &NodePool {
        &self.pools[&class]
    }

    /// Pick a planner-class node for direct use by swarm workers.
    pub fn planner_node(&self, model_hint: Option<&str>) -> Option<&UpstreamNode> {
        let pool = self.pool(PoolKind::Planner);
        pool.select(model_hint)
    }

    // ── Internal dispatch ──────────────────────────────────────────

    /// One POST to one node, payload model rewritten to the node's label.
    async fn post_once(&self, class: PoolKind, node: &UpstreamNode, payload: &ChatPayload) -> Result<Value> {
        let mut payload = payload.clone();
        payload.model = node.model_label.clone();

        let resp = node
            .client
            .post(node.chat_url())
            .json(&payload)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(classify_status(class, status.as_u16(), &text));
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Main-pool dispatch: capped exponential backoff on transient errors,
    /// 10 attempts, then `UpstreamUnavailable`. Status errors surface
    /// immediately (a `ContextOverflow` must reach the recovery path).
    async fn post_main(&self, payload: &ChatPayload) -> Result<Value> {
        let pool = self.pool(PoolKind::Main);
        let node = pool.node(0);

        let mut last_err = Error::UpstreamUnavailable;
        for attempt in 0..MAIN_RETRY_ATTEMPTS {
            match self.post_once(PoolKind::Main, node, payload).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    let wait = backoff_delay(attempt, CHAT_BACKOFF_CAP);
                    tracing::warn!(
                        attempt = attempt + 1,
                        wait_secs = wait.as_secs(),
                        error = %e,
                        "main upstream transient failure, retrying"
                    );
                    last_err = e;
                    if attempt + 1 < MAIN_RETRY_ATTEMPTS {
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        tracing::error!(error = %last_err, "main upstream failed after {MAIN_RETRY_ATTEMPTS} attempts");
        Err(Error::UpstreamUnavailable)
    }

    /// Auxiliary-pool dispatch: each node of the class is tried once (in
    /// affinity-then-round-robin order); exhaustion falls back to main.
    async fn post_class(
        &self,
        class: PoolKind,
        payload: &ChatPayload,
        model_hint: Option<&str>,
    ) -> Result<Value> {
        let pool = self.pool(class);
        for idx in pool.attempt_order(model_hint) {
            let node = pool.node(idx);
            tracing::info!(pool = %class, model = %node.model_label, "routing request");
            match self.post_once(class, node, payload).await {
                Ok(v) => return Ok(v),
                Err(e @ Error::ContextOverflow(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(pool = %class, model = %node.model_label, error = %e, "node failed, trying next");
                }
            }
        }

        if class == PoolKind::Vision {
            // No vision capability anywhere else; do not silently degrade
            // an image request to a text-only model.
            return Err(Error::Upstream {
                pool: class.as_str().into(),
                message: "all vision nodes failed and the main model does not accept images".into(),
            });
        }

        if !pool.is_empty() {
            tracing::warn!(pool = %class, "all class nodes failed, falling back to main upstream");
        }
        self.post_main(payload).await
    }
}

#[async_trait]
impl Upstream for UpstreamRouter {
    async fn chat(
        &self,
        payload: ChatPayload,
        class: PoolKind,
        model_hint: Option<&str>,
    ) -> Result<Value> {
        match class {
            PoolKind::Main => self.post_main(&payload).await,
            other if self.pool(other).is_empty() && other != PoolKind::Vision => {
                self.post_main(&payload).await
            }
            other => self.post_class(other, &payload, model_hint).await,
        }
    }

    async fn chat_stream(
        &self,
        payload: ChatPayload,
        class: PoolKind,
        model_hint: Option<&str>,
    ) -> Result<ByteStream> {
        let mut payload = payload;
        payload.stream = true;

        // Streaming picks a single node: class affinity if available,
        // otherwise the main upstream. Stream errors after the first byte
        // belong to the consumer.
        let pool = self.pool(class);
        let node = if pool.is_empty() {
            self.pool(PoolKind::Main).node(0)
        } else {
            pool.select(model_hint)
                .unwrap_or_else(|| self.pool(PoolKind::Main).node(0))
        };
        payload.model = node.model_label.clone();

        let resp = node
            .client
            .post(node.chat_url())
            .json(&payload)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_status(class, status.as_u16(), &text));
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(from_reqwest));
        Ok(Box::pin(stream))
    }

    async fn embeddings(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let pool = self.pool(PoolKind::Main);
        let node = pool.node(0);
        let payload = serde_json::json!({ "input": texts, "model": "default" });

        let mut last_err = Error::UpstreamUnavailable;
        for attempt in 0..MAIN_RETRY_ATTEMPTS {
            let result: Result<Value> = async {
                let resp = node
                    .client
                    .post(node.embeddings_url())
                    .json(&payload)
                    .send()
                    .await
                    .map_err(from_reqwest)?;
                let status = resp.status();
                let text = resp.text().await.map_err(from_reqwest)?;
                if !status.is_success() {
                    return Err(classify_status(PoolKind::Main, status.as_u16(), &text));
                }
                Ok(serde_json::from_str(&text)?)
            }
            .await;

            match result {
                Ok(body) => {
                    let vectors = body
                        .get("data")
                        .and_then(|d| d.as_array())
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|item| {
                                    item.get("embedding").and_then(|e| e.as_array()).map(|nums| {
                                        nums.iter()
                                            .filter_map(|n| n.as_f64().map(|f| f as f32))
                                            .collect::<Vec<f32>>()
                                    })
                                })
                                .collect::<Vec<Vec<f32>>>()
                        })
                        .unwrap_or_default();
                    return Ok(vectors);
                }
                Err(e) if e.is_transient() => {
                    last_err = e;
                    if attempt + 1 < MAIN_RETRY_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt, EMBED_BACKOFF_CAP)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        tracing::error!(error = %last_err, "embeddings failed after {MAIN_RETRY_ATTEMPTS} attempts");
        Err(Error::UpstreamUnavailable)
    }

    fn has_pool(&self, class: PoolKind) -> bool {
        !self.pool(class).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_capped() {
        assert_eq!(backoff_delay(0, 30), Duration::from_secs(2));
        assert_eq!(backoff_delay(1, 30), Duration::from_secs(4));
        assert_eq!(backoff_delay(2, 30), Duration::from_secs(8));
        assert_eq!(backoff_delay(3, 30), Duration::from_secs(16));
        assert_eq!(backoff_delay(4, 30), Duration::from_secs(30));
        assert_eq!(backoff_delay(9, 30), Duration::from_secs(30));
        assert_eq!(backoff_delay(4, 20), Duration::from_secs(20));
    }

    #[test]
    fn context_overflow_detected_on_400() {
        let e = classify_status(PoolKind::Main, 400, "the prompt exceeds the Context window");
        assert!(matches!(e, Error::ContextOverflow(_)));

        let e = classify_status(PoolKind::Main, 400, "bad request: missing field");
        assert!(matches!(e, Error::Upstream { .. }));

        let e = classify_status(PoolKind::Worker, 500, "context deadline exceeded");
        assert!(matches!(e, Error::Upstream { pool, .. } if pool == "worker"));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_url("http://127.0.0.1:8080"));
        assert!(is_loopback_url("http://localhost:8080"));
        assert!(!is_loopback_url("http://10.1.2.3:8080"));
    }

    #[tokio::test(start_paused = true)]
    async fn class_exhaustion_falls_back_to_main_then_unavailable() {
        // Every worker node is tried, then the main pool once; when
        // main is also down the caller sees a single UpstreamUnavailable.
        // Unroutable loopback ports fail fast; paused time makes the
        // backoff sleeps instantaneous.
        let mut cfg = RuntimeConfig::default();
        cfg.upstream_url = "http://127.0.0.1:9".into();
        cfg.worker_nodes = vec![
            NodeSpec {
                url: "http://127.0.0.1:9".into(),
                model: "worker-a".into(),
            },
            NodeSpec {
                url: "http://127.0.0.1:9".into(),
                model: "worker-b".into(),
            },
        ];
        let router = UpstreamRouter::from_config(&cfg).unwrap();

        let payload = ChatPayload::new("m", vec![]);
        let err = router
            .chat(payload, PoolKind::Worker, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_vision_pool_never_falls_back_to_main() {
        let cfg = RuntimeConfig::default();
        let router = UpstreamRouter::from_config(&cfg).unwrap();
        let err = router
            .chat(ChatPayload::new("m", vec![]), PoolKind::Vision, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { pool, .. } if pool == "vision"));
    }

    #[test]
    fn router_builds_all_pools_from_config() {
        let mut cfg = RuntimeConfig::default();
        cfg.swarm_nodes = vec![NodeSpec {
            url: "http://10.0.0.1:8080".into(),
            model: "planner-a".into(),
        }];
        cfg.worker_nodes = vec![
            NodeSpec {
                url: "http://10.0.0.2:8080".into(),
                model: "worker-a".into(),
            },
            NodeSpec {
                url: "http://10.0.0.3:8080".into(),
                model: "worker-b".into(),
            },
        ];
        let router = UpstreamRouter::from_config(&cfg).unwrap();

        assert!(router.has_pool(PoolKind::Main));
        assert!(router.has_pool(PoolKind::Planner));
        assert!(router.has_pool(PoolKind::Worker));
        assert!(!router.has_pool(PoolKind::Vision));
        assert_eq!(router.pool(PoolKind::Worker).len(), 2);

        // A worker dispatch visits both worker nodes
        // before any fallback.
        let order = router.pool(PoolKind::Worker).attempt_order(None);
        assert_eq!(order.len(), 2);
    }
}
