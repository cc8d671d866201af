//! Embedding-backed vector memory: the default [`MemoryStore`] when no
//! external collection is wired in. Vectors come from the main upstream's
//! embeddings endpoint; fragments persist as one JSON file with the
//! atomic-rename pattern. Writes are serialized off the request path.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ghost_domain::{Error, Result};
use ghost_memory::io::write_json_atomic;
use ghost_memory::{MemoryHit, MemoryStore};
use ghost_router::Upstream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hits rendered into a `search` context block.
const CONTEXT_HITS: usize = 4;
/// Distance above which a hit is considered irrelevant for context.
const CONTEXT_DISTANCE: f32 = 0.75;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Fragment {
    id: String,
    text: String,
    metadata: Value,
    vector: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    fragments: Vec<Fragment>,
}

pub struct EmbeddingMemory {
    path: PathBuf,
    upstream: Arc<dyn Upstream>,
    collection: Mutex<Collection>,
}

impl EmbeddingMemory {
    pub fn open(memory_dir: &std::path::Path, upstream: Arc<dyn Upstream>) -> Result<Self> {
        std::fs::create_dir_all(memory_dir)?;
        let path = memory_dir.join("vector_store.json");
        let collection = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            Collection::default()
        };
        Ok(Self {
            path,
            upstream,
            collection: Mutex::new(collection),
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.upstream.embeddings(vec![text.to_string()]).await?;
        vectors
            .pop()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Memory("embeddings endpoint returned no vector".into()))
    }

    fn persist(&self, collection: &Collection) -> Result<()> {
        write_json_atomic(&self.path, collection)
    }

    /// Cosine distance (1 - similarity); lower is closer.
    fn distance(a: &[f32], b: &[f32]) -> f32 {
        if a.is_empty() || b.is_empty() || a.len() != b.len() {
            return 1.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            return 1.0;
        }
        1.0 - (dot / (na * nb))
    }

    fn nearest(&self, query_vec: &[f32], limit: usize, type_filter: Option<&str>) -> Vec<MemoryHit> {
        let collection = self.collection.lock();
        let mut scored: Vec<MemoryHit> = collection
            .fragments
            .iter()
            .filter(|f| match type_filter {
                Some(kind) => f.metadata.get("type").and_then(|v| v.as_str()) == Some(kind),
                None => true,
            })
            .map(|f| MemoryHit {
                id: f.id.clone(),
                text: f.text.clone(),
                score: Self::distance(query_vec, &f.vector),
            })
            .collect();
        scored.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }
}

#[async_trait]
impl MemoryStore for EmbeddingMemory {
    async fn search(&self, query: &str) -> Result<String> {
        let hits = self.search_scored(query, CONTEXT_HITS, None).await?;
        let relevant: Vec<String> = hits
            .into_iter()
            .filter(|h| h.score < CONTEXT_DISTANCE)
            .map(|h| format!("- {}", h.text))
            .collect();
        Ok(relevant.join("\n"))
    }

    async fn search_scored(
        &self,
        query: &str,
        limit: usize,
        type_filter: Option<&str>,
    ) -> Result<Vec<MemoryHit>> {
        if self.collection.lock().fragments.is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.embed(query).await?;
        Ok(self.nearest(&query_vec, limit, type_filter))
    }

    async fn add(&self, text: &str, metadata: Value) -> Result<()> {
        let vector = self.embed(text).await?;
        let fragment = Fragment {
            id: uuid::Uuid::new_v4().simple().to_string(),
            text: text.to_string(),
            metadata,
            vector,
        };
        let mut collection = self.collection.lock();
        collection.fragments.push(fragment);
        self.persist(&collection)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut collection = self.collection.lock();
        let before = collection.fragments.len();
        collection.fragments.retain(|f| !ids.contains(&f.id));
        let removed = before - collection.fragments.len();
        if removed > 0 {
            self.persist(&collection)?;
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.collection.lock().fragments.len())
    }

    async fn list_documents(&self) -> Result<Vec<String>> {
        let collection = self.collection.lock();
        let mut docs: Vec<String> = collection
            .fragments
            .iter()
            .filter_map(|f| f.metadata.get("source").and_then(|v| v.as_str()))
            .map(String::from)
            .collect();
        docs.sort();
        docs.dedup();
        Ok(docs)
    }

    async fn forget_topic(&self, topic: &str) -> Result<usize> {
        // Semantic match first, then plain substring as a fallback for
        // short topics the embedder places poorly.
        let hits = self.search_scored(topic, 10, None).await?;
        let mut ids: Vec<String> = hits
            .into_iter()
            .filter(|h| h.score < 0.5)
            .map(|h| h.id)
            .collect();

        let topic_lc = topic.to_lowercase();
        {
            let collection = self.collection.lock();
            for fragment in &collection.fragments {
                if fragment.text.to_lowercase().contains(&topic_lc) && !ids.contains(&fragment.id) {
                    ids.push(fragment.id.clone());
                }
            }
        }
        self.delete(&ids).await
    }

    async fn reset(&self) -> Result<()> {
        let mut collection = self.collection.lock();
        collection.fragments.clear();
        self.persist(&collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_domain::chat::ChatPayload;
    use ghost_router::{ByteStream, PoolKind};

    /// Embeds each text as a deterministic unit vector keyed on its first
    /// character so nearest-neighbour order is predictable.
    struct FakeEmbedder;

    #[async_trait]
    impl Upstream for FakeEmbedder {
        async fn chat(
            &self,
            _payload: ChatPayload,
            _class: PoolKind,
            _hint: Option<&str>,
        ) -> Result<Value> {
            Err(Error::UpstreamUnavailable)
        }
        async fn chat_stream(
            &self,
            _payload: ChatPayload,
            _class: PoolKind,
            _hint: Option<&str>,
        ) -> Result<ByteStream> {
            Err(Error::UpstreamUnavailable)
        }
        async fn embeddings(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let c = t.bytes().next().unwrap_or(b'a') as usize % 4;
                    let mut v = vec![0.0f32; 4];
                    v[c % 4] = 1.0;
                    v
                })
                .collect())
        }
        fn has_pool(&self, _class: PoolKind) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn add_search_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingMemory::open(dir.path(), Arc::new(FakeEmbedder)).unwrap();

        store
            .add("alpha fact", serde_json::json!({"type": "auto"}))
            .await
            .unwrap();
        store
            .add("different entirely", serde_json::json!({"type": "skill"}))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let hits = store.search_scored("alpha query", 5, None).await.unwrap();
        assert_eq!(hits[0].text, "alpha fact");
        assert!(hits[0].score < 0.01);

        let skill_only = store.search_scored("alpha", 5, Some("skill")).await.unwrap();
        assert_eq!(skill_only.len(), 1);
        assert_eq!(skill_only[0].text, "different entirely");

        let removed = store.delete(&[hits[0].id.clone()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = EmbeddingMemory::open(dir.path(), Arc::new(FakeEmbedder)).unwrap();
            store
                .add("durable fact", serde_json::json!({"type": "auto", "source": "doc.txt"}))
                .await
                .unwrap();
        }
        let store = EmbeddingMemory::open(dir.path(), Arc::new(FakeEmbedder)).unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.list_documents().await.unwrap(), vec!["doc.txt"]);
    }

    #[tokio::test]
    async fn forget_topic_by_substring() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingMemory::open(dir.path(), Arc::new(FakeEmbedder)).unwrap();
        store
            .add("the project uses tokio", serde_json::json!({"type": "auto"}))
            .await
            .unwrap();
        store
            .add("unrelated note", serde_json::json!({"type": "auto"}))
            .await
            .unwrap();

        let removed = store.forget_topic("tokio").await.unwrap();
        assert!(removed >= 1);
        let remaining = store.count().await.unwrap();
        assert!(remaining <= 1);
    }

    #[test]
    fn cosine_distance_properties() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((EmbeddingMemory::distance(&a, &a)).abs() < 1e-6);
        assert!((EmbeddingMemory::distance(&a, &b) - 1.0).abs() < 1e-6);
        assert_eq!(EmbeddingMemory::distance(&a, &[]), 1.0);
    }
}
