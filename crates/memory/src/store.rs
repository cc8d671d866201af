//! The vector memory interface.
//!
//! The actual collection (embeddings, persistence, similarity search) is an
//! external library; the runtime only depends on this trait. Scores are
//! distances: lower means more similar.

use async_trait::async_trait;
use ghost_domain::Result;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    /// Similarity distance; lower is closer.
    pub score: f32,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Rendered context block for the given query, empty when nothing
    /// relevant exists.
    async fn search(&self, query: &str) -> Result<String>;

    /// Scored nearest neighbours, optionally restricted to a metadata
    /// `type` value (e.g. `skill`, `auto`).
    async fn search_scored(
        &self,
        query: &str,
        limit: usize,
        type_filter: Option<&str>,
    ) -> Result<Vec<MemoryHit>>;

    /// Insert one fragment with its metadata map.
    async fn add(&self, text: &str, metadata: Value) -> Result<()>;

    /// Delete fragments by id; returns how many were removed.
    async fn delete(&self, ids: &[String]) -> Result<usize>;

    async fn count(&self) -> Result<usize>;

    /// Distinct source documents known to the collection.
    async fn list_documents(&self) -> Result<Vec<String>>;

    /// Remove everything matching a topic; returns how many were removed.
    async fn forget_topic(&self, topic: &str) -> Result<usize>;

    /// Drop the whole collection.
    async fn reset(&self) -> Result<()>;
}

/// No-op store used with `--no-memory`.
pub struct NullMemory;

#[async_trait]
impl MemoryStore for NullMemory {
    async fn search(&self, _query: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn search_scored(
        &self,
        _query: &str,
        _limit: usize,
        _type_filter: Option<&str>,
    ) -> Result<Vec<MemoryHit>> {
        Ok(Vec::new())
    }

    async fn add(&self, _text: &str, _metadata: Value) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _ids: &[String]) -> Result<usize> {
        Ok(0)
    }

    async fn count(&self) -> Result<usize> {
        Ok(0)
    }

    async fn list_documents(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn forget_topic(&self, _topic: &str) -> Result<usize> {
        Ok(0)
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }
}
