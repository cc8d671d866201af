//! Multi-tier upstream router.
//!
//! Planner / responder / background / vision / coding calls go to distinct
//! pools of OpenAI-compatible endpoints with round-robin selection,
//! per-model affinity, capped exponential backoff on transient errors, and
//! fallback to the main upstream when an auxiliary class is exhausted.

pub mod pool;
pub mod router;
pub mod sse;

pub use pool::{NodePool, PoolKind, UpstreamNode};
pub use router::{ByteStream, Upstream, UpstreamRouter};
pub use sse::synthesize_chunks;
