//! Shared application state: the explicit `Runtime` value handed to every
//! loop invocation instead of global mutable state.

use std::sync::Arc;

use ghost_context::TokenEstimator;
use ghost_domain::config::RuntimeConfig;
use ghost_memory::{MemoryStore, ProfileStore, Scratchpad, SkillPlaybook};
use ghost_router::Upstream;
use ghost_tools::ToolRegistry;
use tokio::sync::Semaphore;

use crate::runtime::background::BackgroundQueue;
use crate::runtime::scheduler::Scheduler;

/// Everything a request needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RuntimeConfig>,

    // ── Upstream fabric ───────────────────────────────────────────────
    pub upstream: Arc<dyn Upstream>,

    // ── Tools ─────────────────────────────────────────────────────────
    pub registry: Arc<ToolRegistry>,

    // ── Memory subsystems ─────────────────────────────────────────────
    pub memory: Arc<dyn MemoryStore>,
    pub profile: Arc<ProfileStore>,
    pub playbook: Arc<SkillPlaybook>,
    pub scratchpad: Arc<Scratchpad>,

    // ── Scheduler ─────────────────────────────────────────────────────
    pub scheduler: Arc<Scheduler>,

    // ── Context management ────────────────────────────────────────────
    pub estimator: Arc<dyn TokenEstimator>,

    // ── Admission control ─────────────────────────────────────────────
    /// Global request gate: at most 10 concurrent loop entries.
    pub agent_semaphore: Arc<Semaphore>,
    /// Smart-memory background tasks are fully serialized.
    pub memory_semaphore: Arc<Semaphore>,

    // ── Background dispatch ───────────────────────────────────────────
    pub background: Arc<BackgroundQueue>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 digest of the configured API key, for constant-time
    /// comparison against `X-Ghost-Key`.
    pub api_key_hash: Arc<Vec<u8>>,
}
