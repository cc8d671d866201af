use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use ghost_context::CharEstimator;
use ghost_gateway::api;
use ghost_gateway::cli::Cli;
use ghost_gateway::runtime::background::BackgroundQueue;
use ghost_gateway::runtime::sandbox::HostSandbox;
use ghost_gateway::runtime::scheduler::{Scheduler, SchedulerHandle};
use ghost_gateway::runtime::vector::EmbeddingMemory;
use ghost_gateway::search_backend::AnonymousSearch;
use ghost_gateway::state::AppState;
use ghost_memory::{MemoryStore, NullMemory, ProfileStore, Scratchpad, SkillPlaybook};
use ghost_router::{Upstream, UpstreamRouter};
use ghost_tools::{SearchProvider, Tool, ToolRegistry};

/// Global loop admission: at most this many concurrent requests.
const AGENT_SLOTS: usize = 10;
/// Background queue depth (drop-oldest beyond this).
const BACKGROUND_CAPACITY: usize = 32;
/// Scheduler tick period.
const SCHEDULER_TICK_SECS: u64 = 15;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Arc::new(cli.into_config());

    init_tracing(config.debug);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "fatal startup failure");
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "debug,hyper=info,reqwest=info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

async fn run(config: Arc<ghost_domain::config::RuntimeConfig>) -> anyhow::Result<()> {
    tracing::info!("Ghost agent starting");

    // ── Directories ──────────────────────────────────────────────────
    std::fs::create_dir_all(&config.sandbox_dir).context("creating sandbox directory")?;
    std::fs::create_dir_all(&config.memory_dir).context("creating memory directory")?;

    // ── Upstream router ──────────────────────────────────────────────
    let upstream: Arc<dyn Upstream> =
        Arc::new(UpstreamRouter::from_config(&config).context("building upstream router")?);
    tracing::info!(
        upstream = %config.upstream_url,
        planner_nodes = config.swarm_nodes.len(),
        worker_nodes = config.worker_nodes.len(),
        vision_nodes = config.visual_nodes.len(),
        coding_nodes = config.coding_nodes.len(),
        "upstream router ready"
    );

    // ── Memory subsystems ────────────────────────────────────────────
    let memory: Arc<dyn MemoryStore> = if config.no_memory {
        tracing::info!("vector memory disabled");
        Arc::new(NullMemory)
    } else {
        let store = EmbeddingMemory::open(&config.memory_dir, upstream.clone())
            .context("opening vector memory")?;
        tracing::info!("vector memory ready");
        Arc::new(store)
    };
    let profile = Arc::new(ProfileStore::open(&config.memory_dir).context("opening profile store")?);
    let playbook =
        Arc::new(SkillPlaybook::open(&config.memory_dir).context("opening skills playbook")?);
    let scratchpad = Arc::new(Scratchpad::new());

    // ── Scheduler ────────────────────────────────────────────────────
    let scheduler =
        Arc::new(Scheduler::open(&config.scheduler_db_path()).context("opening scheduler store")?);
    tracing::info!(jobs = scheduler.job_count(), "scheduler store ready");

    // ── Sandbox + search backend ─────────────────────────────────────
    let sandbox = Arc::new(
        HostSandbox::new(config.sandbox_dir.clone()).context("initializing sandbox")?,
    );
    let search: Arc<dyn SearchProvider> = Arc::new(AnonymousSearch::new(config.tor_proxy.clone()));

    // ── Tool registry ────────────────────────────────────────────────
    let registry = Arc::new(build_registry(
        &config,
        upstream.clone(),
        memory.clone(),
        profile.clone(),
        playbook.clone(),
        scratchpad.clone(),
        scheduler.clone(),
        sandbox,
        search,
    ));
    tracing::info!(
        tools = registry.definitions().len(),
        "tool registry ready"
    );

    // ── State ────────────────────────────────────────────────────────
    let background = Arc::new(BackgroundQueue::new(BACKGROUND_CAPACITY));
    let state = AppState {
        config: config.clone(),
        upstream,
        registry,
        memory,
        profile,
        playbook,
        scratchpad,
        scheduler: scheduler.clone(),
        estimator: Arc::new(CharEstimator),
        agent_semaphore: Arc::new(tokio::sync::Semaphore::new(AGENT_SLOTS)),
        memory_semaphore: Arc::new(tokio::sync::Semaphore::new(1)),
        background: background.clone(),
        api_key_hash: Arc::new(Sha256::digest(config.api_key.as_bytes()).to_vec()),
    };

    // ── Background worker ────────────────────────────────────────────
    tokio::spawn(background.run());

    // ── Scheduler runner ─────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SCHEDULER_TICK_SECS));
            loop {
                interval.tick().await;
                let due = match state.scheduler.take_due(&chrono::Utc::now()) {
                    Ok(due) => due,
                    Err(e) => {
                        tracing::warn!(error = %e, "scheduler tick failed");
                        continue;
                    }
                };
                for job in due {
                    tracing::info!(id = %job.id, name = %job.name, "proactive run");
                    let state = state.clone();
                    tokio::spawn(async move {
                        let body = serde_json::json!({
                            "model": state.config.model,
                            "messages": [{
                                "role": "user",
                                "content": format!("BACKGROUND TASK: {}", job.prompt),
                            }],
                        });
                        // Background chains are disabled for scheduled runs.
                        let _ = ghost_gateway::runtime::handle_chat(state, body, None, false).await;
                    });
                }
            }
        });
    }
    tracing::info!("scheduler runner started ({SCHEDULER_TICK_SECS}s tick)");

    // ── Serve ────────────────────────────────────────────────────────
    let app = api::router(state.clone())
        .layer(tower::limit::ConcurrencyLimitLayer::new(64))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, model = %config.model, max_context = config.max_context, "ghost listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Wire every canonical tool. `vision_analysis` registers only when
/// vision nodes are configured.
#[allow(clippy::too_many_arguments)]
fn build_registry(
    config: &ghost_domain::config::RuntimeConfig,
    upstream: Arc<dyn Upstream>,
    memory: Arc<dyn MemoryStore>,
    profile: Arc<ProfileStore>,
    playbook: Arc<SkillPlaybook>,
    scratchpad: Arc<Scratchpad>,
    scheduler: Arc<Scheduler>,
    sandbox: Arc<dyn ghost_tools::exec::Sandbox>,
    search: Arc<dyn SearchProvider>,
) -> ToolRegistry {
    use ghost_tools::db::PostgresAdminTool;
    use ghost_tools::exec::ExecuteTool;
    use ghost_tools::fs::FileSystemTool;
    use ghost_tools::memory_tools::{
        KnowledgeBaseTool, LearnSkillTool, RecallTool, ScratchpadTool, UpdateProfileTool,
    };
    use ghost_tools::misc::{DreamModeTool, ReplanTool, VisionAnalysisTool};
    use ghost_tools::search::{DeepResearchTool, FactCheckTool, WebSearchTool};
    use ghost_tools::swarm::{DelegateToSwarmTool, SelfPlayTool};
    use ghost_tools::system::SystemUtilityTool;
    use ghost_tools::tasks::ManageTasksTool;

    let scheduler_handle = Arc::new(SchedulerHandle(scheduler));
    let research = Arc::new(DeepResearchTool {
        provider: search.clone(),
        upstream: upstream.clone(),
        model: config.model.clone(),
    });

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(DelegateToSwarmTool {
        upstream: upstream.clone(),
        scratchpad: scratchpad.clone(),
    }));
    registry.register(Arc::new(SystemUtilityTool {
        tor_proxy: config.tor_proxy.clone(),
        profile: Some(profile.clone()),
        memory_active: !config.no_memory,
        scheduler: Some(scheduler_handle.clone()),
    }));
    registry.register(Arc::new(FileSystemTool::new(
        config.sandbox_dir.clone(),
        config.tor_proxy.clone(),
    )));
    registry.register(Arc::new(KnowledgeBaseTool {
        memory: memory.clone(),
        provider: search.clone(),
        sandbox_dir: config.sandbox_dir.clone(),
    }));
    registry.register(Arc::new(RecallTool {
        memory: memory.clone(),
    }));
    registry.register(Arc::new(ExecuteTool::new(config.sandbox_dir.clone(), sandbox)));
    registry.register(Arc::new(LearnSkillTool {
        playbook,
        memory: memory.clone(),
    }));
    registry.register(Arc::new(WebSearchTool {
        provider: search.clone(),
    }));
    registry.register(research.clone() as Arc<dyn Tool>);
    registry.register(Arc::new(FactCheckTool {
        research,
        upstream: upstream.clone(),
        model: config.model.clone(),
    }));
    registry.register(Arc::new(UpdateProfileTool { profile }));
    registry.register(Arc::new(ManageTasksTool {
        scheduler: scheduler_handle,
    }));
    registry.register(Arc::new(DreamModeTool {
        upstream: upstream.clone(),
        memory: memory.clone(),
        model: config.model.clone(),
    }));
    registry.register(Arc::new(SelfPlayTool::new(
        upstream.clone(),
        scratchpad.clone(),
        config.model.clone(),
    )));
    registry.register(Arc::new(ReplanTool));
    registry.register(Arc::new(ScratchpadTool { scratchpad }));
    registry.register(Arc::new(PostgresAdminTool {
        default_db: config.default_db.clone(),
    }));
    if config.has_vision_nodes() {
        registry.register(Arc::new(VisionAnalysisTool { upstream }));
    }
    registry
}
