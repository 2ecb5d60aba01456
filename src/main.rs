use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use anteroom::agent::{AgentLoop, OpenAiChatService};
use anteroom::config::AppConfig;
use anteroom::db::memory::MemoryStore;
use anteroom::db::{CanvasStore, Database};
use anteroom::exec::{self, ExecArgs};
use anteroom::http::ApiKeyProvider;
use anteroom::routes::{self, AppState};
use anteroom::service::{
    ActiveStreams, ApprovalBroker, ChatService, Embedder, EmbeddingIndexer, EmbeddingService, EmbeddingWorker,
    SearchService,
};
use anteroom::tools::ToolRegistry;

const REAPER_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "anteroom", version, about = "Self-hosted AI chat with an agentic tool loop")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Run a single prompt non-interactively.
    Exec(ExecArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_filter = match cli.command {
        Some(Command::Exec(_)) => "anteroom=warn",
        _ => "anteroom=debug,tower_http=debug",
    };

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load()?;
    match cli.command {
        Some(Command::Exec(args)) => {
            let code = run_exec(config, args).await?;
            std::process::exit(code);
        }
        _ => serve(config).await,
    }
}

async fn chat_model(config: &AppConfig) -> anyhow::Result<Arc<OpenAiChatService>> {
    let key = ApiKeyProvider::new(&config.ai.api_key, config.ai.api_key_command.as_deref());
    if key.can_refresh() {
        key.refresh().await?;
    }
    Ok(Arc::new(OpenAiChatService::new(&config.ai, key)?))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    // ── Database ──────────────────────────────────────────────────────────────
    let db = Arc::new(Database::connect(&config.database.url, config.database.max_connections).await?);
    info!("Database connection established and migrations applied");

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let tools = ToolRegistry::with_builtin_tools(config.safety.clone(), &config.agent, db.clone());
    let agent = Arc::new(AgentLoop::new(chat_model(&config).await?, Arc::new(tools), config.agent.clone()));
    info!(model = agent.model_name(), "Agent ready");

    let embedder: Option<Arc<dyn Embedder>> = match EmbeddingService::from_config(&config).await {
        Ok(service) => service.map(|s| Arc::new(s) as Arc<dyn Embedder>),
        Err(e) => {
            warn!(error = %e, "Embedding service unavailable, continuing without it");
            None
        }
    };

    let mut chat = ChatService::new(db.clone());
    let worker = match &embedder {
        Some(embedder) => {
            let indexer = EmbeddingIndexer::new(db.clone(), embedder.clone());
            chat = chat.with_indexer(indexer.clone());
            let worker = EmbeddingWorker::new(
                indexer,
                config.embeddings.batch_size,
                Duration::from_secs(config.embeddings.poll_interval_secs),
            );
            Some(Arc::new(worker.spawn()))
        }
        None => None,
    };

    let shutdown = CancellationToken::new();
    let streams = Arc::new(ActiveStreams::new(Duration::from_secs(config.agent.stream_stale_after_secs)));
    let reaper = streams.clone().spawn_reaper(REAPER_INTERVAL, shutdown.clone());

    let state = AppState {
        chat,
        agent,
        streams,
        approvals: Arc::new(ApprovalBroker::new(Duration::from_secs(config.safety.approval_timeout))),
        search: SearchService::new(db.clone(), embedder),
        worker: worker.clone(),
    };
    let app = routes::router(state);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    shutdown.cancel();
    if let Some(worker) = worker {
        worker.stop();
    }
    let _ = reaper.await;
    Ok(())
}

async fn run_exec(config: AppConfig, args: ExecArgs) -> anyhow::Result<i32> {
    let stdin = exec::read_stdin();
    let model = chat_model(&config).await?;

    let (chat, canvases): (ChatService, Arc<dyn CanvasStore>) = if args.no_conversation {
        let store = Arc::new(MemoryStore::new());
        (ChatService::new(store.clone()), store as Arc<dyn CanvasStore>)
    } else {
        let db = Arc::new(Database::connect(&config.database.url, config.database.max_connections).await?);
        (ChatService::new(db.clone()), db as Arc<dyn CanvasStore>)
    };

    let tools = exec::tool_registry(&args, config.safety.clone(), &config.agent, canvases);
    let agent = AgentLoop::new(model, Arc::new(tools), config.agent.clone());

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    Ok(exec::run_exec(&args, stdin, &agent, &chat, &mut stdout, &mut stderr).await)
}
