//! Process entrypoint (§1.1, §6): CLI parsing, logging init, config loading, and the
//! `serve`/`worker` subcommands that assemble and run the control plane.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use conductor::config::Config;
use conductor::events::EventBus;
use conductor::forge::{ForgeClient, GithubForgeClient};
use conductor::gates;
use conductor::http::{self, AppState};
use conductor::queue::{QueueAdapter, SqliteQueue};
use conductor::store::StoreHandle;
use conductor::webhook;
use conductor::worker;
use conductor::worktree;

#[derive(Debug, Parser)]
#[command(name = "conductor", version, about = "External control plane orchestrating AI coding-agent runs")]
struct Cli {
    /// Overrides `DATABASE_PATH` from the environment.
    #[arg(long)]
    database_path: Option<String>,

    /// Overrides `WORKER_CONCURRENCY` from the environment.
    #[arg(long)]
    worker_concurrency: Option<usize>,

    /// Enables debug-level logging regardless of `RUST_LOG`.
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Runs the HTTP server: webhook receiver, operator-action API, SSE, OAuth callbacks.
    Serve {
        /// Also runs the worker loop in this process — the default, single-box posture.
        #[arg(long, default_value_t = true)]
        with_worker: bool,
    },
    /// Runs the worker loop against all five queues, with no HTTP server.
    Worker,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn apply_overrides(mut config: Config, cli: &Cli) -> Config {
    if let Some(path) = &cli.database_path {
        config.database_path = path.into();
    }
    if let Some(concurrency) = cli.worker_concurrency {
        config.worker_concurrency = concurrency;
    }
    config
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            ExitCode::FAILURE
        }
    }
}

/// Shared bootstrap for both subcommands (§4.11 worker startup sequence): open the
/// store, seed gate definitions, run the janitor, then recover webhook deliveries a
/// crash left without a queued job — in that order, so a resumed worker never races
/// the janitor over a worktree the recovery sweep is about to re-touch.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = apply_overrides(Config::from_env()?, &cli);
    let command = cli.command.unwrap_or(Commands::Serve { with_worker: true });

    let store = StoreHandle::open(&config.database_path).await?;
    let queue: Arc<dyn QueueAdapter> = Arc::new(SqliteQueue::new(store.clone()));
    let events = EventBus::new();
    let forge: Arc<dyn ForgeClient> = Arc::new(GithubForgeClient::new(
        config.github_client_id.clone().unwrap_or_default(),
        config.github_client_secret.clone().unwrap_or_default(),
    ));

    gates::ensure_built_in_gate_definitions(&store).await?;
    if let Some(report) = worktree::run_janitor(&store, config.repo_store_dir.clone()).await? {
        tracing::info!(?report, "startup janitor sweep complete");
    }
    webhook::recover_stuck_deliveries(&store, queue.as_ref()).await?;

    match command {
        Commands::Worker => run_worker_only(store, queue, events, forge, config).await,
        Commands::Serve { with_worker } => run_server(store, queue, events, forge, config, with_worker).await,
    }
}

async fn run_worker_only(
    store: StoreHandle,
    queue: Arc<dyn QueueAdapter>,
    events: EventBus,
    forge: Arc<dyn ForgeClient>,
    config: Config,
) -> anyhow::Result<()> {
    let group = worker::start(store.clone(), queue.clone(), events, forge, config);
    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining worker queues");
    group.stop().await;
    queue.close().await;
    store.shutdown().await;
    Ok(())
}

async fn run_server(
    store: StoreHandle,
    queue: Arc<dyn QueueAdapter>,
    events: EventBus,
    forge: Arc<dyn ForgeClient>,
    config: Config,
    with_worker: bool,
) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr;
    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        queue: queue.clone(),
        events: events.clone(),
        forge: forge.clone(),
    };

    let group = with_worker.then(|| worker::start(store.clone(), queue.clone(), events, forge, config));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, with_worker, "conductor listening");
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    tracing::info!("http server stopped, draining in-flight work");
    if let Some(group) = group {
        group.stop().await;
    }
    queue.close().await;
    store.shutdown().await;
    Ok(())
}

/// `SIGINT`/`SIGTERM` graceful shutdown (§4.11, §6): stop accepting new jobs/requests,
/// wait for in-flight work, close the queue adapter, close the store.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
