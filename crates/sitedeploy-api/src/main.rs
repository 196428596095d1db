//! sitedeploy API server

use clap::Parser;
use sitedeploy_api::{AppState, routes};
use sitedeploy_config::{GitHubConfig, OrchestratorConfig};
use sitedeploy_core::BuildExecutor;
use sitedeploy_db::{JobRepo, MemoryJobRepo, PgJobRepo, create_pool, run_migrations};
use sitedeploy_executor::{DryRunExecutor, GitHubActionsExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sitedeploy-server")]
#[command(about = "Deployment job orchestrator for the static site", long_about = None)]
struct Args {
    /// Path to a sitedeploy.kdl configuration file
    #[arg(long, env = "SITEDEPLOY_CONFIG")]
    config: Option<PathBuf>,

    /// Keep jobs in memory instead of PostgreSQL (local development only)
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = OrchestratorConfig::load(args.config.as_deref())?;

    init_tracing(config.server.json_logs);

    let repo: Arc<dyn JobRepo> = if args.in_memory {
        warn!("Using in-memory job store; jobs are lost on restart");
        Arc::new(MemoryJobRepo::new())
    } else {
        info!("Connecting to database...");
        let pool = create_pool(
            config.database.url.expose(),
            config.database.max_connections,
        )
        .await?;
        run_migrations(&pool).await?;
        info!("Database connected");
        Arc::new(PgJobRepo::new(pool))
    };

    let executor = build_executor(&config.github);
    info!(executor = executor.name(), "Build executor ready");

    let state = AppState::new(
        repo,
        executor,
        &config.processor,
        config.auth.clone(),
    );

    if config.auth.cron_secret.is_none() {
        warn!("No cron secret configured; /cron/process will refuse all calls");
    }

    if let Some(period) = config.processor.interval() {
        let worker = state.worker.clone();
        tokio::spawn(async move { worker.run(period).await });
    }

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = config.server.bind;
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_executor(github: &GitHubConfig) -> Arc<dyn BuildExecutor> {
    match GitHubActionsExecutor::from_config(github) {
        Some(executor) => Arc::new(executor),
        None => {
            warn!("GitHub Actions not configured; builds will only be simulated");
            Arc::new(DryRunExecutor::new())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
