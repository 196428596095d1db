//! sitedeploy CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use sitedeploy_core::JobId;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

use client::{ApiClient, CreateRequest, ListQuery};

#[derive(Parser)]
#[command(name = "sitedeploy")]
#[command(about = "Site deployment orchestrator CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "SITEDEPLOY_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a site deployment
    Create {
        /// Rebuild only this post
        #[arg(long, conflicts_with = "full", required_unless_present = "full")]
        post_id: Option<i64>,
        #[arg(long, requires = "post_id")]
        post_slug: Option<String>,
        #[arg(long, requires = "post_id")]
        post_title: Option<String>,
        /// Rebuild the entire site
        #[arg(long)]
        full: bool,
        /// Who is asking
        #[arg(long, value_enum, default_value_t = Source::Manual)]
        source: Source,
    },
    /// Show a deployment
    Status {
        /// Deployment ID
        id: JobId,
    },
    /// List deployments, newest first
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        triggered_by: Option<String>,
        #[arg(long, default_value = "20")]
        limit: i64,
        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// Retry a failed or cancelled deployment
    Retry {
        /// Deployment ID
        id: JobId,
    },
    /// Cancel a pending or processing deployment
    Cancel {
        /// Deployment ID
        id: JobId,
    },
    /// Follow a deployment until it finishes
    Watch {
        /// Deployment ID
        id: JobId,
        /// Seconds between polls
        #[arg(long, default_value = "5")]
        interval_secs: u64,
    },
    /// Run one processing pass (sweep timeouts, dispatch pending jobs)
    Process {
        #[arg(long, env = "CRON_SECRET", hide_env_values = true)]
        cron_secret: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Source {
    Manual,
    Api,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Source::Manual => "manual",
            Source::Api => "api",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Create {
            post_id,
            post_slug,
            post_title,
            full,
            source,
        } => {
            let deployment_type = if full { "full" } else { "incremental" };
            let request = CreateRequest {
                post_id,
                post_slug,
                post_title,
                deployment_type: deployment_type.to_string(),
                triggered_by: source.as_str().to_string(),
            };
            commands::create(&client, request).await?;
        }
        Commands::Status { id } => {
            commands::status(&client, id).await?;
        }
        Commands::List {
            status,
            triggered_by,
            limit,
            offset,
        } => {
            let query = ListQuery {
                status,
                triggered_by,
                limit: Some(limit),
                offset: Some(offset),
            };
            commands::list(&client, query).await?;
        }
        Commands::Retry { id } => {
            commands::retry(&client, id).await?;
        }
        Commands::Cancel { id } => {
            commands::cancel(&client, id).await?;
        }
        Commands::Watch { id, interval_secs } => {
            let interval = Duration::from_secs(interval_secs.max(1));
            commands::watch::run(&client, id, interval).await?;
        }
        Commands::Process { cron_secret } => {
            commands::process(&client, cron_secret).await?;
        }
    }

    Ok(())
}
