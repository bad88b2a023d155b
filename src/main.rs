use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use convo_store::{
    config::{Config, LogFormat},
    storage::{
        GetMessagesArgs, MessageFormat, PaginationArgs, SqliteStore, WorkflowRunsQuery,
        DEFAULT_PAGE_SIZE,
    },
    MessageStore, ThreadStore, WorkflowStore,
};

#[derive(Parser)]
#[command(name = "convo-store")]
#[command(about = "Inspect and initialise a conversation store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every table and add missing columns
    Init,

    /// List a resource's threads, newest first
    Threads {
        resource_id: String,

        #[arg(long, default_value_t = 0)]
        page: u32,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        per_page: u32,
    },

    /// Show the most recent messages of a thread
    Messages {
        thread_id: String,

        /// Number of messages to return
        #[arg(long)]
        last: Option<u32>,

        /// Output shape: v1 or v2
        #[arg(long, default_value = "v2")]
        format: MessageFormat,
    },

    /// List workflow runs
    Runs {
        #[arg(long)]
        workflow: Option<String>,

        #[arg(long)]
        resource: Option<String>,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long)]
        offset: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "convo-store starting");

    let store = match SqliteStore::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database opened");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to open database");
            return Err(e.into());
        }
    };

    let result = run(&store, cli.command).await;
    store.close().await;
    result
}

async fn run(store: &SqliteStore, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            store.init().await.context("failed to initialise tables")?;
            info!("Tables ready");
        }
        Commands::Threads {
            resource_id,
            page,
            per_page,
        } => {
            let threads = store
                .get_threads_by_resource_id_paginated(
                    &resource_id,
                    PaginationArgs::page(page, per_page),
                )
                .await;
            print_json(&threads)?;
        }
        Commands::Messages {
            thread_id,
            last,
            format,
        } => {
            let mut args = GetMessagesArgs::new(thread_id).format(format);
            if let Some(last) = last {
                args = args.last(last);
            }
            #[allow(deprecated)]
            let messages = store.get_messages(args).await;
            print_json(&messages)?;
        }
        Commands::Runs {
            workflow,
            resource,
            limit,
            offset,
        } => {
            let runs = store
                .get_workflow_runs(WorkflowRunsQuery {
                    workflow_name: workflow,
                    resource_id: resource,
                    limit,
                    offset,
                    ..Default::default()
                })
                .await
                .context("failed to list workflow runs")?;
            print_json(&runs)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
