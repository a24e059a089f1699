//! `dialq` - run the call engine server or trigger a single operation

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use dialq_call_engine::database::DatabaseManager;
use dialq_call_engine::logging::{log_welcome, setup_logging};
use dialq_call_engine::orchestrator::{CallCenterEngine, LoggingGateway, TickParams};
use dialq_call_engine::queue::ReconcileParams;
use dialq_call_engine::{CallCenterConfig, CallCenterServerBuilder};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Call routing and queue engine", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "DIALQ_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overriding the configuration file
    #[arg(long, env = "DIALQ_DATABASE_URL")]
    database_url: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "DIALQ_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Run workers and the HTTP API until Ctrl+C
    Serve {
        /// API bind address
        #[arg(long, env = "DIALQ_BIND")]
        bind: Option<SocketAddr>,

        /// Serve the API only, without periodic workers
        #[arg(long)]
        no_workers: bool,
    },
    /// Run one reconciliation pass and print the report
    Reconcile {
        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long)]
        batch_size: Option<u32>,

        #[arg(long)]
        max_subjects: Option<u32>,

        /// Report drift without writing
        #[arg(long)]
        dry_run: bool,

        /// Keep resuming until the whole subject table has been walked
        #[arg(long)]
        all: bool,
    },
    /// Run one assignment tick and print the report
    Tick {
        #[arg(long)]
        max_items: Option<u32>,
    },
    /// Apply database migrations and exit
    Migrate,
}

fn load_config(args: &Args) -> Result<CallCenterConfig> {
    let mut config = match &args.config {
        Some(path) => CallCenterConfig::from_toml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CallCenterConfig::default(),
    };
    if let Some(url) = &args.database_url {
        config.database.url = url.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json = true;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args)?;
    setup_logging(&config.logging)?;
    log_welcome(&config.general.instance_name);

    match args.command {
        Command::Serve { bind, no_workers } => {
            if let Some(bind) = bind {
                config.api.bind_addr = bind;
            }
            if no_workers {
                config.general.enable_workers = false;
            }
            let mut server = CallCenterServerBuilder::new().with_config(config).build().await?;
            server.run().await?;
        }
        Command::Reconcile {
            offset,
            batch_size,
            max_subjects,
            dry_run,
            all,
        } => {
            let engine = CallCenterEngine::new(config, Arc::new(LoggingGateway::new())).await?;
            let mut params = ReconcileParams {
                offset,
                batch_size,
                max_subjects,
                dry_run,
            };
            loop {
                let report = engine.reconcile(params.clone()).await?;
                print_json(&report)?;
                if !all || !report.has_more() || report.next_offset == params.offset {
                    break;
                }
                info!("↪️ Resuming at offset {}", report.next_offset);
                params.offset = report.next_offset;
            }
        }
        Command::Tick { max_items } => {
            let engine = CallCenterEngine::new(config, Arc::new(LoggingGateway::new())).await?;
            let report = engine.tick(TickParams { max_items }).await?;
            print_json(&report)?;
        }
        Command::Migrate => {
            let db = DatabaseManager::with_config(&config.database).await?;
            db.close().await;
            info!("✅ Migrations applied to {}", config.database.url);
        }
    }

    Ok(())
}
