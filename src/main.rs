use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use poolguard::cli::{cmd_check_config, cmd_simulate, CmdSimulate, OutputFormat};
use poolguard::config;
use poolguard::db::MemoryDatabase;
use poolguard::Core;

#[derive(Parser)]
#[command(name = "poolguard")]
#[command(version, about = "Bounded database connection pool with saturation guards", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when absent)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output format (text, json)
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP surface over the in-memory database
    Serve {
        /// Address to listen on (overrides the configuration)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Drive concurrent tenant reads and print the status report
    Simulate {
        /// Number of distinct tenants
        #[arg(long, default_value = "20")]
        tenants: usize,

        /// Total read requests
        #[arg(long, default_value = "10000")]
        requests: usize,

        /// Concurrent request tasks
        #[arg(long, default_value = "32")]
        concurrency: usize,

        /// Simulated database latency per operation
        #[arg(long, default_value = "2")]
        latency_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Request tasks and background maintenance share one pool across worker threads
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load and validate configuration; invalid values are fatal here
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let core = Core::new(config, Arc::new(MemoryDatabase::new()))?;
            poolguard::server::run_server(&core, &listen).await?;
        }
        Commands::CheckConfig => {
            cmd_check_config(&config, cli.format)?;
        }
        Commands::Simulate {
            tenants,
            requests,
            concurrency,
            latency_ms,
        } => {
            let cmd = CmdSimulate::new(tenants, requests, concurrency, latency_ms);
            cmd_simulate(config, cmd, cli.format).await?;
        }
    }

    Ok(())
}
