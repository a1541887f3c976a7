use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::admission::{Admission, Verdict};
use floodgate::client::Client;
use floodgate::config::{FloodgateConfig, LoggingConfig};
use floodgate::ratelimit::{Decision, PolicyRegistry, PolicySpec};
use floodgate::server::{FileKeyStore, Server};

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Authoritative rate limiting server and client")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON); FLOODGATE__* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the rate limit server until Ctrl+C or SIGTERM
    Serve,
    /// Count one call against the server and print the decision
    Limit {
        /// Identity being limited, usually a client IP
        #[arg(long)]
        identity: String,
        /// Policy group; repeat to evaluate several in order
        #[arg(long = "group", required = true)]
        groups: Vec<String>,
        /// Override the limit of every named group
        #[arg(long)]
        limit: Option<u64>,
        /// Override the interval (seconds) of every named group
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Zero the counts of one group
    Reset {
        #[arg(long)]
        group: String,
    },
    /// Zero every count on the server
    ResetAll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = FloodgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Limit {
            identity,
            groups,
            limit,
            interval,
        } => run_limit(config, identity, groups, limit, interval).await,
        Commands::Reset { group } => {
            let client = connect(&config).await?;
            client.reset(&group).await?;
            println!("reset {}", group);
            client.close().await;
            Ok(())
        }
        Commands::ResetAll => {
            let client = connect(&config).await?;
            client.reset_all().await?;
            println!("reset all groups");
            client.close().await;
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

async fn serve(config: FloodgateConfig) -> anyhow::Result<()> {
    info!("Starting Floodgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let key_store = Arc::new(FileKeyStore::new(&config.storage.path));
    let server = Server::new(config.server.clone(), key_store);
    server.registry().load_specs(config.policies.clone())?;
    info!(
        listen_addr = %config.server.listen_addr,
        policies = server.registry().len(),
        "Configuration loaded"
    );

    let handle = server.start().await?;
    shutdown_signal().await;
    handle.stop().await;

    info!("Floodgate Rate Limiting Service stopped");
    Ok(())
}

async fn run_limit(
    config: FloodgateConfig,
    identity: String,
    groups: Vec<String>,
    limit: Option<u64>,
    interval: Option<u64>,
) -> anyhow::Result<()> {
    let registry = PolicyRegistry::new();
    registry.load_specs(config.policies.clone())?;
    for group in &groups {
        if limit.is_some() || interval.is_some() || registry.get(group).is_none() {
            registry.add(PolicySpec {
                group: Some(group.clone()),
                limit,
                interval,
            })?;
        }
    }
    let policies = registry.resolve(&groups)?;

    let client = Arc::new(connect(&config).await?);
    match config.admission {
        Some(admission) => {
            let admission = Admission::new(client.clone(), admission.on_unavailable);
            match admission.admit(&identity, &policies).await? {
                Verdict::Admit => println!("admit"),
                Verdict::Throttle {
                    reset_at,
                    retry_after,
                } => println!(
                    "throttle until {} (retry after {}s)",
                    reset_at.to_rfc3339(),
                    retry_after.as_secs()
                ),
                Verdict::Unavailable => println!("unavailable"),
            }
        }
        None => match client.limit(&identity, &policies).await? {
            Decision::Allow => println!("allow"),
            Decision::Deny { reset_at } => println!("deny until {}", reset_at.to_rfc3339()),
        },
    }

    client.close().await;
    Ok(())
}

async fn connect(config: &FloodgateConfig) -> anyhow::Result<Client> {
    let key_store = FileKeyStore::new(&config.storage.path);
    let client = Client::connect(config.client.clone(), &key_store).await?;
    Ok(client)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
