// ghostrelay: directory server and relay node
//
// `ghostrelay serve` runs the directory. `ghostrelay node` joins one as a
// relay node and executes its hops.

mod config;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use ghostrelay_core::store::{MemoryStorage, SledStorage, StorageBackend};
use ghostrelay_core::{
    AccessGate, AllowAll, Hub, HubConfig, InMemoryLedger, LivenessSweeper, NodeAgent, NodeClass,
    NodeClient, NodeClientConfig, NodeIdentity, NoopPersistence, PersistenceGateway,
    RelayTiming, StoredPersistence, TokenAllowList,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ghostrelay")]
#[command(about = "Ghost Relay: directory server and relay node", long_about = None)]
#[command(version)]
struct Cli {
    /// Write JSON logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the directory server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Persist sessions and performance here instead of discarding them
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Join a directory as a relay node
    Node {
        #[arg(long)]
        node_id: Option<String>,
        #[arg(long)]
        wallet: Option<String>,
        #[arg(long)]
        region: Option<String>,
        /// Directory WebSocket URL
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        token: Option<String>,
        /// Keep stored chunks here instead of in memory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ghostrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref());

    match cli.command {
        Commands::Serve { port, data_dir } => cmd_serve(port, data_dir).await,
        Commands::Node {
            node_id,
            wallet,
            region,
            server,
            token,
            data_dir,
        } => {
            let mut config = load_config()?;
            let node = &mut config.node;
            node.node_id = node_id.or(node.node_id.take());
            node.wallet_address = wallet.or(node.wallet_address.take());
            if let Some(region) = region {
                node.region = region;
            }
            if let Some(server) = server {
                node.signaling_server = server;
            }
            node.access_token = token.or(node.access_token.take());
            cmd_node(config, data_dir).await
        }
        Commands::Config { action } => cmd_config(action),
    }
}

/// Config file with environment overrides applied
fn load_config() -> Result<config::Config> {
    let mut config = config::Config::load()?;
    config.apply_env()?;
    Ok(config)
}

fn resolve_data_dir(flag: Option<PathBuf>, configured: &Option<String>) -> Option<PathBuf> {
    flag.or_else(|| configured.as_ref().map(PathBuf::from))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn cmd_serve(port: Option<u16>, data_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let port = port.unwrap_or(config.port);

    let access: Arc<dyn AccessGate> = if config.access_tokens.is_empty() && config.open_access {
        tracing::warn!("No access tokens configured; accepting every registration");
        Arc::new(AllowAll)
    } else {
        if config.access_tokens.is_empty() {
            tracing::warn!("No access tokens configured and open access is off; all registrations will be rejected");
        }
        Arc::new(TokenAllowList::new(config.access_tokens.iter().cloned()))
    };

    let persistence: Arc<dyn PersistenceGateway> =
        match resolve_data_dir(data_dir, &config.data_dir) {
            Some(dir) => {
                let path = dir.join("directory");
                let storage = SledStorage::open(&path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                tracing::info!("Persisting sessions to {}", path.display());
                Arc::new(StoredPersistence::new(storage))
            }
            None => Arc::new(NoopPersistence),
        };

    let hub_config = HubConfig {
        sweeper: LivenessSweeper::new(
            Duration::from_secs(config.sweep_interval_secs),
            Duration::from_secs(config.node_timeout_secs),
        ),
        default_region: config.default_region.clone(),
    };

    let (hub, handle) = Hub::new(hub_config, access, persistence);
    let hub_task = hub.spawn();

    println!("{}", "Ghost Relay directory".bold());
    println!("  {:<12} {}", "Port:".bright_cyan(), port);
    println!(
        "  {:<12} {}s timeout, {}s sweep",
        "Liveness:".bright_cyan(),
        config.node_timeout_secs,
        config.sweep_interval_secs
    );
    println!();

    server::run(port, handle.clone(), shutdown_signal()).await?;

    // Hub sends every socket a going-away close before it exits
    let _ = handle.shutdown();
    let _ = hub_task.await;
    println!("{} Directory stopped", "✓".green());
    Ok(())
}

async fn cmd_node(config: config::Config, data_dir: Option<PathBuf>) -> Result<()> {
    let settings = &config.node;
    let node_id = settings
        .node_id
        .clone()
        .context("No node id: pass --node-id, set NODE_ID or `config set node.node_id`")?;
    let wallet = settings
        .wallet_address
        .clone()
        .context("No wallet: pass --wallet, set WALLET_ADDRESS or `config set node.wallet_address`")?;

    let identity = NodeIdentity::new(&node_id, &wallet, &settings.region);

    let storage: Arc<dyn StorageBackend> = match resolve_data_dir(data_dir, &config.data_dir) {
        Some(dir) => {
            let path = dir.join("chunks");
            let storage = SledStorage::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Arc::new(storage)
        }
        None => Arc::new(MemoryStorage::new()),
    };

    // Ledger integration is external; this one signs locally and keeps
    // records in memory
    tracing::warn!("Using in-memory ledger; transfers are not settled");
    let ledger = Arc::new(InMemoryLedger::new(wallet.clone()));

    let (agent, outbound) = NodeAgent::new(identity.clone(), ledger, storage, RelayTiming::default());
    let client_config = NodeClientConfig {
        signaling_url: settings.signaling_server.clone(),
        access_token: settings.access_token.clone(),
        heartbeat_interval: Duration::from_secs(settings.heartbeat_secs),
        ..NodeClientConfig::default()
    };
    let client = NodeClient::new(client_config, agent, outbound);

    let class = match identity.class {
        NodeClass::Bootstrap => "bootstrap",
        NodeClass::User => "user",
    };
    println!("{}", "Ghost Relay node".bold());
    println!("  {:<12} {}", "Node:".bright_cyan(), identity.node_id);
    println!("  {:<12} {}", "Wallet:".bright_cyan(), identity.wallet_address);
    println!("  {:<12} {}", "Region:".bright_cyan(), identity.region);
    println!("  {:<12} {}", "Class:".bright_cyan(), class);
    println!("  {:<12} {}", "Directory:".bright_cyan(), settings.signaling_server);
    println!();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    client.run(shutdown_rx).await?;
    println!("{} Node stopped", "✓".green());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None if config.list().iter().any(|(k, _)| *k == key) => {
                println!("{} = {}", key.bright_cyan(), "(unset)".dimmed());
            }
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {} {}",
                "File:".dimmed(),
                config::Config::config_file()?.display()
            );
        }
    }

    Ok(())
}
