//! verisca-sync: crop loss assessment sync server and field sync client
//!
//! - `serve`       - run the authoritative sync server over HTTP
//! - `sync`        - push the local pending log, then pull claims
//! - `watch`       - keep syncing in the background until interrupted
//! - `interpolate` - read a value off a lookup curve

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use verisca_sync::api::create_router;
use verisca_sync::config::Config;
use verisca_sync::lookup::{LookupSource, LookupTableStore};
use verisca_sync::model::GrowthStage;
use verisca_sync::storage::{LocalStore, ServerStore};
use verisca_sync::sync::{AssessorIdentity, HttpTransport, SyncCoordinator, SyncServer, SyncTrigger};

#[derive(Parser)]
#[command(name = "verisca-sync")]
#[command(about = "Offline-first crop loss assessment: sync server and field client")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "verisca-sync.toml", env = "VERISCA_CONFIG")]
    config: String,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "VERISCA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync server
    Serve {
        /// Listen address (overrides config file)
        #[arg(long, env = "VERISCA_LISTEN_ADDR")]
        listen: Option<String>,
    },
    /// Push pending work and pull assigned claims once
    Sync {
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Sync on an interval until interrupted
    Watch {
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Interpolate a lookup curve
    Interpolate {
        /// Table name, e.g. stand_reduction_potential
        table: String,
        /// Condition label (growth stage)
        condition: String,
        /// Input value (stress percentage)
        value: f64,
    },
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Sync server base URL (overrides config file)
    #[arg(long, env = "VERISCA_SERVER_URL")]
    server_url: Option<String>,

    #[arg(long, env = "VERISCA_ASSESSOR_ID")]
    assessor_id: Option<Uuid>,

    #[arg(long, env = "VERISCA_TENANT_ID")]
    tenant_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_found = std::path::Path::new(&cli.config).exists();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Config file: {}", cli.config);
    if !config_found {
        info!("Config file not found, using defaults");
    }

    match cli.command {
        Command::Serve { listen } => serve(config, cli.data_dir, listen).await,
        Command::Sync { remote } => sync_once(config, cli.data_dir, remote).await,
        Command::Watch { remote } => watch(config, cli.data_dir, remote).await,
        Command::Interpolate {
            table,
            condition,
            value,
        } => interpolate(&config, &table, &condition, value),
    }
}

async fn serve(mut config: Config, data_dir: Option<PathBuf>, listen: Option<String>) -> anyhow::Result<()> {
    if let Some(data_dir) = data_dir {
        config.server.data_dir = data_dir;
    }
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    info!("Data dir: {}", config.server.data_dir.display());

    let store = Arc::new(ServerStore::open(&config.server.data_dir)?);
    let app = create_router(SyncServer::new(store));

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    info!("Sync server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;
    Ok(())
}

fn coordinator(mut config: Config, data_dir: Option<PathBuf>, remote: RemoteArgs) -> anyhow::Result<SyncCoordinator> {
    if let Some(data_dir) = data_dir {
        config.client.data_dir = data_dir;
    }
    let server_url = remote.server_url.unwrap_or(config.client.server_url);
    let identity = AssessorIdentity {
        assessor_id: remote
            .assessor_id
            .or(config.client.assessor_id)
            .context("assessor id is not configured")?,
        tenant_id: remote
            .tenant_id
            .or(config.client.tenant_id)
            .context("tenant id is not configured")?,
    };

    info!("Data dir: {}", config.client.data_dir.display());
    info!(%server_url, assessor_id = %identity.assessor_id, "Sync target");

    let store = Arc::new(LocalStore::open(&config.client.data_dir)?);
    let transport = Arc::new(HttpTransport::new(server_url, identity, config.sync.request_timeout())?);
    Ok(SyncCoordinator::new(store, transport, config.sync))
}

async fn sync_once(config: Config, data_dir: Option<PathBuf>, remote: RemoteArgs) -> anyhow::Result<()> {
    let coordinator = coordinator(config, data_dir, remote)?;
    let report = coordinator.sync_once().await?;
    println!("{:#?}", report);
    Ok(())
}

async fn watch(config: Config, data_dir: Option<PathBuf>, remote: RemoteArgs) -> anyhow::Result<()> {
    let coordinator = Arc::new(coordinator(config, data_dir, remote)?);
    let (trigger_tx, trigger_rx) = mpsc::channel::<SyncTrigger>(16);

    let handle = tokio::spawn(coordinator.run(trigger_rx));
    info!("Background sync started");

    tokio::signal::ctrl_c().await?;
    info!("Stopping background sync");
    drop(trigger_tx);
    handle.await?;
    Ok(())
}

fn interpolate(config: &Config, table: &str, condition: &str, value: f64) -> anyhow::Result<()> {
    let lookup = match &config.lookup.seed_file {
        Some(path) => LookupTableStore::load(path)?,
        None => LookupTableStore::with_builtin_seed()?,
    };
    let condition = GrowthStage::parse(condition)
        .map(|stage| stage.to_string())
        .unwrap_or_else(|_| condition.to_string());

    let output = lookup.interpolate(table, &condition, value)?;
    println!("{}", output);
    Ok(())
}
