//! fleetd: the fleet daemon.
//!
//! Runs the supervisor for one fleet against a local process provider, and
//! carries the operator commands that act on the same state file.
//!
//! # Usage
//!
//! ```text
//! fleetd --config /etc/fleetd.toml run
//! fleetd --data-dir /var/lib/fleet rollout registry.example.com/runner:v42
//! fleetd override env-1234 --memory-mb 4096
//! fleetd nodes --state running
//! ```
//!
//! The state file is opened exclusively, so operator commands run while
//! the daemon is stopped or against a copy.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use fleet::{Fleet, RolloutOptions};
use fleet_provider::verifier::DEFAULT_IMAGE_TYPE;
use fleet_provider::{LocalProvider, Verifiers};
use fleet_state::{NodeConfigPatch, NodeSearch, NodeState, StateStore};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet lifecycle daemon", version)]
struct Cli {
    /// Path to fleetd.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the fleet state files. Overrides the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Fleet to act on. Overrides the config file.
    #[arg(long, global = true)]
    fleet_id: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor until Ctrl-C.
    Run,
    /// Publish a new image for the fleet.
    Rollout {
        image: String,
        /// Verifier used to check the image.
        #[arg(long, default_value = DEFAULT_IMAGE_TYPE)]
        image_type: String,
        /// Publish without verifying the image.
        #[arg(long)]
        no_verify: bool,
    },
    /// Change node sizing for one routing id. Unset flags keep their value.
    Override {
        routing_id: String,
        /// Pin an image until the next rollout.
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        cpu_milli: Option<u32>,
        #[arg(long)]
        memory_mb: Option<u32>,
        #[arg(long)]
        storage_mb: Option<u32>,
        #[arg(long = "tracing")]
        tracing_enabled: Option<bool>,
        #[arg(long = "profiling")]
        profiling_enabled: Option<bool>,
        #[arg(long)]
        idle_max_duration_ms: Option<u64>,
        #[arg(long)]
        execution_timeout_secs: Option<u64>,
        #[arg(long)]
        provisioned_concurrency: Option<u32>,
    },
    /// List nodes as JSON lines.
    Nodes {
        #[arg(long)]
        routing_id: Option<String>,
        /// Only nodes in these states (repeatable).
        #[arg(long = "state")]
        states: Vec<NodeState>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(id) = cli.fleet_id {
        config.fleet_id = id;
    }

    let fleet = open_fleet(&config)?;
    match cli.command {
        Command::Run => run(fleet, config).await,
        Command::Rollout {
            image,
            image_type,
            no_verify,
        } => {
            let deployment = fleet
                .rollout(
                    &image,
                    RolloutOptions {
                        image_type,
                        verify_image: !no_verify,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string(&deployment)?);
            Ok(())
        }
        Command::Override {
            routing_id,
            image,
            cpu_milli,
            memory_mb,
            storage_mb,
            tracing_enabled,
            profiling_enabled,
            idle_max_duration_ms,
            execution_timeout_secs,
            provisioned_concurrency,
        } => {
            let patch = NodeConfigPatch {
                image,
                cpu_milli,
                memory_mb,
                storage_mb,
                is_tracing_enabled: tracing_enabled,
                is_profiling_enabled: profiling_enabled,
                idle_max_duration_ms,
                execution_timeout_secs,
                provisioned_concurrency,
            };
            match fleet.override_node_config(&routing_id, &patch)? {
                Some(stored) => println!("{}", serde_json::to_string(&stored)?),
                None => println!("{routing_id}: matches defaults, no override stored"),
            }
            Ok(())
        }
        Command::Nodes { routing_id, states } => {
            let mut search = NodeSearch::default().with_states(&states);
            search.routing_id = routing_id;
            for node in fleet.store().search_all_nodes(&search)? {
                println!("{}", serde_json::to_string(&node)?);
            }
            Ok(())
        }
    }
}

fn open_fleet(config: &DaemonConfig) -> anyhow::Result<Fleet> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    info!(path = ?db_path, fleet_id = %config.fleet_id, "state store opened");

    let provider = Arc::new(LocalProvider::new(config.provider_config()));
    Ok(Fleet::new(
        &config.fleet_id,
        store,
        provider,
        Verifiers::with_defaults(),
        config.fleet.clone().into(),
    ))
}

async fn run(fleet: Fleet, config: DaemonConfig) -> anyhow::Result<()> {
    info!(fleet_id = %fleet.id(), "fleet daemon starting");
    match fleet.get_active_deployment()? {
        Some(d) => info!(deployment_id = d.id, image = %d.image, "active deployment"),
        None => info!("no active deployment yet; waiting for a rollout"),
    }

    let supervisor = fleet.supervisor(config.supervisor.into());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        supervisor.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    handle.await?;

    info!("fleet daemon stopped");
    Ok(())
}
