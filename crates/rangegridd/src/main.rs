//! rangegridd: the RangeGrid daemon.
//!
//! Runs an in-process cluster (one master, N region servers) over an
//! on-disk region store, with failure detection and region reassignment
//! live. The daemon runs until Ctrl-C, then stops every region server
//! cleanly before the master.
//!
//! # Usage
//!
//! ```text
//! rangegridd local --servers 3 --config rangegrid.toml --table orders --split m
//! rangegridd check-config --config rangegrid.toml
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use rangegrid_core::ClusterConfig;
use rangegrid_master::LocalCluster;
use rangegrid_state::StateStore;

#[derive(Parser)]
#[command(name = "rangegridd", about = "RangeGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a master and region servers in this process.
    Local {
        /// Number of region servers to start.
        #[arg(long, default_value = "3")]
        servers: usize,

        /// Cluster configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `storage.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Create this table after bootstrap if it does not exist yet.
        #[arg(long)]
        table: Option<String>,

        /// Split keys for `--table`.
        #[arg(long = "split", requires = "table")]
        splits: Vec<String>,
    },

    /// Parse and validate a configuration file, then print it resolved.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,rangegridd=debug,rangegrid_master=debug")
    });
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Local {
            servers,
            config,
            data_dir,
            table,
            splits,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            run_local(config, servers, table, splits).await
        }
        Command::CheckConfig { config } => {
            let config = ClusterConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ClusterConfig> {
    match path {
        Some(path) => {
            let config = ClusterConfig::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            Ok(config)
        }
        None => {
            info!("no configuration file given, using defaults");
            Ok(ClusterConfig::default())
        }
    }
}

async fn run_local(
    config: ClusterConfig,
    servers: usize,
    table: Option<String>,
    splits: Vec<String>,
) -> anyhow::Result<()> {
    info!(servers, "RangeGrid daemon starting in local mode");

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let db_path = config.storage.data_dir.join("rangegrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "region store opened");

    let cluster = LocalCluster::start(config, store, servers).await?;

    if let Some(name) = table {
        let splits: Vec<&str> = splits.iter().map(String::as_str).collect();
        match cluster.master().create_table(&name, &splits).await {
            Ok(regions) => info!(table = %name, regions = regions.len(), "table ready"),
            Err(rangegrid_master::CoordinatorError::TableExists(_)) => {
                info!(table = %name, "table already exists");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let waiting = cluster.master().unassigned_regions();
    if !waiting.is_empty() {
        warn!(regions = waiting.len(), "shutting down with unassigned regions");
    }
    cluster.shutdown().await?;

    info!("RangeGrid daemon stopped");
    Ok(())
}
