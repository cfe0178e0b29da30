//! Master binary

use clap::{Parser, Subcommand};
use replicadir::common::{parse_duration, Config, GroundBackend};
use replicadir::Master;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "replicadir-master")]
#[command(about = "replicadir master: chunk replica directory")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the master server
    Serve {
        /// Configuration file (defaults to ./replicadir.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Ground store directory
        #[arg(long)]
        ground_path: Option<PathBuf>,

        /// Ground store backend (rocksdb or memory)
        #[arg(long)]
        ground_backend: Option<String>,

        /// Time a silent location stays suspect before it is declared down
        #[arg(long, value_parser = parse_duration)]
        grace_period: Option<std::time::Duration>,

        /// Share of new chunks using sequoia tracking (0-100)
        #[arg(long)]
        sequoia_percentage: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            ground_path,
            ground_backend,
            grace_period,
            sequoia_percentage,
        } => {
            // File and environment first, CLI flags win
            let mut config = Config::load(config.as_deref())?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.master.bind_addr = bind;
            }
            if let Some(path) = ground_path {
                config.master.ground.path = path;
            }
            if let Some(backend) = ground_backend {
                config.master.ground.backend = match backend.as_str() {
                    "rocksdb" => GroundBackend::Rocksdb,
                    "memory" => GroundBackend::Memory,
                    other => anyhow::bail!("unknown ground backend: {}", other),
                };
            }
            if let Some(grace) = grace_period {
                config.reconciler.grace_period_ms = grace.as_millis() as u64;
            }
            if let Some(pct) = sequoia_percentage {
                config.chunk_manager.sequoia_chunk_replicas_percentage = pct;
            }
            config.validate()?;

            Master::new(config).serve().await?;
        }
    }

    Ok(())
}
