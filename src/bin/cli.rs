//! Inspection CLI for a replicadir master

use clap::{Parser, Subcommand, ValueEnum};
use replicadir::common::retry_with_backoff;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "replicadir")]
#[command(about = "replicadir inspection CLI")]
#[command(version)]
struct Cli {
    /// Master URL
    #[arg(long, default_value = "http://localhost:7000")]
    master: String,

    /// Attempts for transient HTTP failures
    #[arg(long, default_value = "3")]
    retries: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the authoritative state of a chunk
    Chunk {
        /// Chunk id (a leading '#' is accepted)
        id: String,
    },

    /// Show one replica view of a chunk
    StoredReplicas {
        id: String,

        #[arg(long, value_enum, default_value = "all")]
        view: ReplicaView,
    },

    /// Dump ground store rows
    Ground {
        #[command(subcommand)]
        table: GroundTable,
    },

    /// Compare the ground store with the directory
    Verify,

    /// Re-project divergent chunks and delete orphaned rows
    Repair {
        /// Only report what would be repaired
        #[arg(long)]
        dry_run: bool,
    },

    /// Master status
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReplicaView {
    All,
    Sequoia,
    Master,
    LastSeen,
}

impl ReplicaView {
    fn path(self) -> &'static str {
        match self {
            ReplicaView::All => "stored_replicas",
            ReplicaView::Sequoia => "stored_sequoia_replicas",
            ReplicaView::Master => "stored_master_replicas",
            ReplicaView::LastSeen => "last_seen_replicas",
        }
    }
}

#[derive(Subcommand)]
enum GroundTable {
    /// `chunk_replicas` rows, or the row of one chunk
    ChunkReplicas { chunk: Option<String> },
    /// `location_replicas` rows, or the rows of one location
    LocationReplicas { location: Option<String> },
}

struct Client {
    http: reqwest::Client,
    base: String,
    retries: usize,
}

impl Client {
    async fn send(&self, method: reqwest::Method, path: &str) -> replicadir::Result<serde_json::Value> {
        let url = format!("{}{}", self.base.trim_end_matches('/'), path);
        let (url, method, http) = (&url, &method, &self.http);
        retry_with_backoff(
            move || async move {
                let resp = http.request(method.clone(), url).send().await?;
                let status = resp.status();
                let body: serde_json::Value = resp.json().await?;
                if status.is_server_error() && status != reqwest::StatusCode::SERVICE_UNAVAILABLE {
                    return Err(replicadir::Error::Http(format!("{}: {}", status, body)));
                }
                if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                    return Err(replicadir::Error::GroundUnavailable(body.to_string()));
                }
                if !status.is_success() {
                    return Err(replicadir::Error::InvalidArgument(format!("{}: {}", status, body)));
                }
                Ok(body)
            },
            self.retries.max(1),
            Duration::from_millis(200),
        )
        .await
    }

    async fn get(&self, path: &str) -> replicadir::Result<serde_json::Value> {
        self.send(reqwest::Method::GET, path).await
    }

    async fn post(&self, path: &str) -> replicadir::Result<serde_json::Value> {
        self.send(reqwest::Method::POST, path).await
    }
}

fn print(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = Client {
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?,
        base: cli.master.clone(),
        retries: cli.retries,
    };

    match cli.command {
        Commands::Chunk { id } => {
            let id: replicadir::ChunkId = id.parse()?;
            print(&client.get(&format!("/chunks/{}", id)).await?)?;
        }

        Commands::StoredReplicas { id, view } => {
            let id: replicadir::ChunkId = id.parse()?;
            print(&client.get(&format!("/chunks/{}/{}", id, view.path())).await?)?;
        }

        Commands::Ground { table } => {
            let path = match table {
                GroundTable::ChunkReplicas { chunk: Some(c) } => {
                    let c: replicadir::ChunkId = c.parse()?;
                    format!("/ground/chunk_replicas/{}", c)
                }
                GroundTable::ChunkReplicas { chunk: None } => "/ground/chunk_replicas".to_string(),
                GroundTable::LocationReplicas { location: Some(l) } => {
                    let l: replicadir::LocationId = l.parse()?;
                    format!("/ground/location_replicas/{}", l)
                }
                GroundTable::LocationReplicas { location: None } => {
                    "/ground/location_replicas".to_string()
                }
            };
            print(&client.get(&path).await?)?;
        }

        Commands::Verify => {
            let body = client.post("/admin/verify").await?;
            let report = &body["report"];
            println!("Verification report:");
            println!("  Total chunks: {}", report["total_chunks"]);
            println!("  Sequoia chunks: {}", report["sequoia_chunks"]);
            println!("  Consistent: {}", report["consistent"]);
            println!("  Missing rows: {}", json_len(&report["missing_rows"]));
            println!("  Divergent: {}", json_len(&report["divergent"]));
            println!(
                "  Orphaned rows: {} chunk, {} location",
                json_len(&report["orphaned_chunk_rows"]),
                json_len(&report["orphaned_location_rows"])
            );
            println!("  Lost: {}", report["lost"]);
            println!("  Underreplicated: {}", report["underreplicated"]);
        }

        Commands::Repair { dry_run } => {
            let path = format!("/admin/repair?dry_run={}", dry_run);
            let body = client.post(&path).await?;
            let report = &body["report"];
            println!("Repair report{}:", if dry_run { " (dry run)" } else { "" });
            println!("  Chunks checked: {}", report["chunks_checked"]);
            println!("  Chunks re-projected: {}", report["chunks_resynced"]);
            println!("  Location rows deleted: {}", report["location_rows_deleted"]);
        }

        Commands::Status => {
            print(&client.get("/admin/status").await?)?;
        }
    }

    Ok(())
}

fn json_len(value: &serde_json::Value) -> usize {
    value.as_array().map(Vec::len).unwrap_or(0)
}
