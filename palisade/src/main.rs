//! palisade: run a coordination service node.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use palisade_core::{LocalMesh, NodeConfig, Server};

#[derive(Parser, Debug)]
#[command(name = "palisade", about = "Replicated key-value coordination service node")]
struct Args {
    /// Human name of this member.
    #[arg(long, default_value = "default")]
    name: String,

    /// Data directory for the raft log and snapshots.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Initial cluster spec: name=url,name=url,…
    #[arg(long, default_value = "default=http://localhost:2380")]
    initial_cluster: String,

    /// Cluster token mixed into member identity.
    #[arg(long, default_value = "palisade-cluster")]
    initial_cluster_token: String,

    /// Bootstrap a new cluster instead of joining an existing one.
    #[arg(long)]
    new_cluster: bool,

    /// Recover from quorum loss by restarting as a standalone cluster.
    #[arg(long)]
    force_new_cluster: bool,

    /// Election timeout, in ticks.
    #[arg(long, default_value_t = 10)]
    election_ticks: usize,

    /// Tick interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Committed entries between snapshots.
    #[arg(long, default_value_t = 10_000)]
    snap_count: u64,

    /// Snapshot records retained on disk.
    #[arg(long, default_value_t = 5)]
    max_snapshots: usize,

    /// Advertised peer urls, comma separated.
    #[arg(long, default_value = "http://localhost:2380")]
    peer_urls: String,

    /// Advertised client urls, comma separated.
    #[arg(long, default_value = "http://localhost:2379")]
    client_urls: String,
}

fn split_urls(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = NodeConfig {
        data_dir: args
            .data_dir
            .unwrap_or_else(|| PathBuf::from(format!("{}.palisade", args.name))),
        name: args.name,
        initial_cluster: args.initial_cluster,
        initial_cluster_token: args.initial_cluster_token,
        new_cluster: args.new_cluster,
        force_new_cluster: args.force_new_cluster,
        election_ticks: args.election_ticks,
        tick_ms: args.tick_ms,
        snap_count: args.snap_count,
        max_snapshots: args.max_snapshots,
        peer_urls: split_urls(&args.peer_urls),
        client_urls: split_urls(&args.client_urls),
        ..NodeConfig::default()
    };

    let mesh = LocalMesh::new();
    let transport = mesh.transport();
    let server = match Server::new(cfg, transport) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to bootstrap server");
            std::process::exit(1);
        }
    };

    // Pump inbound raft messages into the server. With the in-process mesh
    // this only matters for multi-member setups driven from one binary; a
    // networked transport replaces this loop.
    let mut inbox = mesh.register(server.id());
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                let _ = server.process(msg);
            }
        });
    }

    server.start();
    info!("server started as member {:x}", server.id());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }
    server.stop().await;

    // Give spawned tasks a beat to observe shutdown before the runtime
    // drops them.
    tokio::time::sleep(Duration::from_millis(50)).await;
}
