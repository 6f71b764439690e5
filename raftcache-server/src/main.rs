//! Raftcache node binary.
//!
//! Starts one cache node. The first ordinal of a stateful set (`*-0`), or a
//! node started with `--bootstrap`, seeds a new cluster when its data
//! directory is empty; every other node waits for a leader to add it.
//!
//! ```bash
//! raftcache-server --id cache-0 --addr cache-0.cache:7000 --data-dir /data \
//!     --voters cache-0,cache-1,cache-2
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use raftcache_core::ServerId;
use raftcache_server::{parse_voters, Node, NodeConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Replicated bucket cache node.
#[derive(Parser, Debug)]
#[command(name = "raftcache-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Unique id of this node, for example `cache-0`.
    #[arg(long = "id", env = "RAFT_ID")]
    id: String,

    /// Address other nodes use to reach this node (`host:port`).
    #[arg(long = "addr", env = "RAFT_ADDR")]
    addr: String,

    /// Socket to listen on. Defaults to all interfaces on the port of `--addr`.
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Directory for the Raft log, snapshots and bucket store.
    #[arg(long, env = "RAFT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Bootstrap a new cluster if the data directory is empty.
    #[arg(long)]
    bootstrap: bool,

    /// Comma-separated ids that join as voters.
    #[arg(long, env = "RAFT_VOTERS", default_value = "")]
    voters: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let id = ServerId::new(args.id)?;
    let mut config = NodeConfig::new(id, args.addr, args.data_dir)
        .with_bootstrap(args.bootstrap)
        .with_voters(parse_voters(&args.voters));
    if let Some(listen_addr) = args.listen_addr {
        config = config.with_listen_addr(listen_addr);
    }

    info!(
        node_id = %config.id,
        addr = %config.advertise_address,
        data_dir = %config.data_dir.display(),
        bootstrap = config.bootstrap,
        voters = ?config.voters,
        "Starting raftcache node"
    );

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "Failed to start node");
            return Err(e.into());
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    node.shutdown().await;
    Ok(())
}
