use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flotilla::config::{ClusterTopology, NodeConfig};
use flotilla::node::Node;
use flotilla::shutdown::install_shutdown_handler;

#[derive(Parser)]
#[command(name = "flotilla", version, about = "Leader election and cluster membership coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coordination node
    Server(ServerArgs),
    /// Check a topology file and exit
    ValidateTopology {
        /// Path to the JSON topology file
        file: PathBuf,
    },
}

#[derive(clap::Args)]
struct ServerArgs {
    /// Unique id of this node
    #[arg(long)]
    node_id: u64,

    /// Id of the cluster this node belongs to
    #[arg(long, default_value_t = 1)]
    cluster_id: u32,

    /// Address to accept management connections on
    #[arg(long, default_value = "127.0.0.1:7400")]
    listen: SocketAddr,

    /// Local-cluster peer as id:host:port (repeatable)
    #[arg(long = "peer", value_name = "ID:HOST:PORT")]
    peers: Vec<String>,

    /// Path to the JSON topology of all known clusters
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Election engine implementation to use
    #[arg(long, default_value = "raft")]
    election: String,

    /// Leader-discovery attempts before declaring the leader dead
    #[arg(long, default_value_t = 2)]
    discovery_retries: u32,

    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    reconnect_backoff_secs: u64,

    #[arg(long, default_value_t = 150)]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 500)]
    election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 1000)]
    election_timeout_max_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::ValidateTopology { file } => {
            let topology = ClusterTopology::from_file(&file)?;
            println!(
                "{} valid: {} clusters",
                file.display(),
                topology.clusters().len()
            );
            Ok(())
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NodeConfig::new(args.node_id, args.cluster_id, args.listen);
    config.election_impl = args.election;
    config.discovery_retry_budget = args.discovery_retries;
    config.connect_timeout = Duration::from_secs(args.connect_timeout_secs);
    config.reconnect_backoff = Duration::from_secs(args.reconnect_backoff_secs);
    config.heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);
    config.election_timeout_min_ms = args.election_timeout_min_ms;
    config.election_timeout_max_ms = args.election_timeout_max_ms;

    for spec in &args.peers {
        let (id, addr) = parse_peer(spec)?;
        config = config.with_peer(id, addr);
    }

    let topology = match &args.topology {
        Some(path) => ClusterTopology::from_file(path)?,
        None => ClusterTopology::default(),
    };

    tracing::info!(
        node_id = config.node_id,
        cluster_id = config.cluster_id,
        listen = %config.listen_addr,
        peers = config.peers.len(),
        "starting coordination node"
    );

    let shutdown = install_shutdown_handler();
    Node::new(config, topology).run(shutdown).await?;
    Ok(())
}

fn parse_peer(spec: &str) -> Result<(u64, String), String> {
    let (id, addr) = spec
        .split_once(':')
        .ok_or_else(|| format!("invalid peer spec '{spec}', expected id:host:port"))?;
    let id = id
        .parse()
        .map_err(|_| format!("invalid node id in peer spec '{spec}'"))?;
    if !addr.contains(':') {
        return Err(format!("missing port in peer spec '{spec}'"));
    }
    Ok((id, addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_spec_parses() {
        assert_eq!(
            parse_peer("2:10.0.0.5:7401").unwrap(),
            (2, "10.0.0.5:7401".to_string())
        );
        assert!(parse_peer("2:nohost").is_err());
        assert!(parse_peer("abc:h:1").is_err());
    }
}
