use clap::Parser;
use log::info;
use tokio::sync::watch;

use courier::{cluster, server, Node, NodeConfig, ReplicationMode};

/// Replicated, ordered message log node.
#[derive(Parser, Debug)]
#[command(name = "courier", version)]
struct Args {
    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on; also names the node's database file.
    #[arg(long)]
    port: u16,

    /// Node identifier, unique within the cluster.
    #[arg(long = "id")]
    id: String,

    /// Comma-separated peer base URLs, e.g. http://127.0.0.1:8001.
    #[arg(long, default_value = "")]
    peers: String,

    #[arg(long = "replication_mode", value_enum, default_value_t = ReplicationMode::Async)]
    replication_mode: ReplicationMode,

    /// Acknowledgments required in sync_quorum mode, local write included.
    #[arg(long, default_value_t = 2)]
    quorum: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let peers: Vec<String> = args
        .peers
        .split(',')
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(str::to_owned)
        .collect();

    let mut config = NodeConfig::new(args.host, args.port, args.id, peers);
    config.replication_mode = args.replication_mode;
    config.replication_quorum = args.quorum;

    let node = Node::new(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = cluster::spawn_background(node.clone(), shutdown_rx.clone());
    let mut server = tokio::spawn(server::serve(node, shutdown_rx));

    tokio::select! {
        result = &mut server => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let _ = shutdown_tx.send(true);
            for task in background {
                let _ = task.await;
            }
            server.await??;
        }
    }
    Ok(())
}
