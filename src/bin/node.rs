// one cluster node: the mutex engine, the TCP mesh, and the demo producer
// that appends records to the shared buffer server under the cluster lock

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use dme::{
    buffer::{self, Record, BUFFER_PORT},
    engine::{Algorithm, Engine, MutexHandle},
    net::session::{establish, MESH_PORT},
    quorum, NodeId,
};
use rand::Rng;
use tokio::net::{lookup_host, TcpListener};
use tracing::info;

fn parse_algorithm(algorithm: &str) -> anyhow::Result<Algorithm> {
    algorithm.parse()
}

#[derive(Parser)]
#[command(about = "distributed mutual exclusion cluster node")]
struct Cli {
    /// This node's id, in 1..=num_node.
    #[arg(long)]
    id: NodeId,
    /// Cluster size.
    #[arg(long)]
    num_node: u8,
    /// ricart, maekawa or fuchi; the whole cluster must agree.
    #[arg(long, default_value = "ricart", value_parser = parse_algorithm)]
    algorithm: Algorithm,
    /// Peer hostnames in node id order, this node included.
    #[arg(long = "peer", required = true)]
    peers: Vec<String>,
    /// Buffer server host.
    #[arg(long, default_value = "dme-bm")]
    buffer: String,
    /// Records to append under the mutex.
    #[arg(long, default_value_t = 100)]
    count: u32,
}

async fn produce(
    mut handle: MutexHandle,
    id: NodeId,
    count: u32,
    server: String,
) -> anyhow::Result<()> {
    for item in 0..count {
        // spread the contention a little, like real producers would
        let jitter = rand::thread_rng().gen_range(0..5);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        handle.acquire().await?;
        let record = Record { node: id, item };
        let slot = buffer::append((server.as_str(), BUFFER_PORT), record).await?;
        info!("appended item {item} at slot {slot}");
        handle.release()?
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    anyhow::ensure!(
        cli.peers.len() == cli.num_node as usize,
        "{} peers for a {} node cluster",
        cli.peers.len(),
        cli.num_node
    );
    if !matches!(cli.algorithm, Algorithm::Ricart) {
        let family = quorum::family(cli.num_node).ok_or(anyhow::anyhow!(
            "no voting sets for a {} node cluster",
            cli.num_node
        ))?;
        quorum::validate(cli.num_node, family)?
    }
    let mut addrs = Vec::new();
    for peer in &cli.peers {
        let addr = lookup_host((peer.as_str(), MESH_PORT))
            .await?
            .next()
            .ok_or(anyhow::anyhow!("cannot resolve {peer}"))?;
        addrs.push(addr)
    }

    let (mut engine, handle, ingress, egress) = Engine::new(cli.algorithm, cli.id, cli.num_node)?;
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], MESH_PORT))).await?;
    let mut mesh = establish(listener, cli.id, cli.num_node, addrs, ingress).await?;
    info!("node {} of {} running {}", cli.id, cli.num_node, cli.algorithm);

    let workload = async {
        produce(handle, cli.id, cli.count, cli.buffer.clone()).await?;
        info!("workload complete, serving peers until interrupted");
        tokio::signal::ctrl_c().await?;
        anyhow::Ok(())
    };
    tokio::select! {
        result = engine.run() => result,
        result = mesh.run(egress) => result,
        result = workload => result,
    }
}
