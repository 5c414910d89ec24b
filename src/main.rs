use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadmesh::{NodeId, Simnet};

#[derive(Parser, Debug)]
#[command(name = "kadmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes to spawn besides the master.
    #[arg(short, long, default_value = "10")]
    cluster_size: usize,

    /// Probability in [0, 1] that the transport drops a frame.
    #[arg(short, long, default_value = "0.0")]
    drop_probability: f64,

    /// Log every routed/dropped frame.
    #[arg(long)]
    debug_transport: bool,

    /// Seconds between record re-checks.
    #[arg(short, long, default_value = "5")]
    check_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let simnet = Simnet::new(args.debug_transport, args.drop_probability);
    simnet.start();
    info!(master = %simnet.master_contact(), "simnet started");

    let nodes = simnet.spawn_cluster(args.cluster_size.max(1)).await;
    info!(nodes = nodes.len(), "cluster ready");

    let key = NodeId::random();
    nodes[0].store_record(key).await;
    info!(key = %key.short(), from = %nodes[0].contact(), "record stored");

    let reader = &nodes[nodes.len() - 1];
    let mut interval = time::interval(Duration::from_secs(args.check_interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = interval.tick() => {
                match reader.find_record(key).await {
                    Ok(holders) => {
                        info!(key = %key.short(), holders = holders.len(), "record fully replicated");
                    }
                    Err(error) => {
                        warn!(key = %key.short(), %error, "record not fully replicated");
                    }
                }
            }
        }
    }

    Ok(())
}
