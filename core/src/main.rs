use clap::Parser;
use meshmq::{Broker, BrokerConfig, MeshmqError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshmq")]
#[command(about = "A clustered AMQP-compatible message broker written in Rust")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value = "5672")]
    port: u16,

    /// Address peers use to reach this node (defaults to --host)
    #[arg(long, default_value = "")]
    advertise_host: String,

    /// Node RPC port (defaults to port + 1)
    #[arg(long, default_value = "0")]
    rpc_port: u16,

    /// Stable, non-zero node identifier
    #[arg(long, default_value = "1")]
    node_id: u64,

    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Permission bits for created data directories (octal)
    #[arg(long, default_value = "755")]
    dir_perm: String,

    /// Cluster peers to join, host:port, comma-separated
    #[arg(long)]
    join: Option<String>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let dir_perm = u32::from_str_radix(&args.dir_perm, 8)
        .map_err(|_| MeshmqError::Validation(format!("bad dir perm {:?}", args.dir_perm)))?;
    let join_peers = args
        .join
        .map(|peers| {
            peers
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let config = BrokerConfig {
        bind_host: args.host,
        port: args.port,
        advertise_host: args.advertise_host,
        rpc_port: args.rpc_port,
        node_id: args.node_id,
        data_dir: args.data_dir,
        dir_perm,
        join_peers,
        ..Default::default()
    };

    info!("starting meshmq node {} on {}:{}", config.node_id, config.bind_host, config.port);
    info!("data directory: {}", config.data_dir.display());
    if !config.join_peers.is_empty() {
        info!("joining peers: {:?}", config.join_peers);
    }

    let broker = Arc::new(Broker::new(config)?);

    let server = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            if let Err(e) = broker.run().await {
                error!("server error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down gracefully");
            broker.shutdown();
        }
        _ = server => {
            info!("server task completed");
        }
    }

    info!("meshmq shut down");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("invalid log level {:?}, defaulting to info", level);
            tracing::Level::INFO
        }
    }
}
