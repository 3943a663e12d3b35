mod api;
mod chain;
mod config;
mod runner;
mod status;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use verdant_protocol::{AgreementConfig, AgreementEngine, GossipConfig, GossipNode, P2pConfig};

use chain::Chain;

// Exit codes promised to operators.
const EXIT_BAD_CONFIG: i32 = 1;
const EXIT_LISTEN_FAILED: i32 = 2;
const EXIT_CHAIN_UNREACHABLE: i32 = 3;

#[derive(Parser)]
#[command(name = "verdant-validator", about = "Verdant farm-scoring validator node")]
struct Cli {
    /// Settlement chain RPC gateway (e.g. https://rpc.verdant.example)
    #[arg(long, env = "VERDANT_RPC_URL")]
    rpc_url: String,

    /// Auth token for the RPC gateway (empty disables auth)
    #[arg(long, env = "VERDANT_RPC_TOKEN", default_value = "")]
    rpc_token: String,

    /// This validator's settlement address
    #[arg(long, env = "VERDANT_ADDRESS")]
    address: String,

    /// Data directory (holds p2p_config.json)
    #[arg(long, default_value = "data", env = "VERDANT_DATA_DIR")]
    data_dir: String,

    /// Port for the HTTP status API
    #[arg(long, default_value = "7600", env = "VERDANT_STATUS_PORT")]
    status_port: u16,

    /// Seconds between scoring rounds
    #[arg(long, default_value = "30")]
    fetch_interval: u64,

    /// Seconds between decision polls
    #[arg(long, default_value = "5")]
    decision_interval: u64,

    /// Seconds between status broadcasts
    #[arg(long, default_value = "60")]
    status_interval: u64,

    /// Seconds between chain head polls
    #[arg(long, default_value = "15")]
    block_poll: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::Config {
        rpc_url: cli.rpc_url,
        auth_token: cli.rpc_token,
        validator_address: cli.address,
        data_dir: cli.data_dir,
        status_port: cli.status_port,
        fetch_interval_secs: cli.fetch_interval,
        decision_interval_secs: cli.decision_interval,
        status_interval_secs: cli.status_interval,
        block_poll_secs: cli.block_poll,
    };

    let node_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(node_id = %node_id, address = %cfg.validator_address, "Starting verdant validator");

    // P2P configuration; a missing file is replaced with defaults, an
    // unreadable one is fatal.
    let p2p_config = match P2pConfig::load(&cfg.data_dir) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid p2p configuration");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };
    let (listen_addrs, bootstrap_peers) = match (
        p2p_config.listen_socket_addrs(),
        p2p_config.bootstrap_socket_addrs(),
    ) {
        (Ok(listen), Ok(bootstrap)) => (listen, bootstrap),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Invalid p2p address configuration");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    // Probe the chain before joining the overlay.
    let chain = Arc::new(chain::RpcChain::new(&cfg));
    match chain.latest_block().await {
        Ok(block) => tracing::info!(block, "Connected to settlement chain"),
        Err(e) => {
            tracing::error!(error = %e, "Settlement chain unreachable");
            std::process::exit(EXIT_CHAIN_UNREACHABLE);
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let gossip_config = GossipConfig {
        node_id: node_id.clone(),
        listen_addrs,
        bootstrap_peers,
        ..GossipConfig::default()
    };
    let gossip = Arc::new(GossipNode::new(gossip_config, shutdown_rx.clone()));
    let bound = match gossip.start().await {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start p2p transport");
            std::process::exit(EXIT_LISTEN_FAILED);
        }
    };

    let engine = Arc::new(AgreementEngine::new(node_id, AgreementConfig::default()));
    let status_port = cfg.status_port;
    let node = runner::ValidatorNode::new(
        cfg,
        gossip,
        engine,
        chain,
        bound,
        shutdown_rx.clone(),
    )
    .await;
    node.start();

    let api_inner = node.inner.clone();
    tokio::spawn(api::serve(api_inner, status_port, shutdown_rx));

    shutdown_signal().await;
    tracing::info!("Shutting down gracefully");
    let _ = shutdown_tx.send(true);
    // Let in-flight sends and loop bodies finish.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    tracing::info!("Validator shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
