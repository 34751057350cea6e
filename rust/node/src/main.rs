//! mlsync node service
//!
//! Every cluster member runs this binary. It serves the node RPCs (sync,
//! broadcast, load, unload). The one elected coordinator also runs the
//! periodic reconciliation loop that keeps every node's routing table in
//! step with what is actually loaded.
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings
//! mlsync-node
//!
//! # Start with a configuration file
//! mlsync-node --config node.toml
//!
//! # Override identity and address
//! mlsync-node --config node.toml --node-id worker-2 --listen-address 0.0.0.0:50062
//! ```

mod service;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mlsync_core::rpc::proto::node_service_server::NodeServiceServer;
use mlsync_core::{
    ClusterView, GrpcTransport, InMemoryEngine, LocalModelSource, MlSyncConfig, NodeDirectory,
    NodeHandler, NodeModelRegistry, NodeStats, StaticDirectory, SyncCoordinator,
};
use service::NodeServiceImpl;

/// Model routing synchronization node
#[derive(Parser, Debug)]
#[command(name = "mlsync-node")]
#[command(about = "Cluster node service for model routing synchronization")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long)]
    node_id: Option<String>,

    /// Address to listen on, host:port (overrides config)
    #[arg(short, long)]
    listen_address: Option<String>,

    /// Reconciliation interval in milliseconds (overrides config)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Mark this node eligible to run the reconciliation loop
    #[arg(long)]
    coordinator: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> mlsync_core::Result<MlSyncConfig> {
    let mut config = match &args.config {
        Some(path) => MlSyncConfig::from_file(path)?,
        None => MlSyncConfig::default(),
    }
    .with_env_overrides();

    if let Some(node_id) = &args.node_id {
        config.node.node_id = node_id.clone();
    }
    if let Some(address) = &args.listen_address {
        config.node.listen_address = address.clone();
    }
    if let Some(interval_ms) = args.interval_ms {
        config.sync.interval_ms = interval_ms;
    }
    if args.coordinator {
        config.node.coordinator = true;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;

    tracing::info!("Starting mlsync node {}", config.node.node_id);
    tracing::info!("  Peers: {}", config.node.peers.len());
    tracing::info!("  Worker: {}", config.node.worker);
    tracing::info!("  Coordinator-eligible: {}", config.node.coordinator);
    tracing::info!("  Sync interval: {}ms", config.sync.interval_ms);
    tracing::info!("  Fan-out timeout: {}ms", config.sync.fan_out_timeout_ms);
    tracing::info!("  Artifact dir: {}", config.models.artifact_dir.display());

    let directory: Arc<dyn NodeDirectory> = Arc::new(StaticDirectory::from_config(&config.node));
    let stats = Arc::new(NodeStats::new());

    // Node-local state
    let engine = Arc::new(InMemoryEngine::new());
    let registry = Arc::new(NodeModelRegistry::new(
        config.node.node_id.clone(),
        engine,
    ));
    let source = Arc::new(LocalModelSource::from_config(&config.models)?);
    let handler = Arc::new(NodeHandler::new(
        registry,
        source,
        Arc::new(ClusterView::new()),
        stats.clone(),
    ));

    // Start the reconciliation loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_loop = if directory.is_elected_coordinator() {
        let transport = Arc::new(GrpcTransport::new(directory.clone(), &config.sync));
        let coordinator = SyncCoordinator::new(directory.clone(), transport, stats.clone(), &config.sync);
        Some(Arc::new(coordinator).spawn(Duration::from_millis(config.sync.interval_ms), shutdown_rx))
    } else {
        tracing::info!(
            elected = ?directory.elected_coordinator(),
            "Not the elected coordinator, reconciliation loop not started"
        );
        None
    };

    let addr: SocketAddr = config.node.listen_address.parse()?;
    tracing::info!("Listening on {}", addr);

    // Start gRPC server
    let service = NodeServiceImpl::new(handler);
    Server::builder()
        .add_service(NodeServiceServer::new(service))
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for CTRL+C: {}", e);
            }
            tracing::info!("Shutting down node...");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sync_loop {
        handle.await?;
    }

    tracing::info!("Final stats: {:?}", stats.snapshot());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["mlsync-node"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
node_id = "from-file"
listen_address = "127.0.0.1:50070"

[sync]
interval_ms = 1000
"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = load_config(&args(&[
            "--config",
            &path,
            "--node-id",
            "from-cli",
            "--interval-ms",
            "250",
            "--coordinator",
        ]))
        .unwrap();

        assert_eq!(config.node.node_id, "from-cli");
        assert_eq!(config.node.listen_address, "127.0.0.1:50070");
        assert_eq!(config.sync.interval_ms, 250);
        assert!(config.node.coordinator);
    }

    #[test]
    fn test_invalid_override_rejected() {
        assert!(load_config(&args(&["--interval-ms", "0"])).is_err());
    }
}
