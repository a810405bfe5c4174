//! SPDK CSI Driver
//!
//! Serves the CSI Identity service plus the Controller and/or Node
//! services on a unix socket or TCP endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use spdk_csi::config::{
    ControllerConfig, DEFAULT_CONFIG_PATH, DEFAULT_NODE_CONFIG_PATH, DEFAULT_SECRET_PATH,
    NodeConfig, Secrets,
};
use spdk_csi::csi::controller_server::ControllerServer;
use spdk_csi::csi::identity_server::IdentityServer;
use spdk_csi::csi::node_server::NodeServer;
use spdk_csi::metrics;
use spdk_csi::platform::{SystemMounter, SystemRunner};
use spdk_csi::{
    ConfiguredEndpoints, ControllerService, DRIVER_NAME, DRIVER_VERSION, IdentityService, NodeEnv,
    NodeService,
};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "spdk-csi")]
#[command(about = "SPDK CSI Driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:///path/to/csi.sock or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Run in controller mode (enables controller service)
    #[arg(long, default_value = "false")]
    controller: bool,

    /// Run in node mode (enables node service)
    #[arg(long, default_value = "false")]
    node: bool,

    /// Driver name
    #[arg(long, default_value = DRIVER_NAME)]
    driver_name: String,

    /// Storage endpoint config for the controller
    #[arg(long, env = "SPDKCSI_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Storage endpoint credentials for the controller
    #[arg(long, env = "SPDKCSI_SECRET", default_value = DEFAULT_SECRET_PATH)]
    secret: PathBuf,

    /// Accelerator config for the node (optional file)
    #[arg(long, env = "SPDKCSI_CONFIG_NODESERVER", default_value = DEFAULT_NODE_CONFIG_PATH)]
    node_config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

/// Where the CSI gRPC server listens.
#[derive(Debug, PartialEq, Eq)]
enum Listen {
    Unix(PathBuf),
    Tcp(String),
}

fn parse_endpoint(endpoint: &str) -> Result<Listen, String> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(format!("missing socket path in endpoint '{}'", endpoint));
        }
        return Ok(Listen::Unix(PathBuf::from(path)));
    }
    if let Some(addr) = endpoint.strip_prefix("tcp://") {
        if addr.is_empty() {
            return Err(format!("missing address in endpoint '{}'", endpoint));
        }
        return Ok(Listen::Tcp(addr.to_string()));
    }
    Err(format!(
        "unsupported endpoint '{}', expected unix:// or tcp://",
        endpoint
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if !args.controller && !args.node {
        return Err("at least one of --controller or --node must be set".into());
    }

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %args.driver_name,
        version = DRIVER_VERSION,
        endpoint = %args.endpoint,
        node_id = %node_id,
        controller_mode = args.controller,
        node_mode = args.node,
        "Starting SPDK CSI Driver"
    );

    let controller = if args.controller {
        let config = ControllerConfig::load(&args.config)?;
        let secrets = if args.secret.exists() {
            Secrets::load(&args.secret)?
        } else {
            warn!(path = %args.secret.display(), "Secret file not found, requests must carry credentials");
            Secrets::default()
        };
        let endpoints = ConfiguredEndpoints::new(config, &secrets)?;
        Some(ControllerServer::new(ControllerService::new(Arc::new(endpoints))))
    } else {
        None
    };

    let node = if args.node {
        let node_config = NodeConfig::load_optional(&args.node_config)?;
        if let Some(xpu) = node_config.xpu_list.first() {
            info!(xpu = %xpu.name, target_type = %xpu.target_type, "Using storage accelerator");
        }
        let runner = Arc::new(SystemRunner::new());
        let mounter = Arc::new(SystemMounter::new(runner.clone()));
        let env = NodeEnv::new(runner, node_config);
        Some(NodeServer::new(NodeService::new(node_id.clone(), env, mounter)))
    } else {
        None
    };

    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityService::new(
            args.driver_name.clone(),
            args.controller,
        )))
        .add_optional_service(controller)
        .add_optional_service(node);

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    match parse_endpoint(&args.endpoint)? {
        Listen::Unix(path) => {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = UnixListener::bind(&path)?;
            info!(socket = %path.display(), "gRPC server listening on unix socket");
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await?;
        }
        Listen::Tcp(addr) => {
            let listener = TcpListener::bind(&addr).await?;
            info!(addr = %addr, "gRPC server listening on tcp");
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await?;
        }
    }

    info!("SPDK CSI driver shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    tokio::select! {
        _ = recv_or_pending(sigterm.as_mut()) => info!("Received SIGTERM"),
        _ = recv_or_pending(sigint.as_mut()) => info!("Received SIGINT"),
        _ = recv_or_pending(sighup.as_mut()) => info!("Received SIGHUP, shutting down"),
    }
}

/// A handler that failed to install never fires.
async fn recv_or_pending(sig: Option<&mut signal::unix::Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}
