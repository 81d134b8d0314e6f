//! CoralFS MDS - Metadata Server Daemon
//!
//! This binary wires the node core to a TCP transport, the stock
//! subsystems, a monitor quorum from configuration, and a Prometheus
//! metrics endpoint, then runs the event loop until the node dies.

use anyhow::{Context, Result};
use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, routing::get, Router};
use clap::Parser;
use coralfs_common::{Inst, MdsConfig, Rank, SystemClock};
use coralfs_map::MonMap;
use coralfs_mds::subsystems::stock::stock_subsystems;
use coralfs_mds::{Event, MdsNode, NodeDeps, NodeMetrics, TokioTimerDriver};
use coralfs_msg::Transport;
use coralfs_net::{NetEvent, TcpTransport};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "coralfs-mdsd")]
#[command(about = "CoralFS Metadata Server Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/coralfs/mds.toml")]
    config: String,

    /// Listen address for peer and client traffic
    #[arg(short, long)]
    listen: Option<String>,

    /// Monitor addresses (host:port), repeatable
    #[arg(long)]
    mon: Vec<String>,

    /// Rank to request from the monitors
    #[arg(long)]
    rank: Option<u32>,

    /// Offer this daemon as a standby instead of requesting a rank
    #[arg(long)]
    standby: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Metrics server port (Prometheus)
    #[arg(long, default_value = "9302")]
    metrics_port: u16,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    node: NodeSection,
    #[serde(default)]
    mds: MdsConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    mons: Vec<String>,
    /// Cluster filesystem id; must match the monitors'
    #[serde(default)]
    fsid: Option<Uuid>,
    #[serde(default)]
    rank: Option<u32>,
    #[serde(default)]
    standby: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mons: Vec::new(),
            fsid: None,
            rank: None,
            standby: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_listen() -> String {
    "0.0.0.0:6800".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        })
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    let listen = args.listen.unwrap_or(config.node.listen);
    let mons = if args.mon.is_empty() {
        config.node.mons
    } else {
        args.mon
    };
    let want_rank = if args.standby || config.node.standby {
        None
    } else {
        args.rank.or(config.node.rank).map(Rank::new)
    };
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting CoralFS MDS");
    info!("Config file: {}", args.config);

    if mons.is_empty() {
        error!(
            "No monitors configured. Use --mon or configure in {}",
            args.config
        );
        std::process::exit(1);
    }

    let fsid = config.node.fsid.unwrap_or_else(|| {
        warn!("no fsid configured, using the nil id; set node.fsid in production");
        Uuid::nil()
    });

    let mon_insts: Vec<Inst> = mons
        .iter()
        .map(|m| {
            m.parse::<SocketAddr>()
                .map(|addr| Inst::new(addr, 1))
                .with_context(|| format!("invalid monitor address {m}"))
        })
        .collect::<Result<_>>()?;
    let monmap = MonMap::new(fsid, mon_insts);

    let listen_addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen}"))?;

    // Event channel: everything the node reacts to flows through here
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    // Per-process nonce so restarts are distinguishable to peers
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1);

    let net_tx = tx.clone();
    let transport = TcpTransport::bind(listen_addr, nonce, move |ev| {
        let event = match ev {
            NetEvent::Inbound(env) => Event::Inbound(Box::new(env)),
            NetEvent::Failure { peer } => Event::TransportFailure { peer },
            NetEvent::Reset { addr } => Event::TransportReset { addr },
            NetEvent::RemoteReset { addr } => Event::TransportRemoteReset { addr },
        };
        let _ = net_tx.send(event);
    })
    .await
    .map_err(|e| anyhow::anyhow!("transport bind failed: {e}"))?;
    info!("Listening on {}", transport.local_inst());

    let metrics = Arc::new(NodeMetrics::new());
    let (subsys, sessions) = stock_subsystems(&config.mds);

    let deps = NodeDeps {
        cfg: config.mds,
        clock: Arc::new(SystemClock::new()),
        monmap,
        transport: transport.clone(),
        subsys,
        sessions,
        driver: Box::new(TokioTimerDriver::new(tx.clone())),
        metrics: Arc::clone(&metrics),
        want_rank,
    };
    let mut node = MdsNode::new(deps, tx.clone());

    // Metrics endpoint
    let metrics_port = args.metrics_port;
    let metrics_state = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_port, metrics_state).await {
            error!("Metrics server error: {}", e);
        }
    });
    info!(
        "Metrics available at http://0.0.0.0:{}/metrics",
        metrics_port
    );

    // Ctrl-c becomes a shutdown event, handled in arrival order like
    // everything else
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        let _ = shutdown_tx.send(Event::Shutdown);
    });

    node.init();
    node.run(rx).await;

    info!("MDS shut down");
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<NodeMetrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics.export_prometheus(),
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn start_metrics_server(port: u16, metrics: Arc<NodeMetrics>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics);

    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
