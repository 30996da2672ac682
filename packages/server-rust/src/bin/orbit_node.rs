//! `orbit-node`: runs one Orbit node.
//!
//! Every flag can also be set through its `ORBIT_*` environment variable.
//! Exit code 1 means the node could not start (control node unreachable,
//! broker down, port in use) or stopped on a fatal server error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use orbit_server::network::{MeshConfig, NetworkConfig};
use orbit_server::{BrokerConfig, DeploymentMode, Environment, Node, NodeConfig, SchedulerConfig, StorageConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Orbit node: command bus, peer mesh, and (on the control node) the
/// service registry and task scheduler.
#[derive(Debug, Parser)]
#[command(name = "orbit-node", version, about)]
struct Cli {
    /// This node's service name.
    #[arg(long, env = "ORBIT_SERVICE_NAME", default_value = "control")]
    service_name: String,

    #[arg(long, env = "ORBIT_MODE", value_enum, default_value = "distributed")]
    mode: DeploymentMode,

    /// Service name of the control node.
    #[arg(long, env = "ORBIT_CONTROL_SERVICE", default_value = "control")]
    control_service: String,

    #[arg(long, env = "ORBIT_ENVIRONMENT", value_enum, default_value = "development")]
    environment: Environment,

    #[arg(long, env = "ORBIT_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "ORBIT_PORT", default_value_t = 3000)]
    port: u16,

    /// Allowed CORS origins, comma separated.
    #[arg(long, env = "ORBIT_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// Host pattern for peers; `{service}` is replaced by the peer's name.
    #[arg(long, env = "ORBIT_PEER_HOST_TEMPLATE", default_value = "{service}")]
    peer_host_template: String,

    /// Port every peer's mesh endpoint listens on.
    #[arg(long, env = "ORBIT_PEER_PORT", default_value_t = 3000)]
    peer_port: u16,

    /// Explicit peer URLs as `service=ws://host:port/mesh`, comma separated.
    #[arg(long, env = "ORBIT_PEERS", value_delimiter = ',', value_parser = parse_peer)]
    peer: Vec<(String, String)>,

    #[arg(long, env = "ORBIT_RECONCILE_INTERVAL_MS", default_value_t = 5_000)]
    reconcile_interval_ms: u64,

    #[arg(long, env = "ORBIT_BOOTSTRAP_ATTEMPTS", default_value_t = 10)]
    bootstrap_attempts: u32,

    #[arg(long, env = "ORBIT_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    request_timeout_ms: u64,

    /// NATS server URLs, comma separated. Omit to disable the broker.
    #[arg(long, env = "ORBIT_NATS_URLS", value_delimiter = ',')]
    nats_urls: Vec<String>,

    #[arg(long, env = "ORBIT_NATS_JETSTREAM")]
    nats_jetstream: bool,

    /// Task handlers in flight per batch.
    #[arg(long, env = "ORBIT_SCHEDULER_WORKERS", default_value_t = 8)]
    scheduler_workers: usize,

    /// Run a scheduled-task batch every N milliseconds.
    #[arg(long, env = "ORBIT_BATCH_INTERVAL_MS")]
    batch_interval_ms: Option<u64>,

    /// Persist the registry and tasks in this redb file instead of memory.
    #[arg(long, env = "ORBIT_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "ORBIT_METRICS_PORT")]
    metrics_port: Option<u16>,

    #[arg(long, env = "ORBIT_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn parse_peer(raw: &str) -> Result<(String, String), String> {
    let (service, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected service=url, got {raw:?}"))?;
    if service.trim().is_empty() || url.trim().is_empty() {
        return Err(format!("expected service=url, got {raw:?}"));
    }
    Ok((service.trim().to_string(), url.trim().to_string()))
}

impl Cli {
    fn into_config(self) -> NodeConfig {
        let request_timeout = Duration::from_millis(self.request_timeout_ms);
        NodeConfig {
            service_name: self.service_name,
            mode: self.mode,
            control_service: self.control_service,
            environment: self.environment,
            http: NetworkConfig {
                host: self.host,
                port: self.port,
                cors_origins: self.cors_origins,
                ..NetworkConfig::default()
            },
            mesh: MeshConfig {
                host_template: self.peer_host_template,
                peer_port: self.peer_port,
                peer_overrides: self.peer.into_iter().collect::<HashMap<_, _>>(),
                reconcile_interval: Duration::from_millis(self.reconcile_interval_ms),
                bootstrap_attempts: self.bootstrap_attempts,
                request_timeout,
                ..MeshConfig::default()
            },
            broker: BrokerConfig {
                urls: self.nats_urls,
                request_timeout,
                jetstream: self.nats_jetstream,
                ..BrokerConfig::default()
            },
            scheduler: SchedulerConfig {
                workers: self.scheduler_workers,
                batch_interval: self.batch_interval_ms.map(Duration::from_millis),
            },
            storage: match self.db_path {
                Some(path) => StorageConfig::Redb { path },
                None => StorageConfig::Memory,
            },
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Some(port) = cli.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
            error!(error = %e, "failed to install metrics exporter");
            return ExitCode::FAILURE;
        }
        info!(%addr, "metrics exporter listening");
    }

    let config = cli.into_config();
    info!(service = %config.service_name, version = env!("CARGO_PKG_VERSION"), "starting orbit node");

    let node = match Node::build(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %format!("{e:#}"), "node failed to build");
            return ExitCode::FAILURE;
        }
    };

    match node.run(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "node stopped with error");
            ExitCode::FAILURE
        }
    }
}
