//! Node-level configuration.
//!
//! Every struct has a `Default` suitable for a single local process; the
//! `orbit-node` binary overrides fields from command-line flags and
//! `ORBIT_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::network::config::{MeshConfig, NetworkConfig};

/// How the services of a deployment are packaged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DeploymentMode {
    /// Every service runs in one process; all commands dispatch locally.
    Monolith,
    /// One process per service; cross-service commands travel over a transport.
    #[default]
    Distributed,
}

/// Runtime environment. Gates destructive operator endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// Top-level configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's service name. Also its mesh identity.
    pub service_name: String,
    pub mode: DeploymentMode,
    /// Name of the node that owns the service registry and task scheduler.
    pub control_service: String,
    pub environment: Environment,
    pub http: NetworkConfig,
    pub mesh: MeshConfig,
    pub broker: BrokerConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
}

impl NodeConfig {
    /// Returns `true` if this node hosts the registry and scheduler.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.mode == DeploymentMode::Monolith || self.service_name == self.control_service
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            service_name: "control".to_string(),
            mode: DeploymentMode::default(),
            control_service: "control".to_string(),
            environment: Environment::default(),
            http: NetworkConfig::default(),
            mesh: MeshConfig::default(),
            broker: BrokerConfig::default(),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Message broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Server URLs. Empty disables the broker transport.
    pub urls: Vec<String>,
    /// Connection name reported to the broker. Defaults to the service name.
    pub client_name: Option<String>,
    /// Default request/reply window.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Assert a JetStream stream over each service queue.
    pub jetstream: bool,
}

impl BrokerConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.urls.is_empty()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            client_name: None,
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            jetstream: false,
        }
    }
}

/// Task scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of task handlers in flight during one batch.
    pub workers: usize,
    /// Run a `scheduled` batch on this interval. `None` leaves batching to
    /// an external driver.
    pub batch_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_interval: None,
        }
    }
}

/// Backing store for the service catalogue and task table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageConfig {
    #[default]
    Memory,
    /// Single-file embedded database.
    Redb { path: PathBuf },
}
