//! Network configuration types for the HTTP listener and the peer mesh.

use std::collections::HashMap;
use std::time::Duration;

/// HTTP listener configuration. The mesh endpoint shares this listener.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-connection configuration controlling backpressure.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound frames per peer.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when a peer's outbound channel is full.
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff applied to a peer after a failed dial.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Each delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Peer mesh configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Host pattern for dialing a peer; `{service}` is replaced by its name.
    pub host_template: String,
    /// Port every peer's mesh endpoint listens on.
    pub peer_port: u16,
    /// Explicit `ws://` URLs by service name, bypassing the host template.
    pub peer_overrides: HashMap<String, String>,
    pub reconcile_interval: Duration,
    /// Dial attempts against the control node before giving up at startup.
    pub bootstrap_attempts: u32,
    /// Fixed delay between bootstrap attempts.
    pub bootstrap_backoff: Duration,
    /// Default RPC window.
    pub request_timeout: Duration,
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
}

impl MeshConfig {
    /// WebSocket URL of `service`'s mesh endpoint.
    #[must_use]
    pub fn peer_url(&self, service: &str) -> String {
        if let Some(url) = self.peer_overrides.get(service) {
            return url.clone();
        }
        let host = self.host_template.replace("{service}", service);
        format!("ws://{host}:{}/mesh", self.peer_port)
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            host_template: "{service}".to_string(),
            peer_port: 3000,
            peer_overrides: HashMap::new(),
            reconcile_interval: Duration::from_secs(5),
            bootstrap_attempts: 10,
            bootstrap_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn mesh_config_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.reconcile_interval, Duration::from_secs(5));
        assert_eq!(config.bootstrap_attempts, 10);
        assert_eq!(config.bootstrap_backoff, Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.connection.outbound_channel_capacity, 256);
    }

    #[test]
    fn peer_url_follows_host_convention() {
        let config = MeshConfig::default();
        assert_eq!(config.peer_url("orders"), "ws://orders:3000/mesh");

        let config = MeshConfig {
            host_template: "{service}.svc.local".into(),
            peer_port: 8080,
            ..MeshConfig::default()
        };
        assert_eq!(config.peer_url("billing"), "ws://billing.svc.local:8080/mesh");
    }

    #[test]
    fn peer_overrides_win() {
        let mut config = MeshConfig::default();
        config
            .peer_overrides
            .insert("orders".into(), "ws://127.0.0.1:4100/mesh".into());
        assert_eq!(config.peer_url("orders"), "ws://127.0.0.1:4100/mesh");
        assert_eq!(config.peer_url("billing"), "ws://billing:3000/mesh");
    }
}
