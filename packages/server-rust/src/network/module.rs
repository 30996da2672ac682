//! Network module with deferred startup lifecycle.
//!
//! `new()` records configuration, `start()` binds the TCP listener, and
//! `serve()` accepts connections. Binding early lets the node learn its real
//! port (port 0 in tests) before the bus, mesh, and registry are wired.

use std::future::Future;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    delete_failed_handler, execute_batch_handler, health_handler, list_tasks_handler, mesh_upgrade_handler,
    migrations_handler, reset_handler, schedule_handler, seeders_handler, AppState,
};
use super::middleware::build_http_layers;

/// Upper bound on waiting for in-flight requests after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the HTTP listener shared by operator endpoints and the mesh socket.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self { config, listener: None }
    }

    /// Assembles the router.
    ///
    /// Every node serves:
    /// - `GET /health` -- health state, uptime, mesh peers
    /// - `GET /mesh` -- inbound peer WebSocket
    ///
    /// The control node additionally serves the operator surface:
    /// - `GET /control/health`
    /// - `POST /control/migrations`, `/control/seeders`, `/control/reset`
    /// - `POST /tasks/schedule`, `GET /tasks/`
    /// - `POST /tasks/execute-batch`, `/tasks/delete-failed`
    pub fn router(&self, state: AppState, control: bool) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/mesh", get(mesh_upgrade_handler));

        if control {
            router = router
                .route("/control/health", get(health_handler))
                .route("/control/migrations", post(migrations_handler))
                .route("/control/seeders", post(seeders_handler))
                .route("/control/reset", post(reset_handler))
                .route("/tasks/schedule", post(schedule_handler))
                .route("/tasks", get(list_tasks_handler))
                .route("/tasks/", get(list_tasks_handler))
                .route("/tasks/execute-batch", post(execute_batch_handler))
                .route("/tasks/delete-failed", post(delete_failed_handler));
        }

        router.layer(build_http_layers(&self.config)).with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which differs from the configured one
    /// when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// Draining moves health to `draining`, closes every peer socket, and
    /// waits up to 30 seconds for in-flight operator requests before
    /// moving health to `stopped`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server hits a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        mut self,
        state: AppState,
        control: bool,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .expect("start() must be called before serve()");
        let router = self.router(state.clone(), control);

        let controller = state.shutdown.clone();
        let signal = async move {
            shutdown.await;
            controller.trigger_shutdown();
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        drain(&state).await;
        Ok(())
    }
}

async fn drain(state: &AppState) {
    state.shutdown.trigger_shutdown();

    let peers = state.mesh.connected_peers();
    if !peers.is_empty() {
        info!(peers = peers.len(), "closing mesh connections");
    }
    state.mesh.close_all();

    if state.shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("drained");
    } else {
        warn!(
            in_flight = state.shutdown.in_flight_count(),
            "drain timeout expired with requests in flight"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::{handler_fn, HandlerTable};
    use crate::network::config::MeshConfig;
    use crate::network::handlers::tests::test_state;
    use crate::network::mesh::PeerMesh;

    fn local() -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".into(),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(NetworkConfig::default());
        assert!(module.listener.is_none());
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(local());
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "start() must be called before serve()")]
    async fn serve_panics_without_start() {
        let module = NetworkModule::new(NetworkConfig::default());
        let _ = module.serve(test_state(), true, std::future::pending::<()>()).await;
    }

    #[tokio::test]
    async fn operator_routes_only_on_control() {
        let module = NetworkModule::new(local());
        let request = || Request::get("/tasks/").body(Body::empty()).unwrap();

        let worker = module.router(test_state(), false);
        let res = worker.oneshot(request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let health = module
            .router(test_state(), false)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        // No scheduler registered, so the command is missing rather than the route.
        let control = module.router(test_state(), true);
        let res = control.oneshot(request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().unwrap().contains("control.getTasks"));
    }

    #[tokio::test]
    async fn mesh_upgrade_requires_service_name() {
        let module = NetworkModule::new(local());
        let state = test_state();
        state.shutdown.set_ready();
        let res = module
            .router(state, true)
            .oneshot(
                Request::get("/mesh")
                    .header("connection", "upgrade")
                    .header("upgrade", "websocket")
                    .header("sec-websocket-version", "13")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn peer_dials_over_real_socket_and_shutdown_drains() {
        let state = test_state();
        state
            .bus
            .register("control.ping", handler_fn(|p| async move { Ok(json!({ "pong": p })) }));
        state.shutdown.set_ready();

        let mut module = NetworkModule::new(local());
        let port = module.start().await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server_state = state.clone();
        let server = tokio::spawn(module.serve(server_state, true, async {
            let _ = stop_rx.await;
        }));

        let mut mesh_config = MeshConfig::default();
        mesh_config
            .peer_overrides
            .insert("control".into(), format!("ws://127.0.0.1:{port}/mesh"));
        let orders = PeerMesh::new("orders", mesh_config, Arc::new(HandlerTable::new()));

        orders.dial("control").await.unwrap();
        let out = orders
            .send("control", "control.ping", json!(7), None)
            .await
            .unwrap();
        assert_eq!(out, json!({ "pong": 7 }));

        // The inbound side registers the dialer under its announced name.
        for _ in 0..50 {
            if state.mesh.is_connected("orders") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.mesh.is_connected("orders"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(
            state.shutdown.health_state(),
            crate::network::shutdown::HealthState::Stopped
        );
        assert!(state.mesh.connected_peers().is_empty());
    }
}
