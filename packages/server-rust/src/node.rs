//! Node assembly and lifecycle.
//!
//! A [`Node`] wires one process together: the command bus with its mesh and
//! (optionally) broker transports, the HTTP listener, and, on the control
//! node, the service registry and task scheduler. Application handlers are
//! registered on [`Node::bus`] between [`Node::build`] and [`Node::run`].
//!
//! Startup order in [`Node::run`]:
//! 1. bind and serve HTTP (health reports `starting`)
//! 2. bootstrap the mesh connection to the control node (fatal on failure)
//! 3. publish this node's manifest to the registry and join the broker queue
//! 4. mark the node ready and start background workers

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{BrokerConnection, BrokerConsumer, BrokerTransport, NatsBroker};
use crate::bus::CommandBus;
use crate::config::{DeploymentMode, NodeConfig};
use crate::network::{bootstrap, AppState, NetworkModule, PeerMesh, ReconcileRunnable, ShutdownController};
use crate::registry::{publish_manifest, BusDirectory, ServiceRegistry};
use crate::scheduler::{SchedulerRunnable, TaskScheduler};
use crate::storage::Stores;
use crate::worker::BackgroundWorker;

pub struct Node {
    config: Arc<NodeConfig>,
    bus: Arc<CommandBus>,
    mesh: PeerMesh,
    shutdown: Arc<ShutdownController>,
    broker: Option<Arc<dyn BrokerConnection>>,
    registry: Option<Arc<ServiceRegistry>>,
    scheduler: Option<Arc<TaskScheduler>>,
    network: NetworkModule,
    port: Option<u16>,
}

impl Node {
    /// Builds a node, connecting to NATS when a broker is configured.
    ///
    /// # Errors
    ///
    /// Fails if the broker is unreachable or the stores cannot be opened.
    pub async fn build(config: NodeConfig) -> anyhow::Result<Self> {
        let broker = if config.broker.is_enabled() && config.mode == DeploymentMode::Distributed {
            let nats = NatsBroker::connect(&config.broker, &config.service_name)
                .await
                .context("connecting to broker")?;
            Some(Arc::new(nats) as Arc<dyn BrokerConnection>)
        } else {
            None
        };
        Self::with_broker(config, broker)
    }

    /// Builds a node on an already-connected broker (or none).
    ///
    /// # Errors
    ///
    /// Fails if the control node's stores cannot be opened.
    pub fn with_broker(config: NodeConfig, broker: Option<Arc<dyn BrokerConnection>>) -> anyhow::Result<Self> {
        let control = config.control_service.clone();
        let is_control = config.is_control();

        let bus = CommandBus::new(&config.service_name, config.mode);
        let mesh = PeerMesh::new(&config.service_name, config.mesh.clone(), bus.handlers());
        let mut bus = bus.with_transport(Arc::new(mesh.clone()));
        if let Some(conn) = &broker {
            let transport = Arc::new(BrokerTransport::new(
                &config.service_name,
                Arc::clone(conn),
                config.broker.request_timeout,
            ));
            bus = bus.with_transport(transport.clone()).with_publisher(transport);
        }
        let bus = Arc::new(bus);

        let (registry, scheduler) = if is_control {
            let stores = Stores::open(&config.storage).context("opening control stores")?;
            let registry = Arc::new(ServiceRegistry::new(stores.services));
            registry.register_commands(&bus, &control);
            let scheduler = Arc::new(TaskScheduler::new(
                stores.tasks,
                Arc::clone(&bus),
                config.scheduler.clone(),
            ));
            scheduler.register_commands(&bus, &control);
            (Some(registry), Some(scheduler))
        } else {
            (None, None)
        };

        info!(
            service = %config.service_name,
            mode = ?config.mode,
            control = is_control,
            broker = broker.is_some(),
            "node assembled"
        );

        Ok(Self {
            network: NetworkModule::new(config.http.clone()),
            config: Arc::new(config),
            bus,
            mesh,
            shutdown: Arc::new(ShutdownController::new()),
            broker,
            registry,
            scheduler,
            port: None,
        })
    }

    /// The bus to register application handlers on.
    #[must_use]
    pub fn bus(&self) -> Arc<CommandBus> {
        Arc::clone(&self.bus)
    }

    #[must_use]
    pub fn mesh(&self) -> PeerMesh {
        self.mesh.clone()
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Present only on the control node.
    #[must_use]
    pub fn registry(&self) -> Option<Arc<ServiceRegistry>> {
        self.registry.clone()
    }

    /// Present only on the control node.
    #[must_use]
    pub fn scheduler(&self) -> Option<Arc<TaskScheduler>> {
        self.scheduler.clone()
    }

    /// Binds the HTTP listener early, returning the bound port. Called by
    /// [`run`](Self::run) if not called before.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn bind(&mut self) -> anyhow::Result<u16> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        let port = self.network.start().await?;
        self.port = Some(port);
        Ok(port)
    }

    /// Runs the node until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// - the control node cannot be reached within the bootstrap attempts
    /// - the manifest cannot be published
    /// - the broker queue cannot be joined
    /// - the HTTP server fails
    pub async fn run(mut self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        self.bind().await?;
        let config = Arc::clone(&self.config);
        let control = config.control_service.as_str();
        let distributed = config.mode == DeploymentMode::Distributed;

        let state = AppState {
            bus: Arc::clone(&self.bus),
            mesh: self.mesh.clone(),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::clone(&config),
            start_time: Instant::now(),
        };
        let network = std::mem::replace(&mut self.network, NetworkModule::new(config.http.clone()));
        let server = tokio::spawn(network.serve(state, config.is_control(), shutdown));

        let consumer = match self.startup(distributed, control).await {
            Ok(consumer) => consumer,
            Err(e) => {
                server.abort();
                return Err(e);
            }
        };
        self.shutdown.set_ready();
        info!(service = %config.service_name, port = self.port, "node ready");

        let mut reconcile = distributed.then(|| {
            BackgroundWorker::start(
                ReconcileRunnable::new(BusDirectory::new(Arc::clone(&self.bus), control), self.mesh.clone()),
                config.mesh.reconcile_interval,
            )
        });
        let mut batches = match (&self.scheduler, config.scheduler.batch_interval) {
            (Some(scheduler), Some(interval)) => Some(BackgroundWorker::start(
                SchedulerRunnable::new(Arc::clone(scheduler)),
                interval,
            )),
            _ => None,
        };

        let served = server.await;

        if let Some(worker) = reconcile.as_mut() {
            worker.stop().await;
        }
        if let Some(worker) = batches.as_mut() {
            worker.stop().await;
        }
        if let Some(consumer) = consumer {
            consumer.abort();
        }
        info!(service = %config.service_name, "node stopped");

        served.context("HTTP server task panicked")?
    }

    /// Bootstraps the mesh, publishes the manifest, and joins the broker
    /// queue. Returns the consumer task, if any.
    async fn startup(&self, distributed: bool, control: &str) -> anyhow::Result<Option<JoinHandle<()>>> {
        if distributed {
            bootstrap(
                &self.mesh,
                control,
                self.config.mesh.bootstrap_attempts,
                self.config.mesh.bootstrap_backoff,
            )
            .await
            .with_context(|| format!("control node {control} unreachable"))?;
        }
        publish_manifest(&self.bus, control)
            .await
            .context("publishing manifest")?;
        self.start_consumer().await
    }

    async fn start_consumer(&self) -> anyhow::Result<Option<JoinHandle<()>>> {
        let Some(conn) = &self.broker else {
            return Ok(None);
        };
        let consumer = BrokerConsumer::new(&self.config.service_name, Arc::clone(conn), self.bus.handlers());
        match consumer.start().await {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                warn!(error = %e, "broker consumer failed to start");
                Err(e).context("joining broker queue")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::oneshot;

    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::bus::{handler_fn, ExecuteOptions, TransportKind};
    use crate::network::config::{MeshConfig, NetworkConfig};

    fn node_config(name: &str) -> NodeConfig {
        NodeConfig {
            service_name: name.into(),
            mode: DeploymentMode::Distributed,
            http: NetworkConfig {
                host: "127.0.0.1".into(),
                ..NetworkConfig::default()
            },
            mesh: MeshConfig {
                reconcile_interval: Duration::from_millis(50),
                bootstrap_attempts: 3,
                bootstrap_backoff: Duration::from_millis(20),
                ..MeshConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn bootstrap_failure_is_fatal() {
        let mut config = node_config("orders");
        config
            .mesh
            .peer_overrides
            .insert("control".into(), "ws://127.0.0.1:1/mesh".into());
        let node = Node::with_broker(config, None).unwrap();
        assert!(node.registry().is_none());

        let err = node.run(std::future::pending()).await.unwrap_err();
        assert!(format!("{err:#}").contains("control node control unreachable"));
    }

    #[tokio::test]
    async fn two_nodes_register_route_and_run_tasks() {
        let broker: Arc<dyn BrokerConnection> = Arc::new(InMemoryBroker::new());

        let mut control = Node::with_broker(node_config("control"), Some(Arc::clone(&broker))).unwrap();
        let control_port = control.bind().await.unwrap();
        let control_bus = control.bus();
        let registry = control.registry().unwrap();
        let control_health = control.shutdown_controller();

        let mut orders_config = node_config("orders");
        orders_config
            .mesh
            .peer_overrides
            .insert("control".into(), format!("ws://127.0.0.1:{control_port}/mesh"));
        let mut orders = Node::with_broker(orders_config, Some(broker)).unwrap();
        orders.bind().await.unwrap();
        orders.bus().register(
            "orders.create",
            handler_fn(|p: Value| async move { Ok(json!({ "created": p["sku"] })) }).described("Create an order"),
        );
        let orders_health = orders.shutdown_controller();

        let (stop_control, control_rx) = oneshot::channel::<()>();
        let (stop_orders, orders_rx) = oneshot::channel::<()>();
        let control_task = tokio::spawn(control.run(async {
            let _ = control_rx.await;
        }));
        let orders_task = tokio::spawn(orders.run(async {
            let _ = orders_rx.await;
        }));

        wait_for(|| orders_health.health_state() == crate::network::HealthState::Ready).await;
        let services = registry.get_services().await.unwrap();
        assert!(services.contains(&"orders".to_string()));
        let manifests = registry.get_manifests().await.unwrap();
        assert!(manifests["orders"].exposes("orders.create"));

        // Mesh: control reaches orders over the socket orders dialed.
        let out = control_bus
            .execute("orders.create", json!({ "sku": "A-1" }), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(out, json!({ "created": "A-1" }));

        // Broker: same command over the queue.
        let out = control_bus
            .execute(
                "orders.create",
                json!({ "sku": "B-2" }),
                ExecuteOptions::default().via(TransportKind::Broker),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({ "created": "B-2" }));

        // Scheduler dispatches a due task to the remote handler.
        control_bus
            .execute(
                "control.scheduleTask",
                json!({
                    "name": "nightly",
                    "payload": { "sku": "C-3" },
                    "scheduled": (chrono::Utc::now() - chrono::Duration::seconds(1)).to_rfc3339(),
                    "handlerServiceName": "orders",
                    "handlerName": "create",
                }),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        let report = control_bus
            .execute("control.executeBatch", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(report["completed"], 1);

        stop_orders.send(()).unwrap();
        orders_task.await.unwrap().unwrap();
        stop_control.send(()).unwrap();
        control_task.await.unwrap().unwrap();
        assert_eq!(control_health.health_state(), crate::network::HealthState::Stopped);
    }
}
