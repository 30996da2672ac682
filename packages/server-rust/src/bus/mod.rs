//! Command bus: the dispatch core.
//!
//! `execute` decides per call whether a command runs in-process, is
//! published through the broker, or makes a synchronous round trip over a
//! request/response transport:
//!
//! 1. **Monolith** mode: every name is looked up locally, as given.
//! 2. Otherwise the name is split on its first `.`; a bare name is prefixed
//!    with this node's service name.
//! 3. A command owned by this node runs locally.
//! 4. Anything else is remote: fire-and-forget calls are published, all
//!    others go through the transport chosen by [`ExecuteOptions::via`].
//!
//! The decision is a pure function of (mode, own service, target service,
//! options); see [`route`].

pub mod handler;
pub mod manifest;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use orbit_core::{CommandName, ServiceManifest};
use serde_json::Value;
use tracing::{debug, warn};

pub use handler::{handler_fn, json_result, CommandHandler, FnHandler, HandlerResult, HandlerTable};
pub use manifest::CommandManifest;
pub use transport::{FireAndForget, RequestResponseTransport, TransportKind};

use crate::config::DeploymentMode;
use crate::error::RouterError;

// ---------------------------------------------------------------------------
// ExecuteOptions / Route
// ---------------------------------------------------------------------------

/// Per-call options for [`CommandBus::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Publish without waiting for a result. Only affects remote calls.
    pub fire_and_forget: bool,
    /// Strategy for synchronous remote calls.
    pub transport: TransportKind,
    /// Overrides the transport's default timeout.
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    #[must_use]
    pub fn fire_and_forget() -> Self {
        Self {
            fire_and_forget: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn via(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where a single `execute` call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local {
        command: String,
    },
    Publish {
        service: String,
        command: String,
    },
    Request {
        service: String,
        command: String,
        transport: TransportKind,
    },
}

impl Route {
    /// Short label used for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Publish { .. } => "publish",
            Self::Request {
                transport: TransportKind::Mesh,
                ..
            } => "mesh",
            Self::Request {
                transport: TransportKind::Broker,
                ..
            } => "broker",
        }
    }
}

/// Decides where `name` is executed.
#[must_use]
pub fn route(
    mode: DeploymentMode,
    own_service: &str,
    name: &str,
    opts: &ExecuteOptions,
) -> Route {
    if mode == DeploymentMode::Monolith {
        return Route::Local {
            command: name.to_string(),
        };
    }

    let target = CommandName::qualify(name, own_service);
    if target.is_owned_by(own_service) {
        return Route::Local {
            command: target.to_string(),
        };
    }

    let command = target.to_string();
    if opts.fire_and_forget {
        Route::Publish {
            service: target.service,
            command,
        }
    } else {
        Route::Request {
            service: target.service,
            command,
            transport: opts.transport,
        }
    }
}

// ---------------------------------------------------------------------------
// CommandBus
// ---------------------------------------------------------------------------

/// Owns this process's handler table and manifest, plus the transports used
/// for cross-service calls.
pub struct CommandBus {
    service_name: String,
    mode: DeploymentMode,
    handlers: Arc<HandlerTable>,
    manifest: Arc<CommandManifest>,
    transports: HashMap<TransportKind, Arc<dyn RequestResponseTransport>>,
    publisher: Option<Arc<dyn FireAndForget>>,
}

impl CommandBus {
    #[must_use]
    pub fn new(service_name: impl Into<String>, mode: DeploymentMode) -> Self {
        Self {
            service_name: service_name.into(),
            mode,
            handlers: Arc::new(HandlerTable::new()),
            manifest: Arc::new(CommandManifest::new()),
            transports: HashMap::new(),
            publisher: None,
        }
    }

    /// Adds a request/response strategy, replacing any of the same kind.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn RequestResponseTransport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn FireAndForget>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Shared handler table, handed to transports that serve inbound calls.
    #[must_use]
    pub fn handlers(&self) -> Arc<HandlerTable> {
        Arc::clone(&self.handlers)
    }

    #[must_use]
    pub fn manifest(&self) -> Arc<ServiceManifest> {
        self.manifest.snapshot()
    }

    /// Registers `handler` under `name` and records it in the manifest.
    ///
    /// A bare name is qualified with this node's service name. Registering
    /// a name twice replaces the earlier handler and logs a warning.
    pub fn register<H: CommandHandler>(&self, name: &str, handler: H) {
        let full_name = if self.mode == DeploymentMode::Monolith {
            name.to_string()
        } else {
            CommandName::qualify(name, &self.service_name).to_string()
        };
        let description = handler.describe();
        if self.handlers.insert(full_name.clone(), Arc::new(handler)).is_some() {
            warn!(command = %full_name, "command re-registered, replacing previous handler");
        }
        self.manifest.record_command(&full_name, &description);
        debug!(command = %full_name, "command registered");
    }

    /// Publishes a compiled schema in the manifest.
    pub fn register_schema(&self, name: &str, schema: &Value) {
        self.manifest.record_schema(name, schema);
    }

    #[must_use]
    pub fn route(&self, name: &str, opts: &ExecuteOptions) -> Route {
        route(self.mode, &self.service_name, name, opts)
    }

    /// Executes `name` wherever it lives.
    ///
    /// Fire-and-forget remote calls resolve to `null` once published.
    ///
    /// # Errors
    ///
    /// - `CommandNotRegistered` for a local name with no handler
    /// - `TransportUnavailable` when no transport of the requested kind is
    ///   configured, or the peer is not connected
    /// - `Broker` when fire-and-forget is requested without a broker
    /// - any transport error, or the handler's own error, unchanged
    pub async fn execute(&self, name: &str, payload: Value, opts: ExecuteOptions) -> HandlerResult {
        let route = self.route(name, &opts);
        metrics::counter!("orbit_commands_total", "route" => route.label()).increment(1);

        match route {
            Route::Local { command } => self.handlers.dispatch(&command, payload).await,
            Route::Publish { service, command } => {
                let publisher = self
                    .publisher
                    .as_ref()
                    .ok_or_else(|| RouterError::Broker("no broker configured".to_string()))?;
                publisher.publish(&service, &command, payload).await?;
                Ok(Value::Null)
            }
            Route::Request {
                service,
                command,
                transport,
            } => {
                let Some(transport) = self.transports.get(&transport) else {
                    return Err(RouterError::TransportUnavailable { peer: service });
                };
                transport
                    .request(&service, &command, payload, opts.timeout)
                    .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
