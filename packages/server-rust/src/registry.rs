//! Service registry: the control node's catalogue of peer services.
//!
//! Peers reach it through the command bus as `<control>.registerService`,
//! `<control>.getServices`, `<control>.getServicesWithManifests` and
//! `<control>.getManifests`. The mesh reconciliation loop reads the service
//! list through the same bus call, so on the control node it stays local.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use orbit_core::{ServiceManifest, ServiceRecord, ServiceRegistration};
use serde_json::Value;
use tracing::info;

use crate::bus::{handler_fn, json_result, CommandBus, ExecuteOptions};
use crate::error::RouterError;
use crate::network::reconcile::PeerDirectory;
use crate::storage::ServiceStore;

pub struct ServiceRegistry {
    store: Arc<dyn ServiceStore>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn ServiceStore>) -> Self {
        Self { store }
    }

    /// Inserts or updates the record for `registration.name`.
    ///
    /// # Errors
    ///
    /// `ValidationFailed` for a blank name; `Internal` for store failures.
    pub async fn register_service(
        &self,
        registration: ServiceRegistration,
    ) -> Result<ServiceRecord, RouterError> {
        if registration.name.trim().is_empty() {
            return Err(RouterError::ValidationFailed {
                errors: vec!["name must not be empty".to_string()],
            });
        }
        let (record, created) = self.store.upsert(registration, Utc::now()).await?;
        info!(
            service = %record.name,
            commands = record.manifest.command_list.len(),
            created,
            "service registered"
        );
        Ok(record)
    }

    /// Names of every registered service.
    ///
    /// # Errors
    ///
    /// `Internal` for store failures.
    pub async fn get_services(&self) -> Result<Vec<String>, RouterError> {
        Ok(self.store.list().await?.into_iter().map(|r| r.name).collect())
    }

    /// Full records, sorted by name.
    ///
    /// # Errors
    ///
    /// `Internal` for store failures.
    pub async fn get_services_with_manifests(&self) -> Result<Vec<ServiceRecord>, RouterError> {
        Ok(self.store.list().await?)
    }

    /// Manifests keyed by service name.
    ///
    /// # Errors
    ///
    /// `Internal` for store failures.
    pub async fn get_manifests(&self) -> Result<BTreeMap<String, ServiceManifest>, RouterError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|r| (r.name, r.manifest))
            .collect())
    }

    /// Exposes the registry as `<control>.*` commands on `bus`.
    pub fn register_commands(self: &Arc<Self>, bus: &CommandBus, control: &str) {
        let registry = Arc::clone(self);
        bus.register(
            &format!("{control}.registerService"),
            handler_fn(move |payload| {
                let registry = Arc::clone(&registry);
                async move {
                    let registration: ServiceRegistration = serde_json::from_value(payload)?;
                    json_result(&registry.register_service(registration).await?)
                }
            })
            .described("upsert a service record by name"),
        );

        let registry = Arc::clone(self);
        bus.register(
            &format!("{control}.getServices"),
            handler_fn(move |_| {
                let registry = Arc::clone(&registry);
                async move { json_result(&registry.get_services().await?) }
            })
            .described("list registered service names"),
        );

        let registry = Arc::clone(self);
        bus.register(
            &format!("{control}.getServicesWithManifests"),
            handler_fn(move |_| {
                let registry = Arc::clone(&registry);
                async move { json_result(&registry.get_services_with_manifests().await?) }
            })
            .described("list service records with manifests"),
        );

        let registry = Arc::clone(self);
        bus.register(
            &format!("{control}.getManifests"),
            handler_fn(move |_| {
                let registry = Arc::clone(&registry);
                async move { json_result(&registry.get_manifests().await?) }
            })
            .described("manifests keyed by service name"),
        );
    }
}

#[async_trait]
impl PeerDirectory for ServiceRegistry {
    async fn list_services(&self) -> Result<Vec<String>, RouterError> {
        self.get_services().await
    }
}

/// Reads the service list through `<control>.getServices` on the bus.
pub struct BusDirectory {
    bus: Arc<CommandBus>,
    control: String,
}

impl BusDirectory {
    #[must_use]
    pub fn new(bus: Arc<CommandBus>, control: impl Into<String>) -> Self {
        Self {
            bus,
            control: control.into(),
        }
    }
}

#[async_trait]
impl PeerDirectory for BusDirectory {
    async fn list_services(&self) -> Result<Vec<String>, RouterError> {
        let command = format!("{}.getServices", self.control);
        let value = self
            .bus
            .execute(&command, Value::Null, ExecuteOptions::default())
            .await?;
        serde_json::from_value(value)
            .map_err(|e| RouterError::Internal(anyhow::Error::new(e).context("decoding service list")))
    }
}

/// Publishes this node's manifest to the control node.
///
/// # Errors
///
/// Whatever the bus returns for `<control>.registerService`.
pub async fn publish_manifest(bus: &CommandBus, control: &str) -> Result<(), RouterError> {
    let registration = ServiceRegistration {
        name: bus.service_name().to_string(),
        manifest: ServiceManifest::clone(&bus.manifest()),
    };
    let payload = json_result(&registration)?;
    bus.execute(&format!("{control}.registerService"), payload, ExecuteOptions::default())
        .await?;
    info!(control = %control, "manifest published");
    Ok(())
}
