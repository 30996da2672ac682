//! Mesh reconciliation and bootstrap.
//!
//! Reconciliation compares the registry's service list with open peer
//! sockets and dials whatever is missing. Failures are logged and left for
//! the next pass. Bootstrap is the strict variant used once at startup: a
//! bounded number of dials to the control node, after which the node gives
//! up.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::mesh::PeerMesh;
use crate::error::RouterError;
use crate::worker::BackgroundRunnable;

/// Source of the desired peer set.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn list_services(&self) -> Result<Vec<String>, RouterError>;
}

#[async_trait]
impl<T: PeerDirectory + ?Sized> PeerDirectory for std::sync::Arc<T> {
    async fn list_services(&self) -> Result<Vec<String>, RouterError> {
        (**self).list_services().await
    }
}

/// Side that opens peer connections.
#[async_trait]
pub trait PeerDialer: Send + Sync {
    fn own_name(&self) -> &str;

    /// Returns `true` and claims the dial if `peer` is neither connected,
    /// already being dialed, nor backing off.
    fn should_dial(&self, peer: &str) -> bool;

    async fn dial(&self, peer: &str) -> Result<(), RouterError>;
}

#[async_trait]
impl PeerDialer for PeerMesh {
    fn own_name(&self) -> &str {
        self.service_name()
    }

    fn should_dial(&self, peer: &str) -> bool {
        !self.is_connected(peer) && self.reconnect().try_begin(peer, tokio::time::Instant::now())
    }

    async fn dial(&self, peer: &str) -> Result<(), RouterError> {
        PeerMesh::dial(self, peer).await.map(|_| ())
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub listed: usize,
    pub dialed: usize,
    pub failed: usize,
}

/// Dials every listed peer that needs a connection. Never fails.
pub async fn reconcile_once(directory: &dyn PeerDirectory, dialer: &dyn PeerDialer) -> ReconcileReport {
    let services = match directory.list_services().await {
        Ok(services) => services,
        Err(e) => {
            warn!(error = %e, "could not list services for mesh reconciliation");
            return ReconcileReport::default();
        }
    };

    let own = dialer.own_name();
    let targets: Vec<&String> = services
        .iter()
        .filter(|service| service.as_str() != own)
        .filter(|service| dialer.should_dial(service))
        .collect();

    let results = join_all(targets.iter().map(|peer| async move {
        let result = dialer.dial(peer).await;
        if let Err(e) = &result {
            warn!(peer = %peer, error = %e, "mesh dial failed, will retry");
        }
        result.is_ok()
    }))
    .await;

    let report = ReconcileReport {
        listed: services.len(),
        dialed: targets.len(),
        failed: results.iter().filter(|ok| !**ok).count(),
    };
    debug!(?report, "mesh reconciliation pass");
    report
}

/// Connects to the control node, retrying with a fixed backoff.
///
/// A node that is itself the control node returns immediately.
///
/// # Errors
///
/// `TransportUnavailable` once `attempts` dials have failed.
pub async fn bootstrap(
    dialer: &dyn PeerDialer,
    control: &str,
    attempts: u32,
    backoff: Duration,
) -> Result<(), RouterError> {
    if dialer.own_name() == control {
        return Ok(());
    }
    for attempt in 1..=attempts {
        match dialer.dial(control).await {
            Ok(()) => {
                info!(control = %control, attempt, "connected to control node");
                return Ok(());
            }
            Err(e) => {
                warn!(control = %control, attempt, attempts, error = %e, "control node not reachable");
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(RouterError::TransportUnavailable {
        peer: control.to_string(),
    })
}

/// On-demand reconciliation request.
#[derive(Debug)]
pub struct ReconcileNow;

/// Drives [`reconcile_once`] from a [`BackgroundWorker`](crate::worker::BackgroundWorker).
pub struct ReconcileRunnable<D, P> {
    directory: D,
    dialer: P,
}

impl<D, P> ReconcileRunnable<D, P> {
    pub fn new(directory: D, dialer: P) -> Self {
        Self { directory, dialer }
    }
}

#[async_trait]
impl<D, P> BackgroundRunnable for ReconcileRunnable<D, P>
where
    D: PeerDirectory + 'static,
    P: PeerDialer + 'static,
{
    type Job = ReconcileNow;

    fn name(&self) -> &'static str {
        "mesh-reconcile"
    }

    async fn run(&mut self, _job: ReconcileNow) {
        reconcile_once(&self.directory, &self.dialer).await;
    }

    async fn on_tick(&mut self) {
        reconcile_once(&self.directory, &self.dialer).await;
    }
}
