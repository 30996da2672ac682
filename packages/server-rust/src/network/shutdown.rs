//! Node lifecycle state and graceful shutdown.
//!
//! A single `watch` channel carries the health state, so anything holding a
//! receiver (the HTTP server, background workers, mesh writers) observes
//! `Draining` the moment shutdown starts. In-flight work is counted with
//! RAII guards and drained through a `Notify`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};

/// Lifecycle of a node: `Starting -> Ready -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Listener bound, bootstrap not finished.
    Starting,
    Ready,
    /// Shutdown requested; in-flight work is finishing.
    Draining,
    Stopped,
}

impl HealthState {
    /// Returns `true` while new work may be accepted.
    #[must_use]
    pub fn is_accepting(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Coordinates health reporting and graceful shutdown for one node.
#[derive(Debug)]
pub struct ShutdownController {
    state: watch::Sender<HealthState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(HealthState::Starting);
        Self {
            state,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn set_ready(&self) {
        self.state.send_if_modified(|state| {
            if *state == HealthState::Starting {
                *state = HealthState::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Moves to `Draining` and wakes every subscriber.
    pub fn trigger_shutdown(&self) {
        self.state.send_if_modified(|state| {
            if state.is_accepting() {
                *state = HealthState::Draining;
                true
            } else {
                false
            }
        });
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state.subscribe()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        // Err means the sender is gone, which only happens on drop.
        let _ = rx.wait_for(|state| !state.is_accepting()).await;
    }

    /// Tracks one unit of in-flight work until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no work is in flight, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` on a clean drain; returns
    /// `false` and stays `Draining` if the timeout expires first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        if drained {
            self.state.send_replace(HealthState::Stopped);
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop, waking drainers at zero.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
