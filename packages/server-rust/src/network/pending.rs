//! Pending mesh calls, keyed by message id.
//!
//! Every entry ends in exactly one of: a matching response (`resolve`), an
//! explicit rejection when its socket goes away (`abandon_connection`,
//! `abandon_peer`), or the caller dropping its [`PendingEntry`] (timeout,
//! cancelled request, aborted task).
//! Removal happens before the oneshot fires, so a late or duplicate
//! response finds nothing and is dropped.

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::connection::ConnectionId;

/// Outcome delivered to a waiting caller: the remote result, or the
/// remote-side error text.
pub type CallOutcome = Result<serde_json::Value, String>;

#[derive(Debug)]
struct PendingCall {
    target: String,
    connection: ConnectionId,
    tx: oneshot::Sender<CallOutcome>,
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<String, PendingCall>,
}

/// Caller's claim on one pending call. Dropping it removes the entry, so a
/// caller that stops waiting never leaves anything behind.
#[derive(Debug)]
#[must_use = "dropping the entry cancels the call"]
pub struct PendingEntry<'a> {
    calls: &'a PendingCalls,
    message_id: String,
}

impl PendingEntry<'_> {
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.calls.cancel(&self.message_id);
    }
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an entry for a call to `target` written on `connection`,
    /// under a fresh message id.
    pub fn register(
        &self,
        target: &str,
        connection: ConnectionId,
    ) -> (PendingEntry<'_>, oneshot::Receiver<CallOutcome>) {
        let message_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            message_id.clone(),
            PendingCall {
                target: target.to_string(),
                connection,
                tx,
            },
        );
        self.record_gauge();
        (
            PendingEntry {
                calls: self,
                message_id,
            },
            rx,
        )
    }

    /// Completes the call for `message_id`. Returns `false` if no call was
    /// waiting.
    pub fn resolve(&self, message_id: &str, outcome: CallOutcome) -> bool {
        let Some((_, call)) = self.calls.remove(message_id) else {
            return false;
        };
        self.record_gauge();
        // The caller may have given up between removal and send.
        let _ = call.tx.send(outcome);
        true
    }

    /// Drops the entry for `message_id` without notifying the caller.
    pub fn cancel(&self, message_id: &str) -> bool {
        let removed = self.calls.remove(message_id).is_some();
        if removed {
            self.record_gauge();
        }
        removed
    }

    /// Drops every call waiting on `target`; their receivers observe a
    /// closed channel. Returns how many were abandoned.
    pub fn abandon_peer(&self, target: &str) -> usize {
        self.abandon_where(|call| call.target == target)
    }

    /// Drops every call whose request went out on `connection`.
    pub fn abandon_connection(&self, connection: ConnectionId) -> usize {
        self.abandon_where(|call| call.connection == connection)
    }

    fn abandon_where(&self, matches: impl Fn(&PendingCall) -> bool) -> usize {
        let before = self.calls.len();
        self.calls.retain(|_, call| !matches(call));
        let abandoned = before.saturating_sub(self.calls.len());
        if abandoned > 0 {
            self.record_gauge();
        }
        abandoned
    }

    #[must_use]
    pub fn contains(&self, message_id: &str) -> bool {
        self.calls.contains_key(message_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_gauge(&self) {
        metrics::gauge!("orbit_mesh_pending_calls").set(self.calls.len() as f64);
    }
}
