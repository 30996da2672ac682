//! Transport seams used by the command bus for cross-service calls.
//!
//! Two request/response strategies exist (peer mesh and broker) behind one
//! trait. The bus picks one per call site through
//! [`ExecuteOptions::via`](super::ExecuteOptions::via); it never falls back
//! from one to the other.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::handler::HandlerResult;
use crate::error::RouterError;

/// Identifies a request/response strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Persistent peer sockets, 10 s default timeout.
    #[default]
    Mesh,
    /// Broker request/reply with a private reply queue, 5 s default timeout.
    Broker,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mesh => "mesh",
            Self::Broker => "broker",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous round trip to another service.
#[async_trait]
pub trait RequestResponseTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Sends `command` to `service` and waits for its result.
    ///
    /// `timeout` overrides the transport's default window.
    async fn request(
        &self,
        service: &str,
        command: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> HandlerResult;
}

/// One-way delivery with no result.
#[async_trait]
pub trait FireAndForget: Send + Sync {
    /// Returns once the message is handed to the transport.
    async fn publish(&self, service: &str, command: &str, payload: Value)
        -> Result<(), RouterError>;
}
