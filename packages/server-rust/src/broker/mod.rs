//! Broker RPC: fire-and-forget publish and request/reply over a message
//! broker, plus the consumer that serves a node's own queue.
//!
//! [`BrokerConnection`] is the seam between the RPC logic and the wire.
//! [`nats::NatsBroker`] talks to a real NATS server; [`memory::InMemoryBroker`]
//! keeps everything in-process for tests and single-binary deployments.
//!
//! Each service consumes the subject named after itself through a queue
//! group, so several replicas of one service share the load.

pub mod consumer;
pub mod memory;
pub mod nats;
pub mod transport;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

pub use consumer::BrokerConsumer;
pub use memory::InMemoryBroker;
pub use nats::NatsBroker;
pub use transport::BrokerTransport;

use crate::error::RouterError;

/// Header carrying the request/reply correlation id.
pub const CORRELATION_HEADER: &str = "correlation-id";

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Bytes,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

/// Messages from one subscription. Dropping it unsubscribes.
pub type BrokerStream = Pin<Box<dyn Stream<Item = BrokerMessage> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("queue {queue} could not be asserted: {reason}")]
    Queue { queue: String, reason: String },
}

impl From<BrokerError> for RouterError {
    fn from(err: BrokerError) -> Self {
        Self::Broker(err.to_string())
    }
}

/// Minimal broker surface the RPC layer needs.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Makes sure messages for `queue` have somewhere to go.
    async fn ensure_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Writes one message. Returns once the broker has it.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<(), BrokerError>;

    /// Private subscription; every message on `subject` is delivered here.
    async fn subscribe(&self, subject: &str) -> Result<BrokerStream, BrokerError>;

    /// Shared subscription; each message goes to one member of `group`.
    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<BrokerStream, BrokerError>;

    fn is_connected(&self) -> bool;
}
