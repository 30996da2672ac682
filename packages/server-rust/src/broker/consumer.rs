//! Serves this node's broker queue.
//!
//! Every inbound envelope is dispatched to the local handler table. A
//! message that carries a reply subject always gets exactly one reply, and
//! no message is ever handed back to the broker for redelivery: retrying is
//! the caller's decision.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use orbit_core::{BrokerEnvelope, BrokerReply, CommandName};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrokerConnection, BrokerMessage};
use crate::bus::HandlerTable;
use crate::error::RouterError;

#[derive(Clone)]
pub struct BrokerConsumer {
    service: String,
    conn: Arc<dyn BrokerConnection>,
    handlers: Arc<HandlerTable>,
}

impl BrokerConsumer {
    #[must_use]
    pub fn new(service: impl Into<String>, conn: Arc<dyn BrokerConnection>, handlers: Arc<HandlerTable>) -> Self {
        Self {
            service: service.into(),
            conn,
            handlers,
        }
    }

    /// Asserts this service's queue, joins it, and spawns the receive loop.
    ///
    /// Each message is handled on its own task. The loop ends when the
    /// subscription closes; abort the handle to stop it earlier.
    ///
    /// # Errors
    ///
    /// `Broker` if the queue cannot be asserted or subscribed.
    pub async fn start(self) -> Result<JoinHandle<()>, RouterError> {
        self.conn.ensure_queue(&self.service).await?;
        let mut messages = self.conn.queue_subscribe(&self.service, &self.service).await?;
        info!(service = %self.service, "broker consumer started");

        Ok(tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let consumer = self.clone();
                tokio::spawn(async move {
                    consumer.handle_message(message).await;
                });
            }
            debug!(service = %self.service, "broker subscription closed");
        }))
    }

    /// Handles one message and returns the reply it produced.
    pub async fn handle_message(&self, message: BrokerMessage) -> BrokerReply {
        let reply = match serde_json::from_slice::<BrokerEnvelope>(&message.payload) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(e) => {
                warn!(subject = %message.subject, error = %e, "undecodable broker envelope");
                BrokerReply::Error(format!("invalid envelope: {e}"))
            }
        };

        if let Some(reply_to) = message.reply_to.as_deref() {
            self.send_reply(reply_to, message.correlation_id.as_deref(), reply.clone())
                .await;
        }
        reply
    }

    async fn dispatch(&self, envelope: BrokerEnvelope) -> BrokerReply {
        let command = CommandName::qualify(&envelope.method, &self.service).to_string();
        match self.handlers.dispatch(&command, envelope.data).await {
            Ok(value) => BrokerReply::Ok(value),
            Err(RouterError::CommandNotRegistered { name }) => {
                debug!(command = %name, "broker request for unknown method");
                BrokerReply::method_not_found()
            }
            Err(e) => {
                debug!(command = %command, error = %e, "broker handler failed");
                BrokerReply::Error(e.to_string())
            }
        }
    }

    async fn send_reply(&self, reply_to: &str, correlation_id: Option<&str>, reply: BrokerReply) {
        let body = match serde_json::to_vec(&reply.into_value()) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(error = %e, "could not encode broker reply");
                return;
            }
        };
        if let Err(e) = self.conn.publish(reply_to, body, None, correlation_id).await {
            warn!(reply_to = %reply_to, error = %e, "broker reply not delivered");
        }
    }
}
