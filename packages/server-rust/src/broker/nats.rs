//! NATS connection.
//!
//! Core NATS subjects carry the traffic. With JetStream enabled,
//! `ensure_queue` also asserts an interest-retention stream over the
//! service's subject so the queue is visible to operators. The stream is
//! created with acks off: requests carry a reply subject, and a PubAck
//! would otherwise land on the caller's private reply queue next to the
//! real reply.

use async_nats::jetstream::{self, stream, Context as JetStreamContext};
use async_nats::{Client, ConnectOptions, HeaderMap, Message};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{BrokerConnection, BrokerError, BrokerMessage, BrokerStream, CORRELATION_HEADER};
use crate::config::BrokerConfig;

pub struct NatsBroker {
    client: Client,
    jetstream: Option<JetStreamContext>,
    asserted: DashMap<String, ()>,
}

impl NatsBroker {
    /// Connects to the servers in `config.urls`.
    ///
    /// `default_name` identifies the client when `config.client_name` is unset.
    ///
    /// # Errors
    ///
    /// `BrokerError::Connect` if no server accepts the connection in time.
    pub async fn connect(config: &BrokerConfig, default_name: &str) -> Result<Self, BrokerError> {
        let name = config.client_name.as_deref().unwrap_or(default_name);
        info!(urls = ?config.urls, client = %name, "connecting to NATS");

        let options = ConnectOptions::new()
            .name(name)
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout));
        let client = async_nats::connect_with_options(config.urls.join(","), options)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let jetstream = config.jetstream.then(|| jetstream::new(client.clone()));
        info!(jetstream = jetstream.is_some(), "connected to NATS");
        Ok(Self {
            client,
            jetstream,
            asserted: DashMap::new(),
        })
    }

    fn stream_name(queue: &str) -> String {
        let sanitized: String = queue
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("ORBIT_{sanitized}")
    }

    fn stream_config(queue: &str) -> stream::Config {
        stream::Config {
            name: Self::stream_name(queue),
            subjects: vec![queue.to_string()],
            retention: stream::RetentionPolicy::Interest,
            storage: stream::StorageType::Memory,
            no_ack: true,
            ..Default::default()
        }
    }
}

fn to_message(message: Message) -> BrokerMessage {
    let correlation_id = message
        .headers
        .as_ref()
        .and_then(|h| h.get(CORRELATION_HEADER))
        .map(|v| v.as_str().to_string());
    BrokerMessage {
        subject: message.subject.to_string(),
        payload: message.payload,
        reply_to: message.reply.map(|r| r.to_string()),
        correlation_id,
    }
}

#[async_trait]
impl BrokerConnection for NatsBroker {
    async fn ensure_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let Some(js) = &self.jetstream else {
            return Ok(());
        };
        if self.asserted.contains_key(queue) {
            return Ok(());
        }

        let name = Self::stream_name(queue);
        match js.get_stream(&name).await {
            Ok(existing) if !existing.cached_info().config.no_ack => {
                warn!(stream = %name, "existing stream acks publishes; callers will see extra reply messages");
            }
            Ok(_) => debug!(stream = %name, "using existing stream"),
            Err(_) => {
                info!(stream = %name, subject = %queue, "creating stream");
                js.create_stream(Self::stream_config(queue))
                    .await
                    .map_err(|e| BrokerError::Queue {
                        queue: queue.to_string(),
                        reason: e.to_string(),
                    })?;
            }
        }
        self.asserted.insert(queue.to_string(), ());
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        let mut headers = HeaderMap::new();
        if let Some(id) = correlation_id {
            headers.insert(CORRELATION_HEADER, id);
        }
        let result = match reply_to {
            Some(reply) => {
                self.client
                    .publish_with_reply_and_headers(subject.to_string(), reply.to_string(), headers, payload)
                    .await
            }
            None => {
                self.client
                    .publish_with_headers(subject.to_string(), headers, payload)
                    .await
            }
        };
        result.map_err(|e| BrokerError::Publish {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;
        debug!(subject = %subject, "published");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BrokerStream, BrokerError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::pin(subscriber.map(to_message)))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<BrokerStream, BrokerError> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::pin(subscriber.map(to_message)))
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}
