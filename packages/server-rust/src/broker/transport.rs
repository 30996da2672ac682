//! Broker-backed request/response and fire-and-forget transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use orbit_core::{BrokerEnvelope, BrokerReply};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::BrokerConnection;
use crate::bus::{FireAndForget, HandlerResult, RequestResponseTransport, TransportKind};
use crate::error::RouterError;

/// Sends envelopes to `<service>` subjects.
///
/// Request/reply opens a private reply subscription per call, tagged with a
/// random correlation id. The subscription is dropped as soon as the call
/// settles, whether it resolved or timed out.
pub struct BrokerTransport {
    own_service: String,
    conn: Arc<dyn BrokerConnection>,
    default_timeout: Duration,
}

impl BrokerTransport {
    #[must_use]
    pub fn new(own_service: impl Into<String>, conn: Arc<dyn BrokerConnection>, default_timeout: Duration) -> Self {
        Self {
            own_service: own_service.into(),
            conn,
            default_timeout,
        }
    }

    fn encode(command: &str, payload: Value) -> Result<Bytes, RouterError> {
        let envelope = BrokerEnvelope::new(command, payload);
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| RouterError::Internal(e.into()))
    }

    /// Publishes `command` to `service` and waits for the matching reply.
    ///
    /// # Errors
    ///
    /// - `TransportTimeout` if no reply arrives within `timeout`
    /// - `Remote` if the consumer replied with an error
    /// - `Broker` for connection failures or an unreadable reply
    pub async fn request_reply(
        &self,
        service: &str,
        command: &str,
        payload: Value,
        timeout: Duration,
    ) -> HandlerResult {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_to = format!("_reply.{}.{correlation_id}", self.own_service);
        let body = Self::encode(command, payload)?;

        let mut replies = self.conn.subscribe(&reply_to).await?;
        self.conn.ensure_queue(service).await?;
        self.conn
            .publish(service, body, Some(&reply_to), Some(&correlation_id))
            .await?;

        let wait = async {
            while let Some(message) = replies.next().await {
                if message.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                    return Some(message);
                }
                debug!(subject = %reply_to, "reply with foreign correlation id ignored");
            }
            None
        };
        let message = match tokio::time::timeout(timeout, wait).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(RouterError::Broker(format!(
                    "reply subscription for {command} closed"
                )))
            }
            Err(_) => {
                return Err(RouterError::TransportTimeout {
                    transport: TransportKind::Broker,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        };

        let value: Value = serde_json::from_slice(&message.payload)
            .map_err(|e| RouterError::Broker(format!("malformed reply to {command}: {e}")))?;
        match BrokerReply::from_value(value) {
            BrokerReply::Ok(value) => Ok(value),
            BrokerReply::Error(message) => Err(RouterError::Remote { message }),
        }
    }
}

#[async_trait]
impl RequestResponseTransport for BrokerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broker
    }

    async fn request(
        &self,
        service: &str,
        command: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> HandlerResult {
        self.request_reply(service, command, payload, timeout.unwrap_or(self.default_timeout))
            .await
    }
}

#[async_trait]
impl FireAndForget for BrokerTransport {
    async fn publish(&self, service: &str, command: &str, payload: Value) -> Result<(), RouterError> {
        let body = Self::encode(command, payload)?;
        self.conn.ensure_queue(service).await?;
        self.conn.publish(service, body, None, None).await?;
        debug!(service = %service, command = %command, "published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::broker::{BrokerConsumer, InMemoryBroker};
    use crate::bus::{handler_fn, HandlerTable};

    fn billing() -> Arc<HandlerTable> {
        let handlers = Arc::new(HandlerTable::new());
        handlers.insert(
            "billing.charge",
            Arc::new(handler_fn(|p| async move { Ok(json!({ "charged": p["amount"] })) })),
        );
        handlers.insert(
            "billing.total",
            Arc::new(handler_fn(|_| async { Ok(json!(42)) })),
        );
        handlers.insert(
            "billing.soft",
            Arc::new(handler_fn(|_| async { Ok(json!({ "status": "failed", "reason": "quota" })) })),
        );
        handlers.insert(
            "billing.fail",
            Arc::new(handler_fn(|_| async {
                Err(RouterError::HandlerFailure {
                    message: "card declined".into(),
                })
            })),
        );
        handlers
    }

    async fn setup() -> (Arc<InMemoryBroker>, BrokerTransport, tokio::task::JoinHandle<()>) {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = BrokerConsumer::new("billing", broker.clone(), billing())
            .start()
            .await
            .unwrap();
        let transport = BrokerTransport::new("orders", broker.clone(), Duration::from_secs(5));
        (broker, transport, consumer)
    }

    #[tokio::test]
    async fn request_reply_returns_handler_value() {
        let (_, transport, _consumer) = setup().await;
        let out = transport
            .request("billing", "billing.charge", json!({ "amount": 9 }), None)
            .await
            .unwrap();
        assert_eq!(out, json!({ "charged": 9 }));

        let total = transport.request("billing", "billing.total", Value::Null, None).await.unwrap();
        assert_eq!(total, json!(42));
    }

    #[tokio::test]
    async fn handler_status_fields_survive_the_reply() {
        let (_, transport, _consumer) = setup().await;
        let out = transport.request("billing", "billing.soft", Value::Null, None).await.unwrap();
        assert_eq!(out, json!({ "status": "failed", "reason": "quota" }));
    }

    #[tokio::test]
    async fn unknown_method_is_a_remote_error() {
        let (_, transport, _consumer) = setup().await;
        let err = transport
            .request("billing", "billing.refund", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Remote { message } if message == "Method not found"));
    }

    #[tokio::test]
    async fn handler_errors_come_back_as_remote() {
        let (_, transport, _consumer) = setup().await;
        let err = transport
            .request("billing", "billing.fail", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Remote { message } if message.contains("card declined")));
    }

    #[tokio::test]
    async fn reply_subscription_is_released_after_settling() {
        let (broker, transport, _consumer) = setup().await;
        let baseline = broker.subscription_count();

        transport
            .request("billing", "billing.total", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(broker.subscription_count(), baseline);

        let _ = transport
            .request("nobody", "nobody.call", Value::Null, Some(Duration::from_millis(20)))
            .await;
        assert_eq!(broker.subscription_count(), baseline);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_consumer_times_out() {
        let broker = Arc::new(InMemoryBroker::new());
        let transport = BrokerTransport::new("orders", broker, Duration::from_secs(5));

        let err = transport
            .request("billing", "billing.charge", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::TransportTimeout {
                transport: TransportKind::Broker,
                timeout_ms: 5000
            }
        ));
    }

    #[tokio::test]
    async fn publish_asserts_queue_and_delivers() {
        let broker = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = Arc::new(HandlerTable::new());
        let seen = Arc::clone(&calls);
        handlers.insert(
            "mailer.send",
            Arc::new(handler_fn(move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })),
        );
        let _consumer = BrokerConsumer::new("mailer", broker.clone(), handlers)
            .start()
            .await
            .unwrap();
        let transport = BrokerTransport::new("orders", broker.clone(), Duration::from_secs(5));

        FireAndForget::publish(&transport, "mailer", "mailer.send", json!({ "to": "a@b" }))
            .await
            .unwrap();
        assert!(broker.has_queue("mailer"));

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnected_broker_surfaces_broker_error() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.disconnect();
        let transport = BrokerTransport::new("orders", broker, Duration::from_secs(5));
        let err = FireAndForget::publish(&transport, "mailer", "mailer.send", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Broker(_)));
    }
}
