//! Peer mesh: request/response RPC over persistent peer sockets.
//!
//! Every node both accepts inbound peer sockets (the `/mesh` endpoint) and
//! dials out by service name. Frames are JSON [`MeshFrame`]s; the peer's
//! identity travels once, in the `x-service-name` handshake header.
//!
//! Socket plumbing is kept generic: [`PeerMesh::attach`] takes any stream of
//! text frames and any sink of [`OutboundFrame`]s, so the axum server side,
//! the tungstenite client side, and in-memory test links all share one
//! read/write loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use orbit_core::{CommandName, MeshFrame, MeshRequest, MeshResponse, SERVICE_NAME_HEADER};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::config::MeshConfig;
use super::connection::{OutboundFrame, PeerDirection, PeerHandle, PeerTable};
use super::pending::PendingCalls;
use super::reconnect::ReconnectTracker;
use crate::bus::{HandlerResult, HandlerTable, RequestResponseTransport, TransportKind};
use crate::error::RouterError;

struct MeshInner {
    service_name: String,
    config: MeshConfig,
    peers: PeerTable,
    pending: PendingCalls,
    handlers: Arc<HandlerTable>,
    reconnect: ReconnectTracker,
}

/// Cheaply cloneable handle to this node's mesh state.
#[derive(Clone)]
pub struct PeerMesh {
    inner: Arc<MeshInner>,
}

impl PeerMesh {
    /// Creates a mesh for `service_name`. Inbound requests dispatch through
    /// `handlers`.
    #[must_use]
    pub fn new(service_name: impl Into<String>, config: MeshConfig, handlers: Arc<HandlerTable>) -> Self {
        let reconnect = ReconnectTracker::new(config.reconnect.clone());
        Self {
            inner: Arc::new(MeshInner {
                service_name: service_name.into(),
                config,
                peers: PeerTable::new(),
                pending: PendingCalls::new(),
                handlers,
                reconnect,
            }),
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    #[must_use]
    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn is_connected(&self, peer: &str) -> bool {
        self.inner.peers.is_connected(peer)
    }

    /// Sorted names of peers with an open socket.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<String> {
        self.inner.peers.names()
    }

    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    #[must_use]
    pub fn reconnect(&self) -> &ReconnectTracker {
        &self.inner.reconnect
    }

    // -----------------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------------

    /// Sends `command` to `peer` and waits for its response.
    ///
    /// Requires an already-open connection; nothing is dialed here.
    ///
    /// # Errors
    ///
    /// - `TransportUnavailable` if no socket to `peer` is open, or it closes
    ///   before answering
    /// - `TransportTimeout` if no response arrives within `timeout`
    ///   (default from [`MeshConfig::request_timeout`])
    /// - `Remote` carrying the peer's error text
    pub async fn send(
        &self,
        peer: &str,
        command: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> HandlerResult {
        let unavailable = || RouterError::TransportUnavailable {
            peer: peer.to_string(),
        };
        let Some(handle) = self.inner.peers.get(peer) else {
            record_outcome("unavailable");
            return Err(unavailable());
        };
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);

        // Dropping `entry` on any exit, including this future being
        // dropped mid-wait, removes the pending call.
        let (entry, rx) = self.inner.pending.register(peer, handle.id);
        let frame = MeshFrame::Request(MeshRequest {
            message_id: entry.message_id().to_string(),
            command_name: command.to_string(),
            payload,
        });
        let text = frame
            .encode()
            .map_err(|e| anyhow::Error::new(e).context("encoding mesh request"))?;

        if handle
            .send_timeout(OutboundFrame::Text(text), self.inner.config.connection.send_timeout)
            .await
            .is_err()
        {
            record_outcome("unavailable");
            return Err(unavailable());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => {
                record_outcome("ok");
                Ok(value)
            }
            Ok(Ok(Err(message))) => {
                record_outcome("remote_error");
                Err(RouterError::Remote { message })
            }
            Ok(Err(_)) => {
                record_outcome("unavailable");
                Err(unavailable())
            }
            Err(_) => {
                // Remove first so a late response is dropped, not delivered.
                drop(entry);
                record_outcome("timeout");
                Err(RouterError::TransportTimeout {
                    transport: TransportKind::Mesh,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    /// Handles one text frame received on `from`'s socket.
    pub fn handle_text(&self, from: &Arc<PeerHandle>, text: &str) {
        let frame = match MeshFrame::decode(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %from.service, error = %e, "dropping malformed mesh frame");
                return;
            }
        };

        match frame {
            MeshFrame::Request(request) => self.spawn_request(Arc::clone(from), request),
            MeshFrame::Response(response) => {
                let message_id = response.message_id.clone();
                if !self.inner.pending.resolve(&message_id, response.into_result()) {
                    debug!(peer = %from.service, message_id = %message_id, "dropping response with no pending call");
                }
            }
        }
    }

    fn spawn_request(&self, from: Arc<PeerHandle>, request: MeshRequest) {
        let handlers = Arc::clone(&self.inner.handlers);
        let command = CommandName::qualify(&request.command_name, &self.inner.service_name).to_string();
        let send_timeout = self.inner.config.connection.send_timeout;

        tokio::spawn(async move {
            let response = match handlers.dispatch(&command, request.payload).await {
                Ok(value) => MeshResponse::ok(request.message_id, value),
                Err(e) => {
                    debug!(peer = %from.service, command = %command, error = %e, "mesh request failed");
                    MeshResponse::err(request.message_id, e.to_string())
                }
            };
            let text = match MeshFrame::Response(response).encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(peer = %from.service, error = %e, "failed to encode mesh response");
                    return;
                }
            };
            if from
                .send_timeout(OutboundFrame::Text(text), send_timeout)
                .await
                .is_err()
            {
                debug!(peer = %from.service, command = %command, "peer gone before response was written");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Registers a connection to `peer` and spawns its read/write loops.
    ///
    /// The peer is reachable through [`send`](Self::send) as soon as this
    /// returns. An older connection to the same peer stays open but stops
    /// carrying new requests; frames it still receives are handled as usual.
    /// The returned task finishes when either side of the socket ends; calls
    /// written on it are then failed and the table entry is removed unless
    /// it was already replaced.
    pub fn attach<S, K>(
        &self,
        peer: &str,
        direction: PeerDirection,
        incoming: S,
        outgoing: K,
    ) -> (Arc<PeerHandle>, JoinHandle<()>)
    where
        S: Stream<Item = String> + Send + Unpin + 'static,
        K: Sink<OutboundFrame> + Send + Unpin + 'static,
        K::Error: fmt::Display + Send,
    {
        let (handle, rx) = self
            .inner
            .peers
            .register(peer, direction, &self.inner.config.connection);
        info!(peer = %peer, ?direction, connection = handle.id.0, "peer connected");

        let mesh = self.clone();
        let reader_handle = Arc::clone(&handle);
        let task = tokio::spawn(async move {
            let mut writer = tokio::spawn(write_loop(reader_handle.service.clone(), rx, outgoing));
            let mut incoming = incoming;
            let read = async {
                while let Some(text) = incoming.next().await {
                    mesh.handle_text(&reader_handle, &text);
                }
            };
            tokio::select! {
                () = read => writer.abort(),
                _ = &mut writer => {}
            }
            mesh.detach(&reader_handle);
        });
        (handle, task)
    }

    fn detach(&self, handle: &PeerHandle) {
        let abandoned = self.inner.pending.abandon_connection(handle.id);
        if self.inner.peers.remove_if_current(&handle.service, handle.id) {
            self.inner.reconnect.closed(&handle.service);
            info!(peer = %handle.service, connection = handle.id.0, abandoned, "peer disconnected");
        } else {
            debug!(peer = %handle.service, connection = handle.id.0, abandoned, "replaced peer connection closed");
        }
    }

    /// Dials `peer`'s mesh endpoint and attaches the socket.
    ///
    /// # Errors
    ///
    /// `TransportUnavailable` if the handshake fails or does not finish
    /// within the mesh request timeout.
    pub async fn dial(&self, peer: &str) -> Result<Arc<PeerHandle>, RouterError> {
        let result = self.connect(peer).await;
        let now = tokio::time::Instant::now();
        match result {
            Ok(handle) => {
                self.inner.reconnect.connected(peer);
                Ok(handle)
            }
            Err(reason) => {
                let delay = self.inner.reconnect.failed(peer, now);
                debug!(peer = %peer, reason = %reason, retry_in_ms = delay.as_millis(), "dial failed");
                Err(RouterError::TransportUnavailable {
                    peer: peer.to_string(),
                })
            }
        }
    }

    async fn connect(&self, peer: &str) -> Result<Arc<PeerHandle>, String> {
        let url = self.inner.config.peer_url(peer);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| format!("invalid peer url {url}: {e}"))?;
        let own_name = HeaderValue::from_str(&self.inner.service_name)
            .map_err(|e| format!("invalid service name header: {e}"))?;
        request.headers_mut().insert(SERVICE_NAME_HEADER, own_name);

        let (socket, _) = tokio::time::timeout(
            self.inner.config.request_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| format!("handshake with {url} timed out"))?
        .map_err(|e| format!("connecting to {url}: {e}"))?;

        let (sink, stream) = socket.split();
        let incoming = stream
            .take_while(|msg| future::ready(matches!(msg, Ok(m) if !m.is_close())))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(WsMessage::Text(text)) => Some(text.as_str().to_owned()),
                    _ => None,
                })
            });
        let outgoing = sink.with(|frame: OutboundFrame| {
            future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(match frame {
                OutboundFrame::Text(text) => WsMessage::Text(text.into()),
                OutboundFrame::Close(_) => WsMessage::Close(None),
            }))
        });

        let (handle, _task) = self.attach(peer, PeerDirection::Outbound, Box::pin(incoming), Box::pin(outgoing));
        Ok(handle)
    }

    /// Closes every peer socket, replaced ones included. Used during
    /// shutdown.
    pub fn close_all(&self) {
        for handle in self.inner.peers.drain_all() {
            let _ = handle.try_send(OutboundFrame::Close(Some("shutdown".to_string())));
            self.inner.pending.abandon_peer(&handle.service);
        }
    }
}

async fn write_loop<K>(peer: String, mut rx: mpsc::Receiver<OutboundFrame>, mut outgoing: K)
where
    K: Sink<OutboundFrame> + Unpin,
    K::Error: fmt::Display + Send,
{
    while let Some(frame) = rx.recv().await {
        let closing = match &frame {
            OutboundFrame::Close(reason) => {
                debug!(peer = %peer, reason = reason.as_deref().unwrap_or(""), "closing peer socket");
                true
            }
            OutboundFrame::Text(_) => false,
        };
        if let Err(e) = outgoing.send(frame).await {
            debug!(peer = %peer, error = %e, "peer socket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = outgoing.close().await;
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("orbit_mesh_requests_total", "outcome" => outcome).increment(1);
}

#[async_trait]
impl RequestResponseTransport for PeerMesh {
    fn kind(&self) -> TransportKind {
        TransportKind::Mesh
    }

    async fn request(
        &self,
        service: &str,
        command: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> HandlerResult {
        self.send(service, command, payload, timeout).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use futures_util::{sink, stream};
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::bus::handler_fn;

    type TextStream = std::pin::Pin<Box<dyn Stream<Item = String> + Send>>;
    type FrameSink = std::pin::Pin<Box<dyn Sink<OutboundFrame, Error = &'static str> + Send>>;

    /// One direction of an in-memory socket.
    fn pipe() -> (FrameSink, TextStream) {
        let (tx, rx) = mpsc::channel::<String>(64);
        let sink = sink::unfold(tx, |tx, frame: OutboundFrame| async move {
            match frame {
                OutboundFrame::Text(text) => {
                    tx.send(text).await.map_err(|_| "closed")?;
                    Ok::<_, &'static str>(tx)
                }
                OutboundFrame::Close(_) => Err("closed"),
            }
        });
        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|t| (t, rx)) });
        (Box::pin(sink), Box::pin(stream))
    }

    /// Connects `a` and `b` as if `a` had dialed `b`.
    pub(crate) fn link(a: &PeerMesh, b: &PeerMesh) -> (JoinHandle<()>, JoinHandle<()>) {
        let (a_out, b_in) = pipe();
        let (b_out, a_in) = pipe();
        let (_, ta) = a.attach(b.service_name(), PeerDirection::Outbound, a_in, a_out);
        let (_, tb) = b.attach(a.service_name(), PeerDirection::Inbound, b_in, b_out);
        (ta, tb)
    }

    fn node(name: &str) -> (PeerMesh, Arc<HandlerTable>) {
        let handlers = Arc::new(HandlerTable::new());
        (PeerMesh::new(name, MeshConfig::default(), Arc::clone(&handlers)), handlers)
    }

    #[tokio::test]
    async fn round_trip_returns_handler_value() {
        let (orders, _) = node("orders");
        let (billing, handlers) = node("billing");
        handlers.insert(
            "billing.charge",
            Arc::new(handler_fn(|p| async move { Ok(json!({ "charged": p["amount"] })) })),
        );
        link(&orders, &billing);

        let out = orders
            .send("billing", "billing.charge", json!({ "amount": 12 }), None)
            .await
            .unwrap();
        assert_eq!(out, json!({ "charged": 12 }));
        assert_eq!(orders.pending_calls(), 0);
    }

    #[tokio::test]
    async fn requests_flow_both_ways_on_one_socket() {
        let (orders, orders_handlers) = node("orders");
        let (billing, billing_handlers) = node("billing");
        orders_handlers.insert("orders.ping", Arc::new(handler_fn(|_| async { Ok(json!("pong-orders")) })));
        billing_handlers.insert("billing.ping", Arc::new(handler_fn(|_| async { Ok(json!("pong-billing")) })));
        link(&orders, &billing);

        assert_eq!(
            orders.send("billing", "billing.ping", Value::Null, None).await.unwrap(),
            json!("pong-billing")
        );
        assert_eq!(
            billing.send("orders", "ping", Value::Null, None).await.unwrap(),
            json!("pong-orders")
        );
    }

    #[tokio::test]
    async fn remote_errors_carry_the_peer_message() {
        let (orders, _) = node("orders");
        let (billing, handlers) = node("billing");
        handlers.insert(
            "billing.charge",
            Arc::new(handler_fn(|_| async {
                Err(RouterError::HandlerFailure {
                    message: "card declined".into(),
                })
            })),
        );
        link(&orders, &billing);

        let err = orders
            .send("billing", "billing.charge", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Remote { message } if message.contains("card declined")));

        let err = orders
            .send("billing", "billing.refund", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Remote { message } if message.contains("not registered")));
    }

    #[tokio::test]
    async fn send_without_connection_is_unavailable() {
        let (orders, _) = node("orders");
        let err = orders
            .send("billing", "billing.charge", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::TransportUnavailable { peer } if peer == "billing"));
        assert_eq!(orders.pending_calls(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_pending_call_and_drops_late_response() {
        let (orders, _) = node("orders");
        let (billing, handlers) = node("billing");
        handlers.insert(
            "billing.slow",
            Arc::new(handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("late"))
            })),
        );
        handlers.insert("billing.fast", Arc::new(handler_fn(|_| async { Ok(json!("fast")) })));
        link(&orders, &billing);

        let err = orders
            .send("billing", "billing.slow", Value::Null, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::TransportTimeout { transport: TransportKind::Mesh, timeout_ms: 20 }
        ));
        assert_eq!(orders.pending_calls(), 0);

        // The late response arrives and is ignored; the link keeps working.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            orders.send("billing", "billing.fast", Value::Null, None).await.unwrap(),
            json!("fast")
        );
        assert_eq!(orders.pending_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_complete_out_of_order() {
        let (orders, _) = node("orders");
        let (billing, handlers) = node("billing");
        handlers.insert(
            "billing.wait",
            Arc::new(handler_fn(|p| async move {
                let ms = p.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            })),
        );
        link(&orders, &billing);

        let slow = orders.send("billing", "billing.wait", json!(80), None);
        let fast = orders.send("billing", "billing.wait", json!(5), None);
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap(), json!(80));
        assert_eq!(fast.unwrap(), json!(5));
        assert_eq!(orders.pending_calls(), 0);
    }

    #[tokio::test]
    async fn peer_close_fails_in_flight_calls() {
        let (orders, _) = node("orders");
        let (billing, handlers) = node("billing");
        handlers.insert(
            "billing.hang",
            Arc::new(handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })),
        );
        let (orders_task, _) = link(&orders, &billing);

        let call = {
            let orders = orders.clone();
            tokio::spawn(async move { orders.send("billing", "billing.hang", Value::Null, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        billing.close_all();
        orders_task.await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RouterError::TransportUnavailable { .. }));
        assert!(!orders.is_connected("billing"));
        assert_eq!(orders.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dropped_caller_leaves_no_pending_call() {
        let (orders, _) = node("orders");
        let (billing, handlers) = node("billing");
        handlers.insert(
            "billing.hang",
            Arc::new(handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })),
        );
        link(&orders, &billing);

        let cut_short = tokio::time::timeout(
            Duration::from_millis(20),
            orders.send("billing", "billing.hang", Value::Null, Some(Duration::from_millis(100))),
        )
        .await;
        assert!(cut_short.is_err());
        assert_eq!(orders.pending_calls(), 0);
        assert!(orders.is_connected("billing"));
    }

    #[tokio::test]
    async fn crossing_dials_leave_both_sides_connected() {
        let (a, a_handlers) = node("a");
        let (b, b_handlers) = node("b");
        a_handlers.insert("a.ping", Arc::new(handler_fn(|_| async { Ok(json!("pong-a")) })));
        b_handlers.insert("b.ping", Arc::new(handler_fn(|_| async { Ok(json!("pong-b")) })));

        // First socket: a dialed b. Second socket: b dialed a.
        let (first_a_out, first_b_in) = pipe();
        let (first_b_out, first_a_in) = pipe();
        let (second_b_out, second_a_in) = pipe();
        let (second_a_out, second_b_in) = pipe();

        // Each side accepts the other's dial before its own dial completes.
        let _ = b.attach("a", PeerDirection::Inbound, first_b_in, first_b_out);
        let _ = a.attach("b", PeerDirection::Inbound, second_a_in, second_a_out);
        let _ = a.attach("b", PeerDirection::Outbound, first_a_in, first_a_out);
        let _ = b.attach("a", PeerDirection::Outbound, second_b_in, second_b_out);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(a.is_connected("b"));
        assert!(b.is_connected("a"));
        assert_eq!(a.send("b", "b.ping", Value::Null, None).await.unwrap(), json!("pong-b"));
        assert_eq!(b.send("a", "a.ping", Value::Null, None).await.unwrap(), json!("pong-a"));
        assert_eq!(a.pending_calls(), 0);
        assert_eq!(b.pending_calls(), 0);
    }

    #[tokio::test]
    async fn replaced_socket_closing_fails_only_its_own_calls() {
        let (orders, _) = node("orders");
        let (billing, handlers) = node("billing");
        handlers.insert(
            "billing.hang",
            Arc::new(handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })),
        );
        handlers.insert("billing.ok", Arc::new(handler_fn(|_| async { Ok(json!(true)) })));
        let (old_task, _) = link(&orders, &billing);

        let stranded = {
            let orders = orders.clone();
            tokio::spawn(async move { orders.send("billing", "billing.hang", Value::Null, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let old = orders.inner.peers.get("billing").unwrap();
        link(&orders, &billing);

        assert!(old.try_send(OutboundFrame::Close(None)));
        old_task.await.unwrap();

        let err = stranded.await.unwrap().unwrap_err();
        assert!(matches!(err, RouterError::TransportUnavailable { .. }));
        assert!(orders.is_connected("billing"));
        assert_eq!(
            orders.send("billing", "billing.ok", Value::Null, None).await.unwrap(),
            json!(true)
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let (orders, _) = node("orders");
        let (billing, handlers) = node("billing");
        handlers.insert("billing.ok", Arc::new(handler_fn(|_| async { Ok(json!(true)) })));
        link(&orders, &billing);

        let handle = orders.inner.peers.get("billing").unwrap();
        assert!(handle.try_send(OutboundFrame::Text("{not json".into())));
        assert_eq!(
            orders.send("billing", "billing.ok", Value::Null, None).await.unwrap(),
            json!(true)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn payloads_survive_the_round_trip(value in any::<(i64, String, bool, Vec<u8>)>()) {
            let payload = json!({ "n": value.0, "s": value.1, "b": value.2, "v": value.3 });
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let out = rt.block_on(async {
                let (orders, _) = node("orders");
                let (billing, handlers) = node("billing");
                handlers.insert("billing.echo", Arc::new(handler_fn(|p| async move { Ok(p) })));
                link(&orders, &billing);
                orders.send("billing", "billing.echo", payload.clone(), None).await
            });
            prop_assert_eq!(out.unwrap(), payload);
        }
    }
}
