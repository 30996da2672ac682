//! Inbound mesh endpoint (`GET /mesh`).
//!
//! A dialing peer must identify itself with the `x-service-name` header;
//! the upgrade is refused otherwise. The accepted socket is handed to
//! [`PeerMesh::attach`](crate::network::mesh::PeerMesh::attach) and lives
//! until either side closes it.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{future, SinkExt, StreamExt};
use orbit_core::SERVICE_NAME_HEADER;
use tracing::debug;

use super::AppState;
use crate::network::connection::{OutboundFrame, PeerDirection};
use crate::network::mesh::PeerMesh;

pub async fn mesh_upgrade_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let peer = headers
        .get(SERVICE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let Some(peer) = peer else {
        return (StatusCode::BAD_REQUEST, "missing x-service-name header").into_response();
    };
    if !state.shutdown.health_state().is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let mesh = state.mesh.clone();
    ws.on_upgrade(move |socket| serve_peer(mesh, peer, socket))
}

async fn serve_peer(mesh: PeerMesh, peer: String, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let incoming = stream
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });
    let outgoing = sink.with(|frame: OutboundFrame| {
        future::ready(Ok::<_, axum::Error>(match frame {
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Close(_) => Message::Close(None),
        }))
    });

    let (_, task) = mesh.attach(&peer, PeerDirection::Inbound, Box::pin(incoming), Box::pin(outgoing));
    if task.await.is_err() {
        debug!(peer = %peer, "mesh connection task ended abnormally");
    }
}
