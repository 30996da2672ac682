//! Node health endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

/// Health state, uptime, and mesh status.
///
/// Returns 200 while the node accepts work and 503 once it is draining, so
/// load balancers stop routing to it. The body is the same either way.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let health = state.shutdown.health_state();
    let peers = state.mesh.connected_peers();
    let status = if health.is_accepting() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "service": state.bus.service_name(),
            "state": health,
            "uptimeSecs": state.start_time.elapsed().as_secs(),
            "connections": peers.len(),
            "peers": peers,
            "pendingCalls": state.mesh.pending_calls(),
            "inFlight": state.shutdown.in_flight_count(),
        })),
    )
}
