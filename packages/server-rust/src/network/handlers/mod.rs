//! HTTP and WebSocket handlers.
//!
//! Control-plane handlers are thin: each one turns a request into a
//! `<control>.*` (or `<service>.*`) command on the bus and maps the result
//! back to HTTP. On the control node those commands run locally.

pub mod control;
pub mod health;
pub mod tasks;
pub mod websocket;

pub use control::{migrations_handler, reset_handler, seeders_handler};
pub use health::health_handler;
pub use tasks::{delete_failed_handler, execute_batch_handler, list_tasks_handler, schedule_handler};
pub use websocket::mesh_upgrade_handler;

use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::bus::{CommandBus, ExecuteOptions};
use crate::config::NodeConfig;
use crate::error::RouterError;
use crate::network::mesh::PeerMesh;
use crate::network::shutdown::ShutdownController;

/// State shared by every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<CommandBus>,
    pub mesh: PeerMesh,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NodeConfig>,
    pub start_time: Instant,
}

impl AppState {
    /// Runs `<control>.<method>` on the bus.
    pub(crate) async fn control_call(&self, method: &str, payload: Value) -> Result<Value, ApiError> {
        let command = format!("{}.{method}", self.config.control_service);
        Ok(self
            .bus
            .execute(&command, payload, ExecuteOptions::default())
            .await?)
    }
}

/// A [`RouterError`] rendered as `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub RouterError);

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        Self(err)
    }
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RouterError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            RouterError::TaskConflict { .. } => StatusCode::CONFLICT,
            RouterError::CommandNotRegistered { .. } => StatusCode::NOT_FOUND,
            RouterError::TransportUnavailable { .. }
            | RouterError::Remote { .. }
            | RouterError::Broker(_) => StatusCode::BAD_GATEWAY,
            RouterError::TransportTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RouterError::HandlerFailure { .. } | RouterError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, status = status.as_u16(), "control request failed");
        }
        let body = Json(json!({ "error": self.0.to_string() }));
        if self.0.is_retryable() {
            (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// `Retry-After` sent with retryable transport failures.
const RETRY_AFTER_SECS: &str = "1";
