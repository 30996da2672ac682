//! Operator endpoints that fan a maintenance command out to services.
//!
//! `POST /control/migrations` runs `<service>.runMigrations`,
//! `POST /control/seeders` runs `<service>.runSeeders`, and
//! `POST /control/reset` (development only) runs `<service>.reset`. Without
//! an explicit `service`, every registered service whose manifest exposes
//! the command is targeted. Per-service outcomes are returned side by side;
//! one service failing does not stop the others.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use futures_util::future::join_all;
use orbit_core::ServiceManifest;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{ApiError, AppState};
use crate::bus::ExecuteOptions;
use crate::config::Environment;
use crate::error::RouterError;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MaintenanceRequest {
    service: Option<String>,
    migration: Option<String>,
}

fn parse_body(body: &Bytes) -> Result<MaintenanceRequest, ApiError> {
    if body.is_empty() {
        return Ok(MaintenanceRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError(RouterError::from(e)))
}

pub async fn migrations_handler(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request = parse_body(&body)?;
    let payload = match &request.migration {
        Some(migration) => json!({ "migration": migration }),
        None => json!({}),
    };
    fan_out(&state, "runMigrations", request.service, payload).await
}

pub async fn seeders_handler(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request = parse_body(&body)?;
    fan_out(&state, "runSeeders", request.service, json!({})).await
}

pub async fn reset_handler(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.config.environment != Environment::Development {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "reset is only available in development" })),
        ));
    }
    fan_out(&state, "reset", None, json!({}))
        .await
        .map_err(|e| (e.status(), Json(json!({ "error": e.0.to_string() }))))
}

async fn fan_out(
    state: &AppState,
    method: &str,
    service: Option<String>,
    payload: Value,
) -> Result<Json<Value>, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let targets = match service {
        Some(service) => vec![service],
        None => exposing(&state.control_call("getManifests", Value::Null).await?, method)?,
    };
    info!(method = %method, services = ?targets, "running maintenance command");

    let calls = targets.iter().map(|service| {
        let command = format!("{service}.{method}");
        let payload = payload.clone();
        async move {
            let outcome = state
                .bus
                .execute(&command, payload, ExecuteOptions::default())
                .await;
            (service.clone(), outcome)
        }
    });

    let mut results = Map::new();
    for (service, outcome) in join_all(calls).await {
        let entry = match outcome {
            Ok(value) => json!({ "ok": value }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        results.insert(service, entry);
    }
    Ok(Json(json!({ "method": method, "results": results })))
}

/// Services whose manifest lists `<service>.<method>`.
fn exposing(manifests: &Value, method: &str) -> Result<Vec<String>, RouterError> {
    let manifests: BTreeMap<String, ServiceManifest> = serde_json::from_value(manifests.clone())
        .map_err(|e| RouterError::Internal(anyhow::Error::new(e).context("decoding manifests")))?;
    Ok(manifests
        .into_iter()
        .filter(|(name, manifest)| manifest.exposes(&format!("{name}.{method}")))
        .map(|(name, _)| name)
        .collect())
}
