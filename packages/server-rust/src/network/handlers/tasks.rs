//! Task scheduler endpoints.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::error::RouterError;

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub status: Option<String>,
}

/// `POST /tasks/schedule`
pub async fn schedule_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let task = state.control_call("scheduleTask", body).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /tasks/?status=`
pub async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Value>, ApiError> {
    let tasks = state
        .control_call("getTasks", json!({ "status": query.status }))
        .await?;
    Ok(Json(tasks))
}

/// `POST /tasks/execute-batch {status?}`; the status defaults to `scheduled`.
pub async fn execute_batch_handler(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let payload = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError(RouterError::from(e)))?
    };
    let report = state.control_call("executeBatch", payload).await?;
    Ok(Json(report))
}

/// `POST /tasks/delete-failed`
pub async fn delete_failed_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let deleted = state.control_call("deleteFailedTasks", Value::Null).await?;
    Ok(Json(deleted))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::bus::handler_fn;
    use crate::config::SchedulerConfig;
    use crate::network::handlers::tests::test_state;
    use crate::scheduler::TaskScheduler;
    use crate::storage::MemoryTaskStore;

    fn state_with_scheduler() -> AppState {
        let state = test_state();
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::clone(&state.bus),
            SchedulerConfig::default(),
        ));
        scheduler.register_commands(&state.bus, "control");
        state.bus.register("reports.build", handler_fn(|_| async { Ok(json!({ "status": "ok" })) }));
        state
    }

    fn body(key: &str) -> Value {
        json!({
            "name": "report",
            "payload": {},
            "scheduled": (Utc::now() - Duration::minutes(1)).to_rfc3339(),
            "handlerServiceName": "reports",
            "handlerName": "build",
            "idempotencyKey": key,
        })
    }

    #[tokio::test]
    async fn schedule_then_conflict() {
        let state = state_with_scheduler();
        let (status, Json(task)) = schedule_handler(State(state.clone()), Json(body("r1")))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["status"], "scheduled");

        let err = schedule_handler(State(state), Json(body("r1"))).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_task_is_bad_request() {
        let state = state_with_scheduler();
        let err = schedule_handler(State(state), Json(json!({ "name": "x" })))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn batch_then_list_and_cleanup() {
        let state = state_with_scheduler();
        schedule_handler(State(state.clone()), Json(body("a"))).await.unwrap();

        let Json(report) = execute_batch_handler(State(state.clone()), Bytes::new()).await.unwrap();
        assert_eq!(report["completed"], 1);

        let Json(done) = list_tasks_handler(
            State(state.clone()),
            Query(TaskQuery {
                status: Some("completed".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(done.as_array().unwrap().len(), 1);

        let Json(deleted) = delete_failed_handler(State(state)).await.unwrap();
        assert_eq!(deleted["deleted"], 0);
    }

    #[tokio::test]
    async fn unknown_status_filter_is_bad_request() {
        let state = state_with_scheduler();
        let err = list_tasks_handler(
            State(state),
            Query(TaskQuery {
                status: Some("finished".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
