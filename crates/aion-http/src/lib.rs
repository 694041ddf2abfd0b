//! HTTP control plane.
//!
//! Interface-only: the task manager owns all state, this crate just exposes
//! it over HTTP. `PUT /task/:name` hard-codes `Definition` and `Command`
//! rather than accepting them from the request body, a known extension
//! point a real deployment would need to lift, not a gap to silently paper
//! over.

use std::sync::Arc;

use aion_manager::Manager;
use aion_task::{Definition, Task};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Serialize;

/// The placeholder definition/command `PUT /task/:name` assigns every
/// created task.
const PLACEHOLDER_DEFINITION: &str = "* * * * *";
const PLACEHOLDER_COMMAND: &str = "Test command";

/// Build the router. `ready` flips to `true` once `main` has finished
/// `LoadAll` and joined gossip; `/healthz` reports it so an operator's
/// readiness probe doesn't route traffic before then.
pub fn router(manager: Arc<Manager>, ready: Arc<std::sync::atomic::AtomicBool>) -> Router {
    Router::new()
        .route("/info", get(info))
        .route("/task/:name", put(put_task))
        .route("/healthz", get(healthz))
        .with_state(AppState { manager, ready })
}

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
    ready: Arc<std::sync::atomic::AtomicBool>,
}

#[derive(Serialize)]
struct InfoResponse {
    members: Vec<String>,
    tasks: Vec<Task>,
}

async fn info(State(state): State<AppState>) -> Response {
    match state.manager.snapshot() {
        Ok(tasks) => Json(InfoResponse {
            members: state.manager.members(),
            tasks,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "GET /info failed to read LTS snapshot");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn put_task(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state
        .manager
        .add(
            name,
            Definition::new(PLACEHOLDER_DEFINITION),
            PLACEHOLDER_COMMAND,
        )
        .await
    {
        Ok(task) => Json(task).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "PUT /task failed, rolled-back transaction leaves no state");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(std::sync::atomic::Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
