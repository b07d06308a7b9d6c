//! Defines the Axum API routes and handlers.

use crate::motion::controller::{CommandError, SupervisorCommand};
use crate::web::controller_channel::ControllerRequest;
use crate::web::models::{CommandResponse, JogRequest};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::sync::{mpsc::Sender, oneshot};

pub type AppState = Sender<ControllerRequest>;

/// Creates the Axum router with all the API endpoints.
pub fn create_router(controller_tx: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/command", post(post_command))
        .route("/api/v1/jog", post(post_jog))
        .route("/api/v1/events", get(get_events))
        .with_state(controller_tx)
}

fn json_error(message: &str, status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Sends a request built around a fresh oneshot and waits for the reply.
async fn ask<T>(
    controller_tx: &AppState,
    build: impl FnOnce(oneshot::Sender<T>) -> ControllerRequest,
) -> Result<T, Response> {
    let (resp_tx, resp_rx) = oneshot::channel();
    if controller_tx.send(build(resp_tx)).await.is_err() {
        return Err(json_error("controller is not running", StatusCode::SERVICE_UNAVAILABLE));
    }
    resp_rx
        .await
        .map_err(|_| json_error("controller dropped the request", StatusCode::INTERNAL_SERVER_ERROR))
}

fn command_result(result: Result<(), CommandError>) -> Response {
    match result {
        Ok(()) => (StatusCode::OK, Json(CommandResponse { result: "ok" })).into_response(),
        Err(e) => json_error(&e.to_string(), StatusCode::CONFLICT),
    }
}

/// Handler to get the current status of the machine.
async fn get_status(State(controller_tx): State<AppState>) -> Response {
    match ask(&controller_tx, |respond_to| ControllerRequest::GetStatus { respond_to }).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(response) => response,
    }
}

async fn post_command(State(controller_tx): State<AppState>, Json(command): Json<SupervisorCommand>) -> Response {
    match ask(&controller_tx, |respond_to| ControllerRequest::Command { command, respond_to }).await {
        Ok(result) => command_result(result),
        Err(response) => response,
    }
}

async fn post_jog(State(controller_tx): State<AppState>, Json(jog): Json<JogRequest>) -> Response {
    let target = [jog.x, jog.y, jog.z];
    match ask(&controller_tx, |respond_to| ControllerRequest::Jog { target, respond_to }).await {
        Ok(result) => command_result(result),
        Err(response) => response,
    }
}

async fn get_events(State(controller_tx): State<AppState>) -> Response {
    match ask(&controller_tx, |respond_to| ControllerRequest::DrainEvents { respond_to }).await {
        Ok(events) => Json(events).into_response(),
        Err(response) => response,
    }
}
