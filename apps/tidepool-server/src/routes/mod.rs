use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::json;
use tidepool_core::session::SessionSnapshot;
use tidepool_core::{ProtocolMessage, SessionError};
use tracing::warn;
use uuid::Uuid;

use crate::state::AppState;

const JSON_CONTENT_TYPE: &str = "application/json";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/debug/sessions", get(list_sessions))
        .route("/metrics", get(render_metrics))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", delete(invalidate_session))
        .route("/sessions/:id/ui", post(process_round))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    session_id: Uuid,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    active_sessions: usize,
    sessions: Vec<SessionSnapshot>,
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.store.snapshot();
    Json(SessionsResponse {
        active_sessions: sessions.len(),
        sessions,
    })
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn create_session(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.store.create();
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id(),
        }),
    )
}

async fn invalidate_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.store.invalidate(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("session not found"))
    }
}

async fn process_round(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let outcome = tokio::time::timeout(state.round_timeout, state.store.process(id, &body)).await;
    histogram!(
        "tidepool_round_duration_ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
    counter!("tidepool_rounds_total", 1);

    match outcome {
        Ok(Ok(response)) => {
            Ok(([(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], response).into_response())
        }
        Ok(Err(err)) => {
            counter!("tidepool_round_failures_total", 1, "kind" => err.kind());
            warn!(session_id = %id, error = %err, "round failed");
            Err(ApiError::Round(err))
        }
        Err(_) => {
            counter!("tidepool_round_failures_total", 1, "kind" => "timeout");
            warn!(session_id = %id, timeout_secs = state.round_timeout.as_secs(), "round timed out");
            Err(ApiError::RoundTimeout)
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    Round(SessionError),
    RoundTimeout,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(ApiErrorBody {
                    error: "not_found",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            // Round failures answer with the protocol's own error envelope.
            ApiError::Round(err) => (round_status(&err), Json(err.to_envelope())).into_response(),
            ApiError::RoundTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ProtocolMessage::error("server error", "round timed out")),
            )
                .into_response(),
        }
    }
}

fn round_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::UnknownSession(_) => StatusCode::NOT_FOUND,
        SessionError::Busy(_) => StatusCode::CONFLICT,
        SessionError::InvalidRequestCounter { .. } => StatusCode::PRECONDITION_FAILED,
        SessionError::Protocol(_) => StatusCode::BAD_REQUEST,
        SessionError::LifeCycle(_) | SessionError::Encode(_) | SessionError::Worker(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
