use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    middleware,
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::session::{ActivationResponse, CreateSessionRequest, SessionSummary, TerminateResponse},
    error::AppError,
    routes::auth::require_caller,
    services::{identity::Identity, session_service},
    state::SharedState,
};

/// Session management endpoints for quiz admins.
pub fn router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/admin/sessions", post(create_session))
        .route("/admin/sessions/{id}", get(get_session))
        .route("/admin/sessions/{id}/activate", post(activate_session))
        .route("/admin/sessions/{id}/terminate", post(terminate_session))
        .route_layer(middleware::from_fn_with_state(state, require_caller))
}

/// Create a waiting session for one of the caller's quizzes.
#[utoipa::path(
    post,
    path = "/admin/sessions",
    tag = "admin",
    request_body = CreateSessionRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session created", body = SessionSummary),
        (status = 400, description = "Quiz has no questions"),
        (status = 403, description = "Quiz belongs to another admin"),
        (status = 404, description = "Quiz not found")
    )
)]
pub async fn create_session(
    State(state): State<SharedState>,
    Extension(caller): Extension<Identity>,
    Valid(Json(payload)): Valid<Json<CreateSessionRequest>>,
) -> Result<Json<SessionSummary>, AppError> {
    Ok(Json(
        session_service::create_session(&state, &caller, payload).await?,
    ))
}

/// Stored and live state of a session.
#[utoipa::path(
    get,
    path = "/admin/sessions/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "Session identifier")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session summary", body = SessionSummary),
        (status = 404, description = "Session not found")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Extension(caller): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSummary>, AppError> {
    Ok(Json(session_service::get_session(&state, &caller, id).await?))
}

/// Activate a session and return its invitation code. Repeat calls return the same code.
#[utoipa::path(
    post,
    path = "/admin/sessions/{id}/activate",
    tag = "admin",
    params(("id" = String, Path, description = "Session identifier")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session active", body = ActivationResponse),
        (status = 409, description = "Session already terminated"),
        (status = 503, description = "No invitation code could be reserved")
    )
)]
pub async fn activate_session(
    State(state): State<SharedState>,
    Extension(caller): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<ActivationResponse>, AppError> {
    Ok(Json(session_service::activate(&state, &caller, id).await?))
}

/// End a session, closing any open question and every socket.
#[utoipa::path(
    post,
    path = "/admin/sessions/{id}/terminate",
    tag = "admin",
    params(("id" = String, Path, description = "Session identifier")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session terminated", body = TerminateResponse),
        (status = 409, description = "Session already terminated")
    )
)]
pub async fn terminate_session(
    State(state): State<SharedState>,
    Extension(caller): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<TerminateResponse>, AppError> {
    Ok(Json(session_service::terminate(&state, &caller, id).await?))
}
