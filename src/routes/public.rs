use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use uuid::Uuid;

use crate::{
    dto::session::LeaderboardResponse, error::AppError, services::session_service,
    state::SharedState,
};

/// Read-only endpoints open to everyone.
pub fn router() -> Router<SharedState> {
    Router::new().route("/sessions/{id}/leaderboard", get(get_leaderboard))
}

/// Ranking of a session, live or finished.
#[utoipa::path(
    get,
    path = "/sessions/{id}/leaderboard",
    tag = "public",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Leaderboard", body = LeaderboardResponse),
        (status = 404, description = "Session not found")
    )
)]
pub async fn get_leaderboard(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LeaderboardResponse>, AppError> {
    Ok(Json(session_service::leaderboard(&state, id).await?))
}
