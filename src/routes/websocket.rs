use axum::{
    Extension, Router,
    extract::{Path, State, WebSocketUpgrade},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use uuid::Uuid;

use crate::{
    error::AppError,
    routes::auth::{Caller, optional_caller, require_caller},
    services::{identity::Identity, session_service, websocket_service},
    state::SharedState,
};

#[utoipa::path(
    get,
    path = "/ws/admin/{session_id}",
    tag = "websocket",
    params(
        ("session_id" = String, Path, description = "Session to drive"),
        ("token" = Option<String>, Query, description = "Bearer token when no Authorization header can be set")
    ),
    responses(
        (status = 101, description = "Switching protocols to WebSocket"),
        (status = 401, description = "Missing or invalid token"),
        (status = 403, description = "Session belongs to another admin")
    )
)]
/// Upgrade into the admin socket of a session, activating it first.
pub async fn admin_ws_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<Identity>,
    Path(session_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let live = session_service::open_admin_session(&state, &caller, session_id).await?;
    Ok(ws
        .on_upgrade(move |socket| websocket_service::handle_admin_socket(state, socket, live))
        .into_response())
}

#[utoipa::path(
    get,
    path = "/ws/play",
    tag = "websocket",
    params(("token" = Option<String>, Query, description = "Optional bearer token of a signed-in player")),
    responses(
        (status = 101, description = "Switching protocols to WebSocket"),
        (status = 401, description = "Invalid token")
    )
)]
/// Upgrade into a player socket. The first frame must join with an invitation code.
pub async fn player_ws_handler(
    State(state): State<SharedState>,
    Extension(Caller(identity)): Extension<Caller>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket_service::handle_player_socket(state, socket, identity))
}

/// Configure the WebSocket endpoints.
pub fn router(state: SharedState) -> Router<SharedState> {
    let admin = Router::<SharedState>::new()
        .route("/ws/admin/{session_id}", get(admin_ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_caller));
    let player = Router::<SharedState>::new()
        .route("/ws/play", get(player_ws_handler))
        .route_layer(middleware::from_fn_with_state(state, optional_caller));
    admin.merge(player)
}
