use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Quiz Live Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::admin::create_session,
        crate::routes::admin::get_session,
        crate::routes::admin::activate_session,
        crate::routes::admin::terminate_session,
        crate::routes::public::get_leaderboard,
        crate::routes::websocket::admin_ws_handler,
        crate::routes::websocket::player_ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::health::HealthStatus,
            crate::dto::session::CreateSessionRequest,
            crate::dto::session::SessionSummary,
            crate::dto::session::SessionStatusDto,
            crate::dto::session::LiveSummary,
            crate::dto::session::ActivationResponse,
            crate::dto::session::TerminateResponse,
            crate::dto::session::LeaderboardEntry,
            crate::dto::session::LeaderboardResponse,
            crate::dto::phase::VisiblePhase,
            crate::dto::ws::Component,
            crate::dto::ws::InboundEnvelope,
            crate::dto::ws::JoinRequest,
            crate::dto::ws::AnswerSubmission,
            crate::dto::ws::InvitationCodePayload,
            crate::dto::ws::RosterPayload,
            crate::dto::ws::RosterEntry,
            crate::dto::ws::QuizQuestionsPayload,
            crate::dto::ws::ReasonPayload,
            crate::dto::ws::CountdownPayload,
            crate::dto::ws::QuestionPayload,
            crate::dto::ws::AnswerProgressPayload,
            crate::dto::ws::SkipPendingPayload,
            crate::dto::ws::ScoreboardPayload,
            crate::dto::ws::EndedPayload,
            crate::dto::ws::EndReasonDto,
            crate::dto::ws::ErrorPayload,
            crate::dto::ws::JoinedPayload,
            crate::dto::ws::RejectReason,
            crate::dto::ws::AnswerRejectedPayload,
            crate::dto::ws::ResultPayload,
            crate::dao::models::QuestionType,
            crate::services::identity::Role,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "admin", description = "Session management for quiz admins"),
        (name = "public", description = "Read-only session data"),
        (name = "websocket", description = "Live admin and player sockets"),
    )
)]
pub struct ApiDoc;

/// Registers the `bearer` security scheme referenced by the admin routes.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_session_routes() {
        let doc = ApiDoc::openapi();
        for path in [
            "/admin/sessions",
            "/admin/sessions/{id}/activate",
            "/sessions/{id}/leaderboard",
            "/ws/play",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
