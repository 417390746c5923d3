//! DTO definitions used by the session REST API and documentation layer.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::SessionEntity,
    dto::{format_system_time, phase::VisiblePhase},
    state::session::SessionStatus,
};

/// Payload creating a new session for a quiz.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateSessionRequest {
    pub quiz_id: Uuid,
}

/// Durable lifecycle stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusDto {
    Waiting,
    Active,
    Closed,
}

impl From<&SessionStatus> for SessionStatusDto {
    fn from(value: &SessionStatus) -> Self {
        match value {
            SessionStatus::Waiting => SessionStatusDto::Waiting,
            SessionStatus::Active { .. } => SessionStatusDto::Active,
            SessionStatus::Closed { .. } => SessionStatusDto::Closed,
        }
    }
}

/// In-process view of a session served by this instance.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LiveSummary {
    pub phase: VisiblePhase,
    /// Position of the question being played, when one is.
    pub question_index: Option<usize>,
    pub total_questions: usize,
    pub connected_players: usize,
    pub registered_players: usize,
    pub admin_connected: bool,
}

/// Session summary returned to its admin.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionSummary {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub admin_id: Uuid,
    pub status: SessionStatusDto,
    pub invitation_code: Option<u32>,
    pub created_at: String,
    pub activated_from: Option<String>,
    pub activated_to: Option<String>,
    /// Present only while the session is live in this process.
    pub live: Option<LiveSummary>,
}

impl SessionSummary {
    pub fn new(entity: &SessionEntity, live: Option<LiveSummary>) -> Self {
        Self {
            id: entity.id,
            quiz_id: entity.quiz_id,
            admin_id: entity.admin_id,
            status: SessionStatusDto::from(&SessionStatus::from(entity)),
            invitation_code: entity.invitation_code,
            created_at: format_system_time(entity.created_at),
            activated_from: entity.activated_from.map(format_system_time),
            activated_to: entity.activated_to.map(format_system_time),
            live,
        }
    }
}

/// Code players use to join an activated session.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActivationResponse {
    pub session_id: Uuid,
    pub invitation_code: u32,
}

/// Outcome of a termination request.
#[derive(Debug, Serialize, ToSchema)]
pub struct TerminateResponse {
    pub session_id: Uuid,
    pub status: SessionStatusDto,
}

/// One ranked participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub participation_id: Uuid,
    pub display_name: String,
    pub score: i64,
    /// Sum of response times over attempted questions, used to break ties.
    pub total_response_time_ms: u64,
    /// Questions attempted.
    pub answered: u32,
}

/// Leaderboard of a session.
#[derive(Debug, Serialize, ToSchema)]
pub struct LeaderboardResponse {
    pub session_id: Uuid,
    pub entries: Vec<LeaderboardEntry>,
}
