use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// Quiz header as stored by the authoring side; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuizEntity {
    /// Stable identifier for the quiz.
    pub id: Uuid,
    /// User that authored the quiz.
    pub owner_id: Uuid,
    /// Human readable quiz title.
    pub title: String,
}

/// How a question is graded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// Exactly one correct option.
    SingleChoice,
    /// Several correct options, partial credit per matching option.
    MultiSelect,
    /// Opinion poll; any answer is rewarded.
    Survey,
}

/// One question of a quiz, in the order it is served.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionEntity {
    /// Stable identifier for the question.
    pub id: Uuid,
    /// Quiz this question belongs to.
    pub quiz_id: Uuid,
    /// Position of the question inside the quiz (served ascending).
    pub order_index: u32,
    /// Prompt shown to players.
    pub text: String,
    /// Answer options, addressed by their index.
    pub options: Vec<String>,
    /// Indices into `options` that are considered correct.
    pub correct_keys: Vec<usize>,
    /// Grading mode.
    pub question_type: QuestionType,
    /// Answer window length in seconds.
    pub duration_secs: u32,
    /// Weight multiplier applied by the scoring engine.
    pub points_weight: u32,
    /// Optional media attached to the question.
    #[serde(default)]
    pub media_url: Option<String>,
}

/// Durable record of a quiz instance activated for live play.
///
/// The flat flags mirror the persisted shape; the engine reads them through
/// [`crate::state::session::SessionStatus`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEntity {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub admin_id: Uuid,
    /// Present only while the session is active.
    pub invitation_code: Option<u32>,
    pub is_active: bool,
    pub activated_from: Option<SystemTime>,
    /// Set once, on termination.
    pub activated_to: Option<SystemTime>,
    pub current_question_id: Option<Uuid>,
    pub is_question_active: bool,
    pub created_at: SystemTime,
}

impl SessionEntity {
    /// Build a fresh, never activated session record.
    pub fn waiting(quiz_id: Uuid, admin_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            quiz_id,
            admin_id,
            invitation_code: None,
            is_active: false,
            activated_from: None,
            activated_to: None,
            current_question_id: None,
            is_question_active: false,
            created_at: SystemTime::now(),
        }
    }
}

/// Result of the atomic activation compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The session is now active and holds the requested code.
    Activated,
    /// Another active session already holds the requested code.
    CodeTaken,
    /// The session was already active; its existing code is returned.
    AlreadyActive { code: u32 },
    /// The session has been terminated and can never be reactivated.
    Closed,
    /// The caller does not own the session.
    NotOwner,
    /// No session exists with this identifier.
    NotFound,
}

/// One player's membership in a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipationEntity {
    pub id: Uuid,
    pub session_id: Uuid,
    /// `None` for anonymous guests.
    pub user_id: Option<Uuid>,
    pub display_name: String,
    /// True when the participant is the session's own admin.
    pub is_host: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// One player's answer to one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseEntity {
    pub id: Uuid,
    pub participation_id: Uuid,
    pub question_id: Uuid,
    /// Selected option indices, ascending. Empty means not attempted.
    pub submitted_keys: Vec<usize>,
    pub response_time_ms: Option<u64>,
    pub calculated_score: Option<i64>,
    pub is_graded: bool,
}

impl ResponseEntity {
    /// Ungraded placeholder row created when a participant joins.
    pub fn pending(participation_id: Uuid, question_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            participation_id,
            question_id,
            submitted_keys: Vec::new(),
            response_time_ms: None,
            calculated_score: None,
            is_graded: false,
        }
    }

    /// Row for a question whose answer window closed before the participant
    /// joined: graded zero with no keys.
    pub fn missed(participation_id: Uuid, question_id: Uuid) -> Self {
        Self {
            calculated_score: Some(0),
            is_graded: true,
            ..Self::pending(participation_id, question_id)
        }
    }
}

/// Response rows a new participant starts with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseRows {
    /// Questions already closed; their rows are written graded zero.
    pub missed: Vec<Uuid>,
    /// Questions still to be answered; their rows start ungraded.
    pub pending: Vec<Uuid>,
}

impl ResponseRows {
    /// Every question still ahead of the participant.
    pub fn pending(question_ids: Vec<Uuid>) -> Self {
        Self {
            missed: Vec::new(),
            pending: question_ids,
        }
    }

    /// Split questions in serving order: the first `closed` are missed.
    pub fn split(question_ids: impl IntoIterator<Item = Uuid>, closed: usize) -> Self {
        let mut rows = Self::default();
        for (index, question_id) in question_ids.into_iter().enumerate() {
            if index < closed {
                rows.missed.push(question_id);
            } else {
                rows.pending.push(question_id);
            }
        }
        rows
    }
}

/// Values written by a single grading update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grade {
    pub submitted_keys: Vec<usize>,
    pub response_time_ms: u64,
    pub score: i64,
}
