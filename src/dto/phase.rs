use serde::Serialize;
use utoipa::ToSchema;

use crate::state::state_machine::SessionPhase;

/// Publicly visible session phase exposed to clients (REST).
#[derive(Debug, Serialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisiblePhase {
    /// Lobby open, no question served yet or between resumptions.
    Waiting,
    /// Start requested, roster being checked.
    Starting,
    /// Countdown before a question opens.
    Countdown,
    /// Answer window open.
    Question,
    /// Results of the last question on screen.
    Scoring,
    /// Session over.
    Ended,
}

impl From<&SessionPhase> for VisiblePhase {
    fn from(value: &SessionPhase) -> Self {
        match value {
            SessionPhase::Waiting { .. } => VisiblePhase::Waiting,
            SessionPhase::Starting { .. } => VisiblePhase::Starting,
            SessionPhase::CountdownToQuestion { .. } => VisiblePhase::Countdown,
            SessionPhase::QuestionActive(_) => VisiblePhase::Question,
            SessionPhase::Scoring { .. } => VisiblePhase::Scoring,
            SessionPhase::Ended(_) => VisiblePhase::Ended,
        }
    }
}

/// Index of the question a phase refers to, if any.
pub fn phase_question_index(phase: &SessionPhase) -> Option<usize> {
    match phase {
        SessionPhase::CountdownToQuestion { index } | SessionPhase::Scoring { index, .. } => {
            Some(*index)
        }
        SessionPhase::QuestionActive(question) => Some(question.index),
        SessionPhase::Waiting { .. } | SessionPhase::Starting { .. } | SessionPhase::Ended(_) => {
            None
        }
    }
}
