//! Envelopes and payloads exchanged over the admin and player sockets.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_with::skip_serializing_none;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::{
    dao::models::{QuestionEntity, QuestionType},
    dto::{
        session::LeaderboardEntry,
        validation::{validate_display_name, validate_invitation_code},
    },
    error::ProtocolError,
    state::state_machine::EndReason,
};

/// UI area a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum Component {
    Waiting,
    Question,
    Score,
    Session,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Waiting => "Waiting",
            Component::Question => "Question",
            Component::Score => "Score",
            Component::Session => "Session",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize, ToSchema)]
/// Frame sent by clients: `{component, action, data}`.
pub struct InboundEnvelope {
    pub component: Component,
    pub action: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
}

impl InboundEnvelope {
    fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    fn data<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data)
            .map_err(|err| ProtocolError::InvalidPayload(err.to_string()))
    }

    fn unknown(self) -> ProtocolError {
        ProtocolError::UnknownAction {
            component: self.component.to_string(),
            action: self.action,
        }
    }
}

#[derive(Debug, Serialize)]
/// Frame sent by the server: `{component, event, data}`.
pub struct OutboundEnvelope<'a, T: Serialize> {
    pub component: Component,
    pub event: &'a str,
    pub data: &'a T,
}

/// Actions accepted on the admin socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    StartQuiz,
    GetQuizQuestions,
    SkipQuestion,
    ForceSkip,
    NextQuestion,
    Terminate,
}

impl AdminCommand {
    /// Decode an admin frame.
    pub fn from_json_str(text: &str) -> Result<Self, ProtocolError> {
        let envelope = InboundEnvelope::parse(text)?;
        let command = match (envelope.component, envelope.action.as_str()) {
            (Component::Waiting, "start_quiz") => AdminCommand::StartQuiz,
            (Component::Waiting, "get_quiz_questions") => AdminCommand::GetQuizQuestions,
            (Component::Question, "skip_question") => AdminCommand::SkipQuestion,
            (Component::Question, "force_skip") => AdminCommand::ForceSkip,
            (Component::Score, "next_question") => AdminCommand::NextQuestion,
            (Component::Session, "terminate") => AdminCommand::Terminate,
            _ => return Err(envelope.unknown()),
        };
        Ok(command)
    }
}

/// Actions accepted on a player socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCommand {
    Join(JoinRequest),
    SubmitAnswer(AnswerSubmission),
}

impl PlayerCommand {
    /// Decode and validate a player frame.
    pub fn from_json_str(text: &str) -> Result<Self, ProtocolError> {
        let envelope = InboundEnvelope::parse(text)?;
        match (envelope.component, envelope.action.as_str()) {
            (Component::Waiting, "join") => {
                let request: JoinRequest = envelope.data()?;
                request.validate()?;
                Ok(PlayerCommand::Join(request))
            }
            (Component::Question, "submit_answer") => {
                Ok(PlayerCommand::SubmitAnswer(envelope.data()?))
            }
            _ => Err(envelope.unknown()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, ToSchema)]
/// First frame of every player socket.
pub struct JoinRequest {
    /// Six digit invitation code.
    pub code: String,
    pub display_name: String,
    /// Participation id returned by an earlier `joined`, to resume as a guest.
    #[serde(default)]
    pub resume: Option<Uuid>,
}

impl JoinRequest {
    /// Numeric value of a validated code.
    pub fn code_value(&self) -> Option<u32> {
        self.code.parse().ok()
    }
}

impl Validate for JoinRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(e) = validate_invitation_code(&self.code) {
            errors.add("code", e);
        }
        if let Err(e) = validate_display_name(&self.display_name) {
            errors.add("display_name", e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, ToSchema)]
/// Answer to the currently open question.
pub struct AnswerSubmission {
    pub question_id: Uuid,
    /// Selected option indices; empty means no attempt.
    #[serde(default)]
    pub selected: Vec<usize>,
    /// Client-measured latency since the question was displayed.
    #[serde(default)]
    pub response_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InvitationCodePayload {
    pub code: u32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RosterEntry {
    pub participation_id: Uuid,
    pub display_name: String,
    pub connected: bool,
    pub is_host: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Players currently known to the session; `count` only covers connected players.
pub struct RosterPayload {
    pub count: usize,
    pub players: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QuizQuestionsPayload {
    pub questions: Vec<QuestionPayload>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReasonPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Synchronisation delay before a question opens.
pub struct CountdownPayload {
    pub question_index: usize,
    pub total: usize,
    pub seconds: u64,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, ToSchema)]
/// Question as displayed to clients. `correct_keys` is only sent to the admin.
pub struct QuestionPayload {
    pub question_id: Uuid,
    pub order_index: u32,
    pub text: String,
    pub options: Vec<String>,
    pub question_type: QuestionType,
    pub duration_secs: u32,
    /// Time left in the answer window when the message was built.
    pub remaining_ms: u64,
    pub media_url: Option<String>,
    pub correct_keys: Option<Vec<usize>>,
}

impl QuestionPayload {
    /// Player view of `question` with `remaining_ms` left.
    pub fn for_player(question: &QuestionEntity, remaining_ms: u64) -> Self {
        Self {
            question_id: question.id,
            order_index: question.order_index,
            text: question.text.clone(),
            options: question.options.clone(),
            question_type: question.question_type,
            duration_secs: question.duration_secs,
            remaining_ms,
            media_url: question.media_url.clone(),
            correct_keys: None,
        }
    }

    /// Admin view, which also reveals the correct keys.
    pub fn for_admin(question: &QuestionEntity, remaining_ms: u64) -> Self {
        Self {
            correct_keys: Some(question.correct_keys.clone()),
            ..Self::for_player(question, remaining_ms)
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AnswerProgressPayload {
    pub answered: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SkipPendingPayload {
    pub outstanding: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Standings sent to the admin when an answer window closes.
pub struct ScoreboardPayload {
    pub question_id: Uuid,
    pub leaderboard: Vec<LeaderboardEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EndReasonDto {
    QuizCompleted,
    AdminTerminated,
}

impl From<EndReason> for EndReasonDto {
    fn from(value: EndReason) -> Self {
        match value {
            EndReason::QuizCompleted => EndReasonDto::QuizCompleted,
            EndReason::AdminTerminated => EndReasonDto::AdminTerminated,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EndedPayload {
    pub reason: EndReasonDto,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl From<&ProtocolError> for ErrorPayload {
    fn from(err: &ProtocolError) -> Self {
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Acknowledges a player join; guests keep `participation_id` to resume later.
pub struct JoinedPayload {
    pub participation_id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The question is not the session's open question.
    Stale,
    /// The player already answered this question.
    Duplicate,
    /// An option index does not exist.
    InvalidOption,
    /// The grade could not be persisted; the player may resubmit.
    Unavailable,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AnswerRejectedPayload {
    pub reason: RejectReason,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, ToSchema)]
/// Per-player outcome sent when an answer window closes.
pub struct ResultPayload {
    pub question_id: Uuid,
    pub correct: bool,
    pub points: i64,
    pub total_score: i64,
    pub streak: u32,
    pub rank: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_actions_are_scoped_to_their_component() {
        assert_eq!(
            AdminCommand::from_json_str(r#"{"component":"Question","action":"force_skip"}"#)
                .unwrap(),
            AdminCommand::ForceSkip
        );
        let err =
            AdminCommand::from_json_str(r#"{"component":"Waiting","action":"force_skip"}"#)
                .unwrap_err();
        assert_eq!(err.kind(), "unknown_action");
        assert_eq!(
            AdminCommand::from_json_str("not json").unwrap_err().kind(),
            "malformed"
        );
    }

    #[test]
    fn join_frames_are_validated() {
        let ok = PlayerCommand::from_json_str(
            r#"{"component":"Waiting","action":"join","data":{"code":"482913","display_name":"Ana"}}"#,
        )
        .unwrap();
        match ok {
            PlayerCommand::Join(request) => assert_eq!(request.code_value(), Some(482_913)),
            other => panic!("unexpected command {other:?}"),
        }

        let err = PlayerCommand::from_json_str(
            r#"{"component":"Waiting","action":"join","data":{"code":"12","display_name":"Ana"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_payload");
    }

    #[test]
    fn answer_submission_defaults_to_no_attempt() {
        let id = Uuid::new_v4();
        let cmd = PlayerCommand::from_json_str(&format!(
            r#"{{"component":"Question","action":"submit_answer","data":{{"question_id":"{id}"}}}}"#
        ))
        .unwrap();
        assert_eq!(
            cmd,
            PlayerCommand::SubmitAnswer(AnswerSubmission {
                question_id: id,
                selected: Vec::new(),
                response_time_ms: 0,
            })
        );
    }

    #[test]
    fn player_question_payload_hides_correct_keys() {
        let question = QuestionEntity {
            id: Uuid::new_v4(),
            quiz_id: Uuid::new_v4(),
            order_index: 0,
            text: "2 + 2".into(),
            options: vec!["3".into(), "4".into()],
            correct_keys: vec![1],
            question_type: QuestionType::SingleChoice,
            duration_secs: 20,
            points_weight: 10,
            media_url: None,
        };
        let player = serde_json::to_value(QuestionPayload::for_player(&question, 20_000)).unwrap();
        assert!(player.get("correct_keys").is_none());
        assert!(player.get("media_url").is_none());

        let admin = serde_json::to_value(QuestionPayload::for_admin(&question, 20_000)).unwrap();
        assert_eq!(admin["correct_keys"], serde_json::json!([1]));
    }
}
